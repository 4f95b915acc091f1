//! Agent configuration

use agent_lib::device::DEFAULT_POWERCAP_PATH;
use agent_lib::monitor::MonitorConfig;
use agent_lib::units::Energy;
use anyhow::{bail, Result};
use serde::Deserialize;
use std::time::Duration;

/// Source of node energy readings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MeterKind {
    /// RAPL counters under powercap sysfs
    Rapl,
    /// Synthetic counters for development machines
    Fake,
}

/// Agent configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Node name from Kubernetes downward API
    #[serde(default = "default_node_name")]
    pub node_name: String,

    /// API server port for health/metrics
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// Sampling interval in seconds
    #[serde(default = "default_interval")]
    pub interval_secs: u64,

    /// Slack on top of two intervals before liveness fails
    #[serde(default = "default_max_staleness")]
    pub max_staleness_ms: u64,

    /// Terminated workloads kept per kind, 0 disables
    #[serde(default = "default_max_terminated")]
    pub max_terminated: usize,

    #[serde(default = "default_min_terminated_energy")]
    pub min_terminated_energy_joules: f64,

    #[serde(default = "default_meter")]
    pub meter: MeterKind,

    /// Base power of each zone when `meter` is `fake`
    #[serde(default = "default_fake_watts")]
    pub fake_watts: f64,

    #[serde(default = "default_proc_path")]
    pub proc_path: String,

    #[serde(default = "default_powercap_path")]
    pub powercap_path: String,

    /// Comma separated RAPL zone names to keep, empty keeps all
    #[serde(default)]
    pub rapl_zones: String,

    /// Also print node power to stdout after every tick
    #[serde(default)]
    pub stdout: bool,
}

fn default_node_name() -> String {
    std::env::var("NODE_NAME").unwrap_or_else(|_| "unknown".to_string())
}

fn default_api_port() -> u16 {
    8080
}

fn default_interval() -> u64 {
    5
}

fn default_max_staleness() -> u64 {
    500
}

fn default_max_terminated() -> usize {
    500
}

fn default_min_terminated_energy() -> f64 {
    10.0
}

fn default_meter() -> MeterKind {
    MeterKind::Rapl
}

fn default_fake_watts() -> f64 {
    25.0
}

fn default_proc_path() -> String {
    "/proc".to_string()
}

fn default_powercap_path() -> String {
    DEFAULT_POWERCAP_PATH.to_string()
}

impl AgentConfig {
    /// Load configuration from `AGENT_*` environment variables
    pub fn load() -> Result<Self> {
        Self::from_source(config::Environment::with_prefix("AGENT"))
    }

    fn from_source<S>(source: S) -> Result<Self>
    where
        S: config::Source + Send + Sync + 'static,
    {
        let config = config::Config::builder().add_source(source).build()?;
        Ok(config.try_deserialize()?)
    }

    pub fn rapl_zone_filter(&self) -> Vec<String> {
        self.rapl_zones
            .split(',')
            .map(str::trim)
            .filter(|z| !z.is_empty())
            .map(str::to_string)
            .collect()
    }

    /// Engine settings, validated
    pub fn monitor_config(&self) -> Result<MonitorConfig> {
        let threshold = self.min_terminated_energy_joules;
        if !threshold.is_finite() || threshold < 0.0 {
            bail!(
                "min_terminated_energy_joules must be a non-negative number, got {}",
                threshold
            );
        }

        let config = MonitorConfig {
            interval: Duration::from_secs(self.interval_secs),
            max_staleness: Duration::from_millis(self.max_staleness_ms),
            max_terminated: self.max_terminated,
            min_terminated_energy_threshold: Energy::from_joules(threshold),
        };
        config.validate()?;
        Ok(config)
    }
}
