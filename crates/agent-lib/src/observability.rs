//! Observability infrastructure for the power agent
//!
//! Provides:
//! - Prometheus self-metrics (tick latency, read errors, tracked workloads)
//! - Structured JSON logging with tracing

use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge_vec,
    Histogram, IntCounter, IntCounterVec, IntGaugeVec,
};
use std::sync::OnceLock;
use tracing::{info, warn};

/// Default histogram buckets for tick latency (in seconds)
const LATENCY_BUCKETS: &[f64] = &[
    0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5,
];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<MonitorMetricsInner> = OnceLock::new();

struct MonitorMetricsInner {
    tick_duration_seconds: Histogram,
    ticks: IntCounter,
    ticks_skipped: IntCounter,
    zone_read_errors: IntCounterVec,
    informer_errors: IntCounter,
    gpu_errors: IntCounter,
    workloads_tracked: IntGaugeVec,
    terminated_evictions: IntCounterVec,
}

impl MonitorMetricsInner {
    fn new() -> Self {
        Self {
            tick_duration_seconds: register_histogram!(
                "power_agent_tick_duration_seconds",
                "Time spent computing one snapshot",
                LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register tick_duration_seconds"),

            ticks: register_int_counter!(
                "power_agent_ticks_total",
                "Total number of snapshots published"
            )
            .expect("Failed to register ticks"),

            ticks_skipped: register_int_counter!(
                "power_agent_ticks_skipped_total",
                "Total number of ticks that did not publish a snapshot"
            )
            .expect("Failed to register ticks_skipped"),

            zone_read_errors: register_int_counter_vec!(
                "power_agent_zone_read_errors_total",
                "Total number of failed energy zone reads",
                &["zone"]
            )
            .expect("Failed to register zone_read_errors"),

            informer_errors: register_int_counter!(
                "power_agent_informer_errors_total",
                "Total number of failed resource refreshes"
            )
            .expect("Failed to register informer_errors"),

            gpu_errors: register_int_counter!(
                "power_agent_gpu_errors_total",
                "Total number of failed GPU reads"
            )
            .expect("Failed to register gpu_errors"),

            workloads_tracked: register_int_gauge_vec!(
                "power_agent_workloads_tracked",
                "Number of workloads in the latest snapshot",
                &["kind", "state"]
            )
            .expect("Failed to register workloads_tracked"),

            terminated_evictions: register_int_counter_vec!(
                "power_agent_terminated_evictions_total",
                "Total number of terminated workloads evicted from a full tracker",
                &["kind"]
            )
            .expect("Failed to register terminated_evictions"),
        }
    }
}

/// Monitor self-metrics for Prometheus exposition
///
/// Lightweight handle to the global metrics instance; clones share it.
#[derive(Clone)]
pub struct MonitorMetrics {
    _private: (),
}

impl Default for MonitorMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl MonitorMetrics {
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(MonitorMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &MonitorMetricsInner {
        GLOBAL_METRICS.get_or_init(MonitorMetricsInner::new)
    }

    pub fn observe_tick(&self, duration_secs: f64) {
        self.inner().tick_duration_seconds.observe(duration_secs);
        self.inner().ticks.inc();
    }

    pub fn inc_ticks_skipped(&self) {
        self.inner().ticks_skipped.inc();
    }

    pub fn inc_zone_read_errors(&self, zone: &str) {
        self.inner()
            .zone_read_errors
            .with_label_values(&[zone])
            .inc();
    }

    pub fn inc_informer_errors(&self) {
        self.inner().informer_errors.inc();
    }

    pub fn inc_gpu_errors(&self, count: u64) {
        self.inner().gpu_errors.inc_by(count);
    }

    /// Update workload counts for one kind (process, container, pod, vm)
    pub fn set_workloads(&self, kind: &str, running: usize, terminated: usize) {
        let gauge = &self.inner().workloads_tracked;
        gauge.with_label_values(&[kind, "running"]).set(running as i64);
        gauge
            .with_label_values(&[kind, "terminated"])
            .set(terminated as i64);
    }

    pub fn inc_terminated_evictions(&self, kind: &str, count: u64) {
        self.inner()
            .terminated_evictions
            .with_label_values(&[kind])
            .inc_by(count);
    }
}

/// Structured logger for agent events
#[derive(Clone)]
pub struct StructuredLogger {
    node_name: String,
}

impl StructuredLogger {
    pub fn new(node_name: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
        }
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    /// Log agent startup
    pub fn log_startup(&self, version: &str, meter: &str, zones: &[String]) {
        info!(
            event = "agent_started",
            node = %self.node_name,
            agent_version = %version,
            meter = %meter,
            zones = ?zones,
            "Power agent started"
        );
    }

    /// Log agent shutdown
    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "agent_shutdown",
            node = %self.node_name,
            reason = %reason,
            "Power agent shutting down"
        );
    }

    /// Log a tick that kept the previous snapshot
    pub fn log_tick_skipped(&self, error: &str) {
        warn!(
            event = "tick_skipped",
            node = %self.node_name,
            error = %error,
            "Snapshot not refreshed, keeping previous"
        );
    }

    /// Log evictions from a full terminated tracker
    pub fn log_terminated_evicted(&self, kind: &str, ids: &[String]) {
        info!(
            event = "terminated_evicted",
            node = %self.node_name,
            kind = %kind,
            count = ids.len(),
            ids = ?ids,
            "Terminated workloads evicted"
        );
    }
}
