//! Power Agent - per-node workload power attribution
//!
//! Runs as a DaemonSet on each Kubernetes node, reading RAPL energy
//! counters and attributing them to processes, containers, pods and VMs.

use agent_lib::{
    device::{FakePowerMeter, PowerMeter, PowercapPowerMeter},
    exporter::PowerCollector,
    health::{components, HealthRegistry},
    monitor::{MonitorLoop, PowerDataProvider, PowerMonitor},
    observability::StructuredLogger,
    resource::ProcfsInformer,
    stdout::StdoutExporter,
};
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod api;
mod config;

use config::{AgentConfig, MeterKind};

const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

fn create_meter(config: &AgentConfig) -> Result<Arc<dyn PowerMeter>> {
    match config.meter {
        MeterKind::Rapl => {
            let meter = PowercapPowerMeter::with_zone_filter(
                &config.powercap_path,
                &config.rapl_zone_filter(),
            )
            .with_context(|| format!("no usable RAPL zones under {}", config.powercap_path))?;
            Ok(Arc::new(meter))
        }
        MeterKind::Fake => {
            info!(watts = config.fake_watts, "Using fake power meter");
            Ok(Arc::new(FakePowerMeter::free_running(
                &["package", "dram"],
                config.fake_watts,
            )))
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting power-agent");

    let config = AgentConfig::load()?;
    info!(node_name = %config.node_name, meter = ?config.meter, "Agent configured");

    let logger = StructuredLogger::new(&config.node_name);

    let monitor = Arc::new(
        PowerMonitor::builder()
            .config(config.monitor_config()?)
            .power_meter(create_meter(&config)?)
            .resource_informer(Arc::new(ProcfsInformer::new(&config.proc_path)))
            .logger(logger.clone())
            .build()?,
    );
    prometheus::register(Box::new(PowerCollector::new(monitor.clone())?))?;

    let health_registry = HealthRegistry::new();
    health_registry.register(components::MONITOR).await;
    health_registry.register(components::POWER_METER).await;
    health_registry.register(components::RESOURCE_INFORMER).await;

    logger.log_startup(AGENT_VERSION, monitor.meter_name(), &monitor.zone_names());

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let monitor_loop = MonitorLoop::new(monitor.clone())
        .with_health(health_registry.clone())
        .with_logger(logger.clone());
    let loop_handle = tokio::spawn(monitor_loop.run(shutdown_rx));

    let stdout_handle = config.stdout.then(|| {
        let exporter = StdoutExporter::new(monitor.clone());
        tokio::spawn(exporter.run(shutdown_tx.subscribe()))
    });

    let app_state = Arc::new(api::AppState::new(health_registry, monitor));
    let api_handle = tokio::spawn(api::serve(config.api_port, app_state));

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");

    // The in-flight tick finishes before the loop exits
    let _ = shutdown_tx.send(());
    loop_handle.await?;
    if let Some(handle) = stdout_handle {
        handle.await?;
    }
    api_handle.abort();

    Ok(())
}
