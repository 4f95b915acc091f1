//! Sampling loop
//!
//! Drives `PowerMonitor::refresh` on a fixed ticker. Ticks never overlap and
//! are never interrupted; shutdown is only observed between ticks.

use super::PowerMonitor;
use crate::error::MonitorError;
use crate::health::{components, HealthRegistry};
use crate::observability::StructuredLogger;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Monitor loop state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    /// Waiting for the next tick
    Idle,
    /// A refresh is in flight
    Sampling,
    ShuttingDown,
    Stopped,
}

/// Drives `PowerMonitor::refresh` on a fixed interval
pub struct MonitorLoop {
    monitor: Arc<PowerMonitor>,
    health: Option<HealthRegistry>,
    logger: Option<StructuredLogger>,
    state_tx: watch::Sender<LoopState>,
}

impl MonitorLoop {
    pub fn new(monitor: Arc<PowerMonitor>) -> Self {
        let (state_tx, _) = watch::channel(LoopState::Idle);
        Self {
            monitor,
            health: None,
            logger: None,
            state_tx,
        }
    }

    /// Report tick outcomes to a health registry
    pub fn with_health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    pub fn with_logger(mut self, logger: StructuredLogger) -> Self {
        self.logger = Some(logger);
        self
    }

    /// Subscribe to loop state changes
    pub fn state(&self) -> watch::Receiver<LoopState> {
        self.state_tx.subscribe()
    }

    fn set_state(&self, state: LoopState) {
        self.state_tx.send_replace(state);
    }

    /// Run until `shutdown` fires or its sender is dropped
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            interval_ms = self.monitor.interval().as_millis() as u64,
            meter = %self.monitor.meter_name(),
            "Starting power monitor loop"
        );

        let mut ticker = interval(self.monitor.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.recv() => {
                    info!("Shutting down power monitor loop");
                    break;
                }
                _ = ticker.tick() => {
                    self.set_state(LoopState::Sampling);
                    self.tick().await;
                    self.set_state(LoopState::Idle);
                }
            }
        }

        self.set_state(LoopState::ShuttingDown);
        if let Some(logger) = &self.logger {
            logger.log_shutdown("shutdown signal received");
        }
        self.set_state(LoopState::Stopped);
    }

    async fn tick(&self) {
        match self.monitor.refresh().await {
            Ok(snapshot) => {
                debug!(timestamp = %snapshot.timestamp, "Tick complete");
                if let Some(health) = &self.health {
                    for component in [
                        components::MONITOR,
                        components::POWER_METER,
                        components::RESOURCE_INFORMER,
                    ] {
                        health.set_healthy(component).await;
                    }
                    health.set_ready(true).await;
                }
            }
            Err(e) => {
                match &self.logger {
                    Some(logger) => logger.log_tick_skipped(&e.to_string()),
                    None => warn!(error = %e, "Tick skipped, keeping previous snapshot"),
                }
                if let Some(health) = &self.health {
                    let source = match &e {
                        MonitorError::Informer(_) => Some(components::RESOURCE_INFORMER),
                        MonitorError::Zones(_) => Some(components::POWER_METER),
                        _ => None,
                    };
                    if let Some(source) = source {
                        health.set_degraded(source, e.to_string()).await;
                    }
                    health
                        .set_degraded(components::MONITOR, e.to_string())
                        .await;
                }
            }
        }
    }
}
