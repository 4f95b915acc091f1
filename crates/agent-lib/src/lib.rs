//! Agent library for node power attribution
//!
//! This crate provides the core functionality for:
//! - Reading energy counters from RAPL zones and GPUs
//! - Discovering processes, containers, pods and VMs from procfs
//! - Attributing node energy to workloads by CPU-time share
//! - Publishing consistent snapshots and exporting them to Prometheus or stdout
//! - Health checks and observability

pub mod device;
pub mod error;
pub mod exporter;
pub mod health;
pub mod monitor;
pub mod observability;
pub mod resource;
pub mod stdout;
pub mod units;

pub use error::{MonitorError, Result};
pub use exporter::PowerCollector;
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, LivenessResponse,
    ReadinessResponse,
};
pub use monitor::{
    MonitorConfig, MonitorLoop, PowerDataProvider, PowerMonitor, PowerMonitorBuilder, Snapshot,
};
pub use observability::{MonitorMetrics, StructuredLogger};
pub use stdout::StdoutExporter;
pub use units::{Energy, Power};
