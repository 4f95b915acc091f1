//! Error types for the power monitor

use std::time::Duration;

/// Errors returned by the power monitor
#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    #[error("invalid monitor configuration: {0}")]
    InvalidConfig(String),

    /// Nothing has been published yet
    #[error("no data yet")]
    NoData,

    #[error("no collection heartbeat yet")]
    NoHeartbeat,

    #[error("collector stalled: last collection {age:?} ago exceeds {limit:?}")]
    CollectorStalled { age: Duration, limit: Duration },

    #[error("failed to list energy zones: {0}")]
    Zones(anyhow::Error),

    #[error("resource informer failed: {0}")]
    Informer(anyhow::Error),

    #[error("snapshot lock poisoned")]
    LockPoisoned,
}

pub type Result<T> = std::result::Result<T, MonitorError>;
