//! Component health for the power agent
//!
//! Tracks the monitor loop and the devices it reads, and answers the
//! liveness and readiness checks from the monitor's own heartbeat.

use crate::monitor::{PowerDataProvider, PowerMonitor};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Health status of a component
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    /// Component is functioning normally
    Healthy,
    /// Still producing data, but the last attempt failed
    Degraded,
    /// Component has failed
    Unhealthy,
}

impl ComponentStatus {
    /// Returns true if the component is at least partially operational
    pub fn is_operational(&self) -> bool {
        matches!(self, ComponentStatus::Healthy | ComponentStatus::Degraded)
    }
}

/// Information about a component's health
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub status: ComponentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl ComponentHealth {
    fn with_status(status: ComponentStatus, message: Option<String>) -> Self {
        Self {
            status,
            message,
            updated_at: Utc::now(),
        }
    }

    /// Create a healthy status
    pub fn healthy() -> Self {
        Self::with_status(ComponentStatus::Healthy, None)
    }

    /// Create a degraded status with the failure message
    pub fn degraded(message: impl Into<String>) -> Self {
        Self::with_status(ComponentStatus::Degraded, Some(message.into()))
    }

    /// Create an unhealthy status with the failure message
    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self::with_status(ComponentStatus::Unhealthy, Some(message.into()))
    }
}

/// Overall health response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: ComponentStatus,
    pub components: HashMap<String, ComponentHealth>,
}

impl HealthResponse {
    /// Worst status across components
    pub fn compute_status(components: &HashMap<String, ComponentHealth>) -> ComponentStatus {
        components
            .values()
            .map(|c| c.status)
            .fold(ComponentStatus::Healthy, |worst, status| match (worst, status) {
                (ComponentStatus::Unhealthy, _) | (_, ComponentStatus::Unhealthy) => {
                    ComponentStatus::Unhealthy
                }
                (ComponentStatus::Degraded, _) | (_, ComponentStatus::Degraded) => {
                    ComponentStatus::Degraded
                }
                _ => ComponentStatus::Healthy,
            })
    }
}

/// Readiness response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Liveness response, derived from the collection heartbeat
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LivenessResponse {
    pub live: bool,
    /// Time of the last published snapshot
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_collection: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Component names for health tracking
pub mod components {
    pub const MONITOR: &str = "monitor";
    pub const POWER_METER: &str = "power_meter";
    pub const RESOURCE_INFORMER: &str = "resource_informer";
}

/// Health registry for tracking component health
#[derive(Debug, Clone)]
pub struct HealthRegistry {
    components: Arc<RwLock<HashMap<String, ComponentHealth>>>,
    ready: Arc<RwLock<bool>>,
}

impl Default for HealthRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self {
            components: Arc::new(RwLock::new(HashMap::new())),
            ready: Arc::new(RwLock::new(false)),
        }
    }

    /// Register a component with initial healthy status
    pub async fn register(&self, name: &str) {
        self.update(name, ComponentHealth::healthy()).await;
    }

    /// Update component health status
    pub async fn update(&self, name: &str, health: ComponentHealth) {
        let mut components = self.components.write().await;
        components.insert(name.to_string(), health);
    }

    /// Mark component as healthy
    pub async fn set_healthy(&self, name: &str) {
        self.update(name, ComponentHealth::healthy()).await;
    }

    /// Mark component as degraded
    pub async fn set_degraded(&self, name: &str, message: impl Into<String>) {
        self.update(name, ComponentHealth::degraded(message)).await;
    }

    /// Mark component as unhealthy
    pub async fn set_unhealthy(&self, name: &str, message: impl Into<String>) {
        self.update(name, ComponentHealth::unhealthy(message)).await;
    }

    /// Flipped by the monitor loop once the first snapshot is published
    pub async fn set_ready(&self, ready: bool) {
        *self.ready.write().await = ready;
    }

    /// Get health response
    pub async fn health(&self) -> HealthResponse {
        let components = self.components.read().await.clone();
        let status = HealthResponse::compute_status(&components);
        HealthResponse { status, components }
    }

    /// Get readiness response from the registry alone
    pub async fn readiness(&self) -> ReadinessResponse {
        if !*self.ready.read().await {
            return ReadinessResponse {
                ready: false,
                reason: Some("no data yet".to_string()),
            };
        }
        if self.health().await.status == ComponentStatus::Unhealthy {
            return ReadinessResponse {
                ready: false,
                reason: Some("critical component unhealthy".to_string()),
            };
        }
        ReadinessResponse {
            ready: true,
            reason: None,
        }
    }

    /// Readiness that also requires the monitor to hold a snapshot
    pub async fn readiness_of(&self, monitor: &PowerMonitor) -> ReadinessResponse {
        if let Err(e) = monitor.is_ready() {
            return ReadinessResponse {
                ready: false,
                reason: Some(e.to_string()),
            };
        }
        self.readiness().await
    }
}

/// Liveness from the monitor heartbeat alone
pub fn liveness_of(monitor: &PowerMonitor) -> LivenessResponse {
    let last_collection = monitor.last_collection_time();
    match monitor.is_live() {
        Ok(()) => LivenessResponse {
            live: true,
            last_collection,
            reason: None,
        },
        Err(e) => LivenessResponse {
            live: false,
            last_collection,
            reason: Some(e.to_string()),
        },
    }
}
