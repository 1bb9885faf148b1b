//! `GpuBackend`: the capability interface pluggable GPU backends implement.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::health_event::HealthEvent;

/// Which tagged variant a backend is — selection is by configuration,
/// never by runtime type introspection (§9).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Injectable,
    Native,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Injectable => write!(f, "injectable"),
            BackendKind::Native => write!(f, "native"),
        }
    }
}

/// Immutable device identity, fixed at discovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    pub index: u32,
    pub uuid: String,
    pub name: String,
    pub pci_bus_id: String,
    pub memory_total_bytes: u64,
}

impl fmt::Display for DeviceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GPU{}", self.index)
    }
}

/// Point-in-time device reading. Never cached; recomputed on each query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceHealthSample {
    pub temperature_celsius: u32,
    pub power_watts: u32,
    pub memory_used_bytes: u64,
    pub memory_total_bytes: u64,
    /// Compute utilization, 0..=100.
    pub utilization_percent: u32,
    pub timestamp: DateTime<Utc>,
}

/// Errors surfaced by a `GpuBackend`. Device-level failures never crash
/// the agent (§7): they surface as an unhealthy local check.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("backend already initialized")]
    AlreadyInitialized,
    #[error("backend not initialized")]
    NotInitialized,
    #[error("device index {0} out of range")]
    DeviceNotFound(u32),
    #[error("query failed: {0}")]
    QueryFailed(String),
    #[error("backend initialization failed: {0}")]
    InitFailed(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Other(String),
}

/// Pluggable source of device inventory, live metrics, and health events.
///
/// `Initialize`/`Shutdown` bracket the backend's lifetime; operating
/// while uninitialized, or initializing twice, is an error. `
/// collect_health_events` drains the backend's internal buffer
/// atomically — the caller observes either all events produced up to
/// some instant, or none twice.
#[async_trait]
pub trait GpuBackend: Send + Sync {
    async fn initialize(&self) -> Result<(), DeviceError>;

    async fn shutdown(&self) -> Result<(), DeviceError>;

    async fn device_count(&self) -> Result<u32, DeviceError>;

    async fn device_info(&self, index: u32) -> Result<DeviceDescriptor, DeviceError>;

    async fn device_health(&self, index: u32) -> Result<DeviceHealthSample, DeviceError>;

    /// Returns all events buffered since the previous call and
    /// atomically clears the buffer.
    async fn collect_health_events(&self) -> Result<Vec<HealthEvent>, DeviceError>;

    fn kind(&self) -> BackendKind;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_descriptor_display() {
        let descriptor = DeviceDescriptor {
            index: 2,
            uuid: "GPU-abc".to_string(),
            name: "Test GPU".to_string(),
            pci_bus_id: "0000:01:00.0".to_string(),
            memory_total_bytes: 1 << 30,
        };
        assert_eq!(format!("{descriptor}"), "GPU2");
    }
}
