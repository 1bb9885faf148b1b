//! Injectable `GpuBackend`, for tests and local development.
//!
//! All interior state is mutex/atomic-protected so the backend can be
//! shared across the agent's loops exactly like the native backend.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::device::interface::{BackendKind, DeviceDescriptor, DeviceError, DeviceHealthSample, GpuBackend};
use crate::health_event::{EventType, HealthEvent, MetricValue, SystemClassifier};

const DEFAULT_MEMORY_TOTAL_BYTES: u64 = 16 * 1024 * 1024 * 1024;
const DEFAULT_BASELINE_TEMPERATURE: u32 = 45;

fn deterministic_uuid(device_name: &str, index: u32) -> String {
    format!("GPU-INJECT-{device_name}-{index:04}")
}

fn deterministic_pci_bus_id(index: u32) -> String {
    format!("0000:{:02x}:00.0", index)
}

struct InjectableState {
    initialized: bool,
    boot_error: Option<String>,
    backend_error: Option<String>,
    device_errors: HashMap<u32, String>,
    device_temperatures: HashMap<u32, u32>,
    events: Vec<HealthEvent>,
}

/// Configurable fake `GpuBackend` used by tests and `NAVARCH_FAKE_GPU=true`.
pub struct InjectableBackend {
    device_count: u32,
    device_name: String,
    baseline_temperature: AtomicU32,
    boot_failed: AtomicBool,
    state: RwLock<InjectableState>,
}

impl InjectableBackend {
    pub fn new(device_count: u32, device_name: impl Into<String>) -> Self {
        Self {
            device_count,
            device_name: device_name.into(),
            baseline_temperature: AtomicU32::new(DEFAULT_BASELINE_TEMPERATURE),
            boot_failed: AtomicBool::new(false),
            state: RwLock::new(InjectableState {
                initialized: false,
                boot_error: None,
                backend_error: None,
                device_errors: HashMap::new(),
                device_temperatures: HashMap::new(),
                events: Vec::new(),
            }),
        }
    }

    fn descriptor(&self, index: u32) -> DeviceDescriptor {
        DeviceDescriptor {
            index,
            uuid: deterministic_uuid(&self.device_name, index),
            name: self.device_name.clone(),
            pci_bus_id: deterministic_pci_bus_id(index),
            memory_total_bytes: DEFAULT_MEMORY_TOTAL_BYTES,
        }
    }

    pub fn set_baseline_temperature(&self, celsius: u32) {
        self.baseline_temperature.store(celsius, Ordering::SeqCst);
    }

    pub async fn set_device_temperature(&self, index: u32, celsius: u32) {
        self.state.write().await.device_temperatures.insert(index, celsius);
    }

    pub async fn clear_device_temperature(&self, index: u32) {
        self.state.write().await.device_temperatures.remove(&index);
    }

    /// Causes the next `initialize()` call to fail with `message`.
    pub async fn inject_boot_error(&self, message: impl Into<String>) {
        self.state.write().await.boot_error = Some(message.into());
    }

    pub async fn clear_boot_error(&self) {
        self.state.write().await.boot_error = None;
    }

    /// Causes every subsequent query to fail with `message`, across all
    /// devices, until cleared.
    pub async fn inject_backend_error(&self, message: impl Into<String>) {
        self.state.write().await.backend_error = Some(message.into());
    }

    pub async fn clear_backend_error(&self) {
        self.state.write().await.backend_error = None;
    }

    pub async fn inject_device_error(&self, index: u32, message: impl Into<String>) {
        self.state.write().await.device_errors.insert(index, message.into());
    }

    pub async fn clear_device_error(&self, index: u32) {
        self.state.write().await.device_errors.remove(&index);
    }

    /// Clears every injected failure (boot, backend, and per-device).
    pub async fn clear_all_failures(&self) {
        let mut state = self.state.write().await;
        state.boot_error = None;
        state.backend_error = None;
        state.device_errors.clear();
    }

    pub async fn has_active_failures(&self) -> bool {
        let state = self.state.read().await;
        state.boot_error.is_some() || state.backend_error.is_some() || !state.device_errors.is_empty()
    }

    async fn push_event(&self, event: HealthEvent) {
        self.state.write().await.events.push(event);
    }

    pub async fn inject_xid(&self, gpu_index: i32, code: u32, message: impl Into<String>) {
        self.inject_xid_at(Utc::now(), gpu_index, code, message).await;
    }

    pub async fn inject_xid_at(&self, timestamp: DateTime<Utc>, gpu_index: i32, code: u32, message: impl Into<String>) {
        let uuid = self.uuid_for(gpu_index);
        self.push_event(HealthEvent::xid_at(timestamp, gpu_index, uuid, code, message)).await;
    }

    pub async fn inject_thermal(&self, gpu_index: i32, temperature: i64, message: impl Into<String>) {
        self.inject_thermal_at(Utc::now(), gpu_index, temperature, message).await;
    }

    pub async fn inject_thermal_at(
        &self,
        timestamp: DateTime<Utc>,
        gpu_index: i32,
        temperature: i64,
        message: impl Into<String>,
    ) {
        let uuid = self.uuid_for(gpu_index);
        self.push_event(HealthEvent::thermal_at(timestamp, gpu_index, uuid, temperature, message))
            .await;
    }

    pub async fn inject_memory_ecc(&self, gpu_index: i32, sbe: i64, dbe: i64, message: impl Into<String>) {
        self.inject_memory_ecc_at(Utc::now(), gpu_index, sbe, dbe, message).await;
    }

    pub async fn inject_memory_ecc_at(
        &self,
        timestamp: DateTime<Utc>,
        gpu_index: i32,
        sbe: i64,
        dbe: i64,
        message: impl Into<String>,
    ) {
        let uuid = self.uuid_for(gpu_index);
        self.push_event(HealthEvent::memory_ecc_at(timestamp, gpu_index, uuid, sbe, dbe, message))
            .await;
    }

    pub async fn inject_nvlink(&self, gpu_index: i32, link_id: i64, message: impl Into<String>) {
        self.inject_nvlink_at(Utc::now(), gpu_index, link_id, message).await;
    }

    pub async fn inject_nvlink_at(&self, timestamp: DateTime<Utc>, gpu_index: i32, link_id: i64, message: impl Into<String>) {
        let uuid = self.uuid_for(gpu_index);
        self.push_event(HealthEvent::nvlink_at(timestamp, gpu_index, uuid, link_id, message)).await;
    }

    pub async fn inject_power(&self, gpu_index: i32, watts: i64, message: impl Into<String>) {
        self.inject_power_at(Utc::now(), gpu_index, watts, message).await;
    }

    pub async fn inject_power_at(&self, timestamp: DateTime<Utc>, gpu_index: i32, watts: i64, message: impl Into<String>) {
        let uuid = self.uuid_for(gpu_index);
        self.push_event(HealthEvent::power_at(timestamp, gpu_index, uuid, watts, message)).await;
    }

    pub async fn inject_custom(
        &self,
        gpu_index: i32,
        system: SystemClassifier,
        event_type: EventType,
        metrics: HashMap<String, MetricValue>,
        message: impl Into<String>,
    ) {
        let uuid = self.uuid_for(gpu_index);
        self.push_event(HealthEvent::custom(gpu_index, uuid, system, event_type, metrics, message))
            .await;
    }

    fn uuid_for(&self, gpu_index: i32) -> String {
        if gpu_index < 0 {
            String::new()
        } else {
            deterministic_uuid(&self.device_name, gpu_index as u32)
        }
    }
}

#[async_trait]
impl GpuBackend for InjectableBackend {
    async fn initialize(&self) -> Result<(), DeviceError> {
        let mut state = self.state.write().await;
        if state.initialized {
            return Err(DeviceError::AlreadyInitialized);
        }
        if let Some(message) = state.boot_error.clone() {
            self.boot_failed.store(true, Ordering::SeqCst);
            return Err(DeviceError::InitFailed(message));
        }
        state.initialized = true;
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), DeviceError> {
        let mut state = self.state.write().await;
        if !state.initialized {
            return Err(DeviceError::NotInitialized);
        }
        state.initialized = false;
        Ok(())
    }

    async fn device_count(&self) -> Result<u32, DeviceError> {
        let state = self.state.read().await;
        if !state.initialized {
            return Err(DeviceError::NotInitialized);
        }
        if let Some(message) = &state.backend_error {
            return Err(DeviceError::QueryFailed(message.clone()));
        }
        Ok(self.device_count)
    }

    async fn device_info(&self, index: u32) -> Result<DeviceDescriptor, DeviceError> {
        let state = self.state.read().await;
        if !state.initialized {
            return Err(DeviceError::NotInitialized);
        }
        if let Some(message) = &state.backend_error {
            return Err(DeviceError::QueryFailed(message.clone()));
        }
        if index >= self.device_count {
            return Err(DeviceError::DeviceNotFound(index));
        }
        Ok(self.descriptor(index))
    }

    async fn device_health(&self, index: u32) -> Result<DeviceHealthSample, DeviceError> {
        let state = self.state.read().await;
        if !state.initialized {
            return Err(DeviceError::NotInitialized);
        }
        if let Some(message) = &state.backend_error {
            return Err(DeviceError::QueryFailed(message.clone()));
        }
        if index >= self.device_count {
            return Err(DeviceError::DeviceNotFound(index));
        }
        if let Some(message) = state.device_errors.get(&index) {
            return Err(DeviceError::QueryFailed(message.clone()));
        }

        let temperature = state
            .device_temperatures
            .get(&index)
            .copied()
            .unwrap_or_else(|| self.baseline_temperature.load(Ordering::SeqCst));

        Ok(DeviceHealthSample {
            temperature_celsius: temperature,
            power_watts: 150,
            memory_used_bytes: 4 * 1024 * 1024 * 1024,
            memory_total_bytes: DEFAULT_MEMORY_TOTAL_BYTES,
            utilization_percent: 25,
            timestamp: Utc::now(),
        })
    }

    async fn collect_health_events(&self) -> Result<Vec<HealthEvent>, DeviceError> {
        let mut state = self.state.write().await;
        if !state.initialized {
            return Err(DeviceError::NotInitialized);
        }
        Ok(std::mem::take(&mut state.events))
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Injectable
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn ready_backend(count: u32) -> InjectableBackend {
        let backend = InjectableBackend::new(count, "test-gpu");
        backend.initialize().await.unwrap();
        backend
    }

    #[tokio::test]
    async fn lists_configured_device_count() {
        let backend = ready_backend(3).await;
        assert_eq!(backend.device_count().await.unwrap(), 3);
        let descriptor = backend.device_info(1).await.unwrap();
        assert_eq!(descriptor.index, 1);
        assert_eq!(descriptor.uuid, "GPU-INJECT-test-gpu-0001");
    }

    #[tokio::test]
    async fn out_of_range_device_is_an_error() {
        let backend = ready_backend(2).await;
        assert!(matches!(backend.device_info(5).await, Err(DeviceError::DeviceNotFound(5))));
    }

    #[tokio::test]
    async fn double_initialize_is_an_error() {
        let backend = ready_backend(1).await;
        assert!(matches!(backend.initialize().await, Err(DeviceError::AlreadyInitialized)));
    }

    #[tokio::test]
    async fn query_before_initialize_is_an_error() {
        let backend = InjectableBackend::new(1, "test-gpu");
        assert!(matches!(backend.device_count().await, Err(DeviceError::NotInitialized)));
    }

    #[tokio::test]
    async fn boot_error_fails_initialize() {
        let backend = InjectableBackend::new(1, "test-gpu");
        backend.inject_boot_error("NVML init failed").await;
        assert!(matches!(backend.initialize().await, Err(DeviceError::InitFailed(_))));
    }

    #[tokio::test]
    async fn per_device_error_only_affects_that_device() {
        let backend = ready_backend(2).await;
        backend.inject_device_error(0, "thermal sensor fault").await;

        assert!(backend.device_health(0).await.is_err());
        assert!(backend.device_health(1).await.is_ok());
        assert!(backend.has_active_failures().await);

        backend.clear_device_error(0).await;
        assert!(backend.device_health(0).await.is_ok());
        assert!(!backend.has_active_failures().await);
    }

    #[tokio::test]
    async fn temperature_override_applies_per_device() {
        let backend = ready_backend(2).await;
        backend.set_baseline_temperature(40);
        backend.set_device_temperature(1, 96).await;

        assert_eq!(backend.device_health(0).await.unwrap().temperature_celsius, 40);
        assert_eq!(backend.device_health(1).await.unwrap().temperature_celsius, 96);
    }

    #[tokio::test]
    async fn collect_health_events_drains_exactly_once() {
        let backend = ready_backend(1).await;
        backend.inject_xid(0, 79, "fatal").await;
        backend.inject_thermal(0, 96, "hot").await;

        let drained = backend.collect_health_events().await.unwrap();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].event_type, EventType::Xid);
        assert_eq!(drained[1].event_type, EventType::Thermal);

        let second_drain = backend.collect_health_events().await.unwrap();
        assert!(second_drain.is_empty());
    }

    #[tokio::test]
    async fn clear_all_failures_resets_everything() {
        let backend = ready_backend(1).await;
        backend.inject_backend_error("offline").await;
        backend.inject_device_error(0, "fault").await;
        assert!(backend.has_active_failures().await);

        backend.clear_all_failures().await;
        assert!(!backend.has_active_failures().await);
    }
}
