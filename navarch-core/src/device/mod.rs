//! Device abstraction layer.
//!
//! Provides a unified capability interface for GPU backends, selected by
//! configuration — never by runtime type introspection (§9).

mod injectable;
mod interface;
mod native;

pub use injectable::InjectableBackend;
pub use interface::*;
pub use native::NativeBackend;

use std::sync::Arc;

use crate::clock::Clock;

/// Configuration driving backend selection. Mirrors the environment
/// variables the node process reads: `NAVARCH_FAKE_GPU`,
/// `NAVARCH_GPU_COUNT`, `NAVARCH_GPU_TYPE`.
#[derive(Debug, Clone)]
pub struct BackendConfig {
    pub kind: BackendKind,
    pub fake_device_count: u32,
    pub fake_device_name: String,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: BackendKind::Native,
            fake_device_count: 1,
            fake_device_name: "Fake GPU".to_string(),
        }
    }
}

impl BackendConfig {
    /// Reads `NAVARCH_FAKE_GPU` / `NAVARCH_GPU_COUNT` / `NAVARCH_GPU_TYPE`
    /// from the process environment, falling back to the native backend.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if std::env::var("NAVARCH_FAKE_GPU").map(|v| v == "true" || v == "1").unwrap_or(false) {
            config.kind = BackendKind::Injectable;
        }
        if let Ok(count) = std::env::var("NAVARCH_GPU_COUNT") {
            if let Ok(parsed) = count.parse() {
                config.fake_device_count = parsed;
            }
        }
        if let Ok(name) = std::env::var("NAVARCH_GPU_TYPE") {
            config.fake_device_name = name;
        }
        config
    }
}

/// Construct the configured `GpuBackend`. Does not call `initialize` —
/// that is the caller's responsibility, matching the backend's
/// capability-interface lifecycle contract.
pub fn create_gpu_backend(config: &BackendConfig, clock: Arc<dyn Clock>) -> Result<Arc<dyn GpuBackend>, DeviceError> {
    match config.kind {
        BackendKind::Injectable => Ok(Arc::new(InjectableBackend::new(config.fake_device_count, config.fake_device_name.clone()))),
        BackendKind::Native => {
            let backend = NativeBackend::new(clock)?;
            Ok(Arc::new(backend))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;

    #[test]
    fn env_defaults_to_native() {
        std::env::remove_var("NAVARCH_FAKE_GPU");
        let config = BackendConfig::from_env();
        assert_eq!(config.kind, BackendKind::Native);
    }

    #[tokio::test]
    async fn injectable_config_builds_injectable_backend() {
        let config = BackendConfig {
            kind: BackendKind::Injectable,
            fake_device_count: 3,
            fake_device_name: "Test GPU".to_string(),
        };
        let backend = create_gpu_backend(&config, Arc::new(SystemClock)).unwrap();
        assert_eq!(backend.kind(), BackendKind::Injectable);
        backend.initialize().await.unwrap();
        assert_eq!(backend.device_count().await.unwrap(), 3);
    }
}
