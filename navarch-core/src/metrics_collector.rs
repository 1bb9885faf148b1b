//! Combines system-level metrics (CPU%, memory%) with the GPU backend's
//! per-device readings into the payload the heartbeat loop sends.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::warn;

use crate::device::GpuBackend;
use crate::rpc::{GpuMetricSample, HeartbeatMetrics};

/// CPU/memory reader. Real implementation reads `/proc/stat` and
/// `/proc/meminfo`; a fake variant exists for tests.
#[async_trait]
pub trait SystemMetricsReader: Send + Sync {
    /// Cumulative (idle, total) jiffies since boot, for a delta-based CPU%.
    async fn read_cpu_ticks(&self) -> std::io::Result<(u64, u64)>;

    /// (total, available) bytes.
    async fn read_memory_bytes(&self) -> std::io::Result<(u64, u64)>;
}

/// Reads `/proc/stat`'s aggregate `cpu` line and `/proc/meminfo`.
pub struct ProcSystemMetricsReader;

#[async_trait]
impl SystemMetricsReader for ProcSystemMetricsReader {
    async fn read_cpu_ticks(&self) -> std::io::Result<(u64, u64)> {
        let contents = tokio::fs::read_to_string("/proc/stat").await?;
        let line = contents
            .lines()
            .find(|l| l.starts_with("cpu "))
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidData, "no cpu line in /proc/stat"))?;

        let fields: Vec<u64> = line.split_whitespace().skip(1).filter_map(|f| f.parse().ok()).collect();
        if fields.len() < 4 {
            return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "malformed /proc/stat cpu line"));
        }
        let idle = fields[3];
        let total: u64 = fields.iter().sum();
        Ok((idle, total))
    }

    async fn read_memory_bytes(&self) -> std::io::Result<(u64, u64)> {
        let contents = tokio::fs::read_to_string("/proc/meminfo").await?;
        let mut total_kb = None;
        let mut available_kb = None;
        for line in contents.lines() {
            if let Some(rest) = line.strip_prefix("MemTotal:") {
                total_kb = rest.trim().split_whitespace().next().and_then(|v| v.parse::<u64>().ok());
            } else if let Some(rest) = line.strip_prefix("MemAvailable:") {
                available_kb = rest.trim().split_whitespace().next().and_then(|v| v.parse::<u64>().ok());
            }
        }
        let total_kb = total_kb.ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidData, "MemTotal missing"))?;
        let available_kb = available_kb.ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidData, "MemAvailable missing"))?;
        Ok((total_kb * 1024, available_kb * 1024))
    }
}

#[derive(Clone, Copy)]
struct CpuSample {
    idle: u64,
    total: u64,
}

/// Combines the system reader and the GPU backend. Any individual
/// reading that fails degrades to zero rather than aborting the report.
pub struct MetricsCollector {
    system: Arc<dyn SystemMetricsReader>,
    backend: Arc<dyn GpuBackend>,
    prior_cpu_sample: Mutex<Option<CpuSample>>,
}

impl MetricsCollector {
    pub fn new(system: Arc<dyn SystemMetricsReader>, backend: Arc<dyn GpuBackend>) -> Self {
        Self {
            system,
            backend,
            prior_cpu_sample: Mutex::new(None),
        }
    }

    async fn cpu_usage_percent(&self) -> f64 {
        let sample = match self.system.read_cpu_ticks().await {
            Ok((idle, total)) => CpuSample { idle, total },
            Err(e) => {
                warn!(error = %e, "failed to read CPU ticks, reporting 0%");
                return 0.0;
            }
        };

        let mut prior = self.prior_cpu_sample.lock().await;
        let usage = match *prior {
            None => 0.0,
            Some(previous) => {
                let total_delta = sample.total.saturating_sub(previous.total);
                let idle_delta = sample.idle.saturating_sub(previous.idle);
                if total_delta == 0 {
                    0.0
                } else {
                    let busy_delta = total_delta.saturating_sub(idle_delta);
                    (busy_delta as f64 / total_delta as f64) * 100.0
                }
            }
        };
        *prior = Some(sample);
        usage
    }

    async fn memory_usage_percent(&self) -> f64 {
        match self.system.read_memory_bytes().await {
            Ok((total, available)) if total > 0 => ((total - available.min(total)) as f64 / total as f64) * 100.0,
            Ok(_) => 0.0,
            Err(e) => {
                warn!(error = %e, "failed to read memory, reporting 0%");
                0.0
            }
        }
    }

    async fn gpu_metrics(&self) -> Vec<GpuMetricSample> {
        let count = match self.backend.device_count().await {
            Ok(count) => count,
            Err(e) => {
                warn!(error = %e, "failed to query device count, reporting no GPU metrics");
                return Vec::new();
            }
        };

        let mut samples = Vec::with_capacity(count as usize);
        for index in 0..count {
            match self.backend.device_health(index).await {
                Ok(health) => samples.push(GpuMetricSample {
                    index,
                    utilization_percent: health.utilization_percent,
                    memory_used_bytes: health.memory_used_bytes,
                    temperature_celsius: health.temperature_celsius,
                    power_watts: health.power_watts,
                }),
                Err(e) => warn!(error = %e, device = index, "failed to read device health"),
            }
        }
        samples
    }

    pub async fn collect(&self) -> HeartbeatMetrics {
        HeartbeatMetrics {
            cpu_usage_percent: self.cpu_usage_percent().await,
            memory_usage_percent: self.memory_usage_percent().await,
            gpu_metrics: self.gpu_metrics().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::InjectableBackend;
    use std::sync::Mutex as StdMutex;

    struct FakeSystemReader {
        cpu_ticks: StdMutex<Vec<(u64, u64)>>,
        memory: (u64, u64),
    }

    #[async_trait]
    impl SystemMetricsReader for FakeSystemReader {
        async fn read_cpu_ticks(&self) -> std::io::Result<(u64, u64)> {
            let mut ticks = self.cpu_ticks.lock().unwrap();
            Ok(if ticks.len() > 1 { ticks.remove(0) } else { ticks[0] })
        }

        async fn read_memory_bytes(&self) -> std::io::Result<(u64, u64)> {
            Ok(self.memory)
        }
    }

    #[tokio::test]
    async fn first_cpu_sample_is_zero() {
        let reader = Arc::new(FakeSystemReader {
            cpu_ticks: StdMutex::new(vec![(100, 200)]),
            memory: (1000, 500),
        });
        let backend = Arc::new(InjectableBackend::new(0, "none"));
        let collector = MetricsCollector::new(reader, backend);
        let metrics = collector.collect().await;
        assert_eq!(metrics.cpu_usage_percent, 0.0);
    }

    #[tokio::test]
    async fn second_cpu_sample_computes_busy_delta() {
        let reader = Arc::new(FakeSystemReader {
            cpu_ticks: StdMutex::new(vec![(100, 200), (120, 300)]),
            memory: (1000, 500),
        });
        let backend = Arc::new(InjectableBackend::new(0, "none"));
        let collector = MetricsCollector::new(reader, backend);
        let _ = collector.collect().await;
        let metrics = collector.collect().await;
        // total delta 100, idle delta 20 -> busy 80 -> 80%
        assert!((metrics.cpu_usage_percent - 80.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn memory_percent_matches_formula() {
        let reader = Arc::new(FakeSystemReader {
            cpu_ticks: StdMutex::new(vec![(0, 0)]),
            memory: (1000, 250),
        });
        let backend = Arc::new(InjectableBackend::new(0, "none"));
        let collector = MetricsCollector::new(reader, backend);
        let metrics = collector.collect().await;
        assert!((metrics.memory_usage_percent - 75.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn gpu_metrics_reflect_backend_device_count() {
        let reader = Arc::new(FakeSystemReader {
            cpu_ticks: StdMutex::new(vec![(0, 0)]),
            memory: (1000, 500),
        });
        let backend = Arc::new(InjectableBackend::new(2, "Test GPU"));
        backend.initialize().await.unwrap();
        let collector = MetricsCollector::new(reader, backend);
        let metrics = collector.collect().await;
        assert_eq!(metrics.gpu_metrics.len(), 2);
    }
}
