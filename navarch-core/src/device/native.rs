//! Native `GpuBackend` against NVML, for production nodes.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use nvml_wrapper::enum_wrappers::device::TemperatureSensor;
use nvml_wrapper::Nvml;
use once_cell::sync::OnceCell;
use regex::Regex;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::clock::Clock;
use crate::device::interface::{BackendKind, DeviceDescriptor, DeviceError, DeviceHealthSample, GpuBackend};
use crate::health_event::{HealthEvent, MetricValue, NODE_SCOPED_INDEX};
use std::time::Duration;

/// Global NVML instance; NVML may only be initialized once per process.
static NVML: OnceCell<Arc<Nvml>> = OnceCell::new();

fn get_nvml() -> Result<&'static Arc<Nvml>, DeviceError> {
    NVML.get_or_try_init(|| Nvml::init().map(Arc::new).map_err(|e| DeviceError::InitFailed(e.to_string())))
}

/// XID severity tier, used to prioritize the event but not to change its
/// `event_type` (still `xid`) — recorded as a `severity` metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum XidSeverity {
    Critical,
    Warning,
    Info,
}

impl XidSeverity {
    fn as_str(self) -> &'static str {
        match self {
            XidSeverity::Critical => "critical",
            XidSeverity::Warning => "warning",
            XidSeverity::Info => "info",
        }
    }
}

/// Critical XID set per the glossary's default-policy set.
const CRITICAL_XIDS: &[u32] = &[
    13, 31, 32, 43, 45, 48, 61, 62, 63, 64, 68, 69, 74, 79, 92, 94, 95, 100, 119, 120,
];

fn classify_xid_severity(code: u32) -> XidSeverity {
    if CRITICAL_XIDS.contains(&code) {
        XidSeverity::Critical
    } else if xid_description(code).is_some() {
        XidSeverity::Warning
    } else {
        XidSeverity::Info
    }
}

fn xid_description(code: u32) -> Option<&'static str> {
    Some(match code {
        13 => "Graphics Engine Exception",
        31 => "GPU memory page fault",
        32 => "Invalid or corrupted push buffer stream",
        38 => "Driver firmware error",
        43 => "GPU stopped processing",
        45 => "Preemptive cleanup, due to previous errors",
        48 => "Double Bit ECC Error",
        61 => "Internal micro-controller breakpoint/warning",
        62 => "Internal micro-controller halt",
        63 => "ECC page retirement or row remapping recording event",
        64 => "ECC page retirement or row remapper recording failure",
        68 => "NVDEC0 Exception",
        69 => "Graphics Engine class error",
        74 => "NVLINK Error",
        79 => "GPU has fallen off the bus",
        92 => "High single-bit ECC error rate",
        94 => "Contained ECC error",
        95 => "Uncontained ECC error",
        100 => "Aggregate single-bit ECC error storm",
        119 => "GSP RPC timeout",
        120 => "GSP error",
        _ => return None,
    })
}

fn xid_message(code: u32) -> String {
    xid_description(code)
        .map(str::to_string)
        .unwrap_or_else(|| format!("Unknown XID error (code: {code})"))
}

/// `00000000:01:00.0` -> `01:00`: strip the PCI domain and function.
fn normalize_pci_bus(bus_id: &str) -> String {
    let segments: Vec<&str> = bus_id.trim().split(':').collect();
    let (bus, dev_func) = match segments.as_slice() {
        [_domain, bus, dev_func] => (*bus, *dev_func),
        [bus, dev_func] => (*bus, *dev_func),
        _ => return bus_id.to_string(),
    };
    let device = dev_func.split('.').next().unwrap_or(dev_func);
    format!("{bus}:{device}")
}

struct CollectorHandle {
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

/// Production `GpuBackend`. Enumerates NVML devices, builds a PCI-bus →
/// index map at init, and runs a background task draining XID errors from
/// the kernel log into the event buffer, tolerating log rotation.
pub struct NativeBackend {
    nvml: &'static Arc<Nvml>,
    pci_index_map: Arc<RwLock<HashMap<String, u32>>>,
    buffer: Arc<RwLock<Vec<HealthEvent>>>,
    collector: RwLock<Option<CollectorHandle>>,
    kernel_log_path: String,
    poll_interval: Duration,
    clock: Arc<dyn Clock>,
}

impl NativeBackend {
    pub fn new(clock: Arc<dyn Clock>) -> Result<Self, DeviceError> {
        Self::with_kernel_log_path(clock, "/dev/kmsg".to_string())
    }

    pub fn with_kernel_log_path(clock: Arc<dyn Clock>, kernel_log_path: String) -> Result<Self, DeviceError> {
        let nvml = get_nvml()?;
        Ok(Self {
            nvml,
            pci_index_map: Arc::new(RwLock::new(HashMap::new())),
            buffer: Arc::new(RwLock::new(Vec::new())),
            collector: RwLock::new(None),
            kernel_log_path,
            poll_interval: Duration::from_secs(5),
            clock,
        })
    }

    async fn build_pci_index_map(&self) -> Result<(), DeviceError> {
        let count = self.nvml.device_count().map_err(|e| DeviceError::QueryFailed(e.to_string()))?;
        let mut map = HashMap::with_capacity(count as usize);
        for i in 0..count {
            let device = self.nvml.device_by_index(i).map_err(|e| DeviceError::QueryFailed(e.to_string()))?;
            if let Ok(pci_info) = device.pci_info() {
                map.insert(normalize_pci_bus(&pci_info.bus_id), i);
            }
        }
        *self.pci_index_map.write().await = map;
        Ok(())
    }

    /// NVML's asynchronous event-delivery API varies too much across
    /// driver versions to be relied on as the primary path; the kernel
    /// log parser below is the portable one and is what every supported
    /// driver version exposes via `dmesg`/`/dev/kmsg`.
    fn native_event_channel_available(&self) -> bool {
        false
    }
}

async fn run_log_collector(
    kernel_log_path: String,
    pci_index_map: Arc<RwLock<HashMap<String, u32>>>,
    buffer: Arc<RwLock<Vec<HealthEvent>>>,
    clock: Arc<dyn Clock>,
    poll_interval: Duration,
    cancel: CancellationToken,
) {
    let xid_re = match Regex::new(r"NVRM: Xid \(PCI:([^)]+)\): (\d+)(?:, (.*))?") {
        Ok(re) => re,
        Err(e) => {
            warn!(error = %e, "failed to compile XID regex, event collector disabled");
            return;
        }
    };
    let mut offset: u64 = 0;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = clock.sleep(poll_interval) => {}
        }

        let metadata = match tokio::fs::metadata(&kernel_log_path).await {
            Ok(m) => m,
            Err(e) => {
                trace!(path = %kernel_log_path, error = %e, "kernel log unreadable this tick");
                continue;
            }
        };

        // Log rotated out from under us: restart from the beginning.
        if metadata.len() < offset {
            debug!(path = %kernel_log_path, "kernel log shrank, resetting read offset");
            offset = 0;
        }

        let mut file = match tokio::fs::File::open(&kernel_log_path).await {
            Ok(f) => f,
            Err(_) => continue,
        };
        if file.seek(std::io::SeekFrom::Start(offset)).await.is_err() {
            continue;
        }
        let mut contents = String::new();
        if file.read_to_string(&mut contents).await.is_err() {
            continue;
        }
        offset += contents.len() as u64;

        let map = pci_index_map.read().await;
        let mut new_events = Vec::new();
        for cap in xid_re.captures_iter(&contents) {
            let Some(code) = cap.get(2).and_then(|m| m.as_str().parse::<u32>().ok()) else {
                continue;
            };
            let bus = normalize_pci_bus(&cap[1]);
            let gpu_index = map.get(&bus).copied().map(|i| i as i32).unwrap_or(NODE_SCOPED_INDEX);
            let message = cap.get(3).map(|m| m.as_str().to_string()).unwrap_or_else(|| xid_message(code));
            let severity = classify_xid_severity(code);

            let mut event = HealthEvent::xid(gpu_index, String::new(), code, message);
            event.metrics.insert("severity".to_string(), MetricValue::Str(severity.as_str().to_string()));
            new_events.push(event);
        }
        drop(map);

        if !new_events.is_empty() {
            trace!(count = new_events.len(), "collected XID events from kernel log");
            buffer.write().await.extend(new_events);
        }
    }
}

#[async_trait]
impl GpuBackend for NativeBackend {
    async fn initialize(&self) -> Result<(), DeviceError> {
        {
            let existing = self.collector.read().await;
            if existing.is_some() {
                return Err(DeviceError::AlreadyInitialized);
            }
        }

        self.build_pci_index_map().await?;

        if self.native_event_channel_available() {
            debug!("using native NVML event channel for XID collection");
        } else {
            debug!(path = %self.kernel_log_path, "native event channel unavailable, falling back to kernel log parsing");
        }

        let cancel = CancellationToken::new();
        let join = tokio::spawn(run_log_collector(
            self.kernel_log_path.clone(),
            self.pci_index_map.clone(),
            self.buffer.clone(),
            self.clock.clone(),
            self.poll_interval,
            cancel.child_token(),
        ));

        *self.collector.write().await = Some(CollectorHandle { cancel, join });
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), DeviceError> {
        let handle = self.collector.write().await.take();
        match handle {
            Some(CollectorHandle { cancel, join }) => {
                cancel.cancel();
                let _ = join.await;
                Ok(())
            }
            None => Err(DeviceError::NotInitialized),
        }
    }

    async fn device_count(&self) -> Result<u32, DeviceError> {
        if self.collector.read().await.is_none() {
            return Err(DeviceError::NotInitialized);
        }
        self.nvml.device_count().map_err(|e| DeviceError::QueryFailed(e.to_string()))
    }

    async fn device_info(&self, index: u32) -> Result<DeviceDescriptor, DeviceError> {
        if self.collector.read().await.is_none() {
            return Err(DeviceError::NotInitialized);
        }
        let device = self
            .nvml
            .device_by_index(index)
            .map_err(|_| DeviceError::DeviceNotFound(index))?;
        let name = device.name().map_err(|e| DeviceError::QueryFailed(e.to_string()))?;
        let uuid = device.uuid().unwrap_or_default();
        let pci_bus_id = device.pci_info().map(|p| p.bus_id).unwrap_or_default();
        let memory_total_bytes = device.memory_info().map(|m| m.total).unwrap_or(0);

        Ok(DeviceDescriptor {
            index,
            uuid,
            name,
            pci_bus_id,
            memory_total_bytes,
        })
    }

    async fn device_health(&self, index: u32) -> Result<DeviceHealthSample, DeviceError> {
        if self.collector.read().await.is_none() {
            return Err(DeviceError::NotInitialized);
        }
        let device = self
            .nvml
            .device_by_index(index)
            .map_err(|_| DeviceError::DeviceNotFound(index))?;

        let temperature_celsius = device.temperature(TemperatureSensor::Gpu).unwrap_or(0);
        let utilization_percent = device.utilization_rates().map(|u| u.gpu).unwrap_or(0);
        let power_watts = device.power_usage().unwrap_or(0) / 1000;
        let memory_info = device.memory_info().map_err(|e| DeviceError::QueryFailed(e.to_string()))?;

        Ok(DeviceHealthSample {
            temperature_celsius,
            power_watts,
            memory_used_bytes: memory_info.used,
            memory_total_bytes: memory_info.total,
            utilization_percent,
            timestamp: Utc::now(),
        })
    }

    async fn collect_health_events(&self) -> Result<Vec<HealthEvent>, DeviceError> {
        if self.collector.read().await.is_none() {
            return Err(DeviceError::NotInitialized);
        }
        Ok(std::mem::take(&mut *self.buffer.write().await))
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Native
    }
}
