//! Prometheus metrics for Navarch.

use once_cell::sync::Lazy;
use prometheus::{
    opts, register_gauge_vec, register_histogram_vec, register_int_counter_vec, register_int_gauge, GaugeVec, HistogramVec,
    IntCounterVec, IntGauge,
};

use crate::lifecycle::LifecycleState;
use crate::policy::Verdict;

static GPU_TEMPERATURE: Lazy<GaugeVec> = Lazy::new(|| {
    register_gauge_vec!(opts!("navarch_gpu_temperature_celsius", "GPU temperature in Celsius"), &["node", "gpu"])
        .expect("failed to create gpu_temperature metric")
});

static GPU_UTILIZATION: Lazy<GaugeVec> = Lazy::new(|| {
    register_gauge_vec!(opts!("navarch_gpu_utilization_percent", "GPU utilization percentage"), &["node", "gpu"])
        .expect("failed to create gpu_utilization metric")
});

static GPU_MEMORY_USED: Lazy<GaugeVec> = Lazy::new(|| {
    register_gauge_vec!(opts!("navarch_gpu_memory_used_bytes", "GPU memory used in bytes"), &["node", "gpu"])
        .expect("failed to create gpu_memory_used metric")
});

static EVALUATION_VERDICT: Lazy<GaugeVec> = Lazy::new(|| {
    register_gauge_vec!(
        opts!("navarch_evaluation_verdict", "Most recent policy evaluation verdict (0=healthy,1=degraded,2=unhealthy)"),
        &["node"]
    )
    .expect("failed to create evaluation_verdict metric")
});

static LIFECYCLE_STATE: Lazy<GaugeVec> = Lazy::new(|| {
    register_gauge_vec!(
        opts!("navarch_lifecycle_state", "Current lifecycle state (0=active,1=cordoned,2=draining,3=terminating)"),
        &["node"]
    )
    .expect("failed to create lifecycle_state metric")
});

static RPC_CALLS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(opts!("navarch_rpc_calls_total", "Total RPC calls by method and outcome"), &["method", "outcome"])
        .expect("failed to create rpc_calls metric")
});

static RPC_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "navarch_rpc_duration_seconds",
        "Duration of RPC calls",
        &["method"],
        vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
    )
    .expect("failed to create rpc_duration metric")
});

static RETRY_EXHAUSTED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(opts!("navarch_retry_exhausted_total", "Retries that exhausted all attempts"), &["operation"])
        .expect("failed to create retry_exhausted metric")
});

static DEVICE_COUNT: Lazy<IntGauge> =
    Lazy::new(|| register_int_gauge!(opts!("navarch_device_count", "Number of GPU devices discovered")).expect("failed to create device_count metric"));

/// Thin wrapper over the process-global Prometheus registry, in the
/// same shape as this codebase's existing metrics module.
pub struct MetricsRegistry;

impl MetricsRegistry {
    pub fn new() -> Self {
        let _ = &*GPU_TEMPERATURE;
        let _ = &*GPU_UTILIZATION;
        let _ = &*GPU_MEMORY_USED;
        let _ = &*EVALUATION_VERDICT;
        let _ = &*LIFECYCLE_STATE;
        let _ = &*RPC_CALLS;
        let _ = &*RPC_DURATION;
        let _ = &*RETRY_EXHAUSTED;
        let _ = &*DEVICE_COUNT;
        Self
    }

    pub fn set_device_count(&self, count: i64) {
        DEVICE_COUNT.set(count);
    }

    pub fn set_gpu_temperature(&self, node: &str, gpu_index: u32, celsius: u32) {
        GPU_TEMPERATURE.with_label_values(&[node, &gpu_index.to_string()]).set(celsius as f64);
    }

    pub fn set_gpu_utilization(&self, node: &str, gpu_index: u32, percent: u32) {
        GPU_UTILIZATION.with_label_values(&[node, &gpu_index.to_string()]).set(percent as f64);
    }

    pub fn set_gpu_memory_used(&self, node: &str, gpu_index: u32, bytes: u64) {
        GPU_MEMORY_USED.with_label_values(&[node, &gpu_index.to_string()]).set(bytes as f64);
    }

    pub fn set_evaluation_verdict(&self, node: &str, verdict: Verdict) {
        EVALUATION_VERDICT.with_label_values(&[node]).set(verdict as i32 as f64);
    }

    pub fn set_lifecycle_state(&self, node: &str, state: LifecycleState) {
        let value = match state {
            LifecycleState::Active => 0.0,
            LifecycleState::Cordoned => 1.0,
            LifecycleState::Draining => 2.0,
            LifecycleState::Terminating => 3.0,
        };
        LIFECYCLE_STATE.with_label_values(&[node]).set(value);
    }

    pub fn inc_rpc_call(&self, method: &str, outcome: &str) {
        RPC_CALLS.with_label_values(&[method, outcome]).inc();
    }

    pub fn observe_rpc_duration(&self, method: &str, duration_secs: f64) {
        RPC_DURATION.with_label_values(&[method]).observe(duration_secs);
    }

    pub fn inc_retry_exhausted(&self, operation: &str) {
        RETRY_EXHAUSTED.with_label_values(&[operation]).inc();
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}
