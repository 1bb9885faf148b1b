//! Health event model: the semantic facts a GPU backend reports about a
//! device or the node as a whole.
//!
//! Events carry an open `metrics` map rather than a fixed per-event-type
//! struct so the policy evaluator's condition language can reach into any
//! field uniformly. Constructors below are the well-formed-by-construction
//! entry points; nothing else should build a [`HealthEvent`] by hand.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Node-scoped events use this gpu_index.
pub const NODE_SCOPED_INDEX: i32 = -1;

/// Subsystem an event is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SystemClassifier {
    Pcie,
    Nvlink,
    Mem,
    Sm,
    Thermal,
    Power,
    Driver,
    Pmu,
    Mcu,
    Inforom,
    Nvswitch,
}

impl fmt::Display for SystemClassifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = serde_json::to_value(self)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();
        write!(f, "{s}")
    }
}

/// Kind of fact an event represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Xid,
    Thermal,
    Power,
    Memory,
    Nvlink,
    Pcie,
    DriverError,
    EccSbe,
    EccDbe,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = serde_json::to_value(self)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();
        write!(f, "{s}")
    }
}

/// A scalar metric value. Preserves its Rust type for policy evaluation;
/// flattened to a string for wire transport (see [`HealthEventWire`]).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricValue {
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
}

impl MetricValue {
    fn to_wire_string(&self) -> String {
        match self {
            MetricValue::Int(v) => v.to_string(),
            MetricValue::Float(v) => v.to_string(),
            MetricValue::Bool(v) => v.to_string(),
            MetricValue::Str(v) => v.clone(),
        }
    }

    /// Recover a typed value from a wire string: int, then float, then
    /// bool, then fall back to the string itself. Used by both RPC
    /// deserialization and the injectable backend's `…_at` typed helpers.
    fn from_wire_string(s: &str) -> MetricValue {
        if let Ok(i) = s.parse::<i64>() {
            return MetricValue::Int(i);
        }
        if let Ok(f) = s.parse::<f64>() {
            return MetricValue::Float(f);
        }
        if let Ok(b) = s.parse::<bool>() {
            return MetricValue::Bool(b);
        }
        MetricValue::Str(s.to_string())
    }
}

impl From<i64> for MetricValue {
    fn from(v: i64) -> Self {
        MetricValue::Int(v)
    }
}

impl From<f64> for MetricValue {
    fn from(v: f64) -> Self {
        MetricValue::Float(v)
    }
}

impl From<bool> for MetricValue {
    fn from(v: bool) -> Self {
        MetricValue::Bool(v)
    }
}

impl From<String> for MetricValue {
    fn from(v: String) -> Self {
        MetricValue::Str(v)
    }
}

impl From<&str> for MetricValue {
    fn from(v: &str) -> Self {
        MetricValue::Str(v.to_string())
    }
}

/// A semantic fact about a GPU or the node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthEvent {
    pub timestamp: DateTime<Utc>,
    /// Non-negative for a specific GPU, [`NODE_SCOPED_INDEX`] for the node.
    pub gpu_index: i32,
    /// Matches some device's UUID, or empty for node-scoped events.
    pub gpu_uuid: String,
    pub system: SystemClassifier,
    pub event_type: EventType,
    pub metrics: HashMap<String, MetricValue>,
    pub message: String,
}

impl HealthEvent {
    fn new(
        timestamp: DateTime<Utc>,
        gpu_index: i32,
        gpu_uuid: impl Into<String>,
        system: SystemClassifier,
        event_type: EventType,
        metrics: HashMap<String, MetricValue>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            timestamp,
            gpu_index,
            gpu_uuid: gpu_uuid.into(),
            system,
            event_type,
            metrics,
            message: message.into(),
        }
    }

    pub fn xid(gpu_index: i32, gpu_uuid: impl Into<String>, code: u32, message: impl Into<String>) -> Self {
        Self::xid_at(Utc::now(), gpu_index, gpu_uuid, code, message)
    }

    pub fn xid_at(
        timestamp: DateTime<Utc>,
        gpu_index: i32,
        gpu_uuid: impl Into<String>,
        code: u32,
        message: impl Into<String>,
    ) -> Self {
        let mut metrics = HashMap::new();
        metrics.insert("xid_code".to_string(), MetricValue::Int(code as i64));
        Self::new(
            timestamp,
            gpu_index,
            gpu_uuid,
            SystemClassifier::Driver,
            EventType::Xid,
            metrics,
            message,
        )
    }

    pub fn thermal(gpu_index: i32, gpu_uuid: impl Into<String>, temperature: i64, message: impl Into<String>) -> Self {
        Self::thermal_at(Utc::now(), gpu_index, gpu_uuid, temperature, message)
    }

    pub fn thermal_at(
        timestamp: DateTime<Utc>,
        gpu_index: i32,
        gpu_uuid: impl Into<String>,
        temperature: i64,
        message: impl Into<String>,
    ) -> Self {
        let mut metrics = HashMap::new();
        metrics.insert("temperature".to_string(), MetricValue::Int(temperature));
        Self::new(
            timestamp,
            gpu_index,
            gpu_uuid,
            SystemClassifier::Thermal,
            EventType::Thermal,
            metrics,
            message,
        )
    }

    pub fn memory_ecc(
        gpu_index: i32,
        gpu_uuid: impl Into<String>,
        sbe_count: i64,
        dbe_count: i64,
        message: impl Into<String>,
    ) -> Self {
        Self::memory_ecc_at(Utc::now(), gpu_index, gpu_uuid, sbe_count, dbe_count, message)
    }

    pub fn memory_ecc_at(
        timestamp: DateTime<Utc>,
        gpu_index: i32,
        gpu_uuid: impl Into<String>,
        sbe_count: i64,
        dbe_count: i64,
        message: impl Into<String>,
    ) -> Self {
        let mut metrics = HashMap::new();
        metrics.insert("ecc_sbe_count".to_string(), MetricValue::Int(sbe_count));
        metrics.insert("ecc_dbe_count".to_string(), MetricValue::Int(dbe_count));
        let event_type = if dbe_count > 0 { EventType::EccDbe } else { EventType::EccSbe };
        Self::new(timestamp, gpu_index, gpu_uuid, SystemClassifier::Mem, event_type, metrics, message)
    }

    pub fn nvlink(gpu_index: i32, gpu_uuid: impl Into<String>, link_id: i64, message: impl Into<String>) -> Self {
        Self::nvlink_at(Utc::now(), gpu_index, gpu_uuid, link_id, message)
    }

    pub fn nvlink_at(
        timestamp: DateTime<Utc>,
        gpu_index: i32,
        gpu_uuid: impl Into<String>,
        link_id: i64,
        message: impl Into<String>,
    ) -> Self {
        let mut metrics = HashMap::new();
        metrics.insert("link_id".to_string(), MetricValue::Int(link_id));
        Self::new(
            timestamp,
            gpu_index,
            gpu_uuid,
            SystemClassifier::Nvlink,
            EventType::Nvlink,
            metrics,
            message,
        )
    }

    pub fn power(gpu_index: i32, gpu_uuid: impl Into<String>, watts: i64, message: impl Into<String>) -> Self {
        Self::power_at(Utc::now(), gpu_index, gpu_uuid, watts, message)
    }

    pub fn power_at(
        timestamp: DateTime<Utc>,
        gpu_index: i32,
        gpu_uuid: impl Into<String>,
        watts: i64,
        message: impl Into<String>,
    ) -> Self {
        let mut metrics = HashMap::new();
        metrics.insert("power_watts".to_string(), MetricValue::Int(watts));
        Self::new(timestamp, gpu_index, gpu_uuid, SystemClassifier::Power, EventType::Power, metrics, message)
    }

    /// Escape hatch for events that don't fit the named constructors above
    /// (used by the injectable backend's generic injection helper).
    pub fn custom(
        gpu_index: i32,
        gpu_uuid: impl Into<String>,
        system: SystemClassifier,
        event_type: EventType,
        metrics: HashMap<String, MetricValue>,
        message: impl Into<String>,
    ) -> Self {
        Self::new(Utc::now(), gpu_index, gpu_uuid, system, event_type, metrics, message)
    }
}

/// Wire shape of a [`HealthEvent`]: metric maps flattened to string→string
/// per §4.9. `TryFrom<HealthEventWire>` recovers scalar types using the
/// int → float → bool → string ladder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthEventWire {
    pub timestamp: String,
    pub gpu_index: i32,
    pub gpu_uuid: String,
    pub system: String,
    pub event_type: String,
    pub metrics: HashMap<String, String>,
    pub message: String,
}

impl From<&HealthEvent> for HealthEventWire {
    fn from(event: &HealthEvent) -> Self {
        let metrics = event
            .metrics
            .iter()
            .map(|(k, v)| (k.clone(), v.to_wire_string()))
            .collect();
        HealthEventWire {
            timestamp: event.timestamp.to_rfc3339(),
            gpu_index: event.gpu_index,
            gpu_uuid: event.gpu_uuid.clone(),
            system: event.system.to_string(),
            event_type: event.event_type.to_string(),
            metrics,
            message: event.message.clone(),
        }
    }
}

/// Error recovering a [`HealthEvent`] from its wire shape.
#[derive(Debug, thiserror::Error)]
pub enum WireDecodeError {
    #[error("invalid timestamp: {0}")]
    Timestamp(String),
    #[error("unknown system classifier: {0}")]
    System(String),
    #[error("unknown event type: {0}")]
    EventType(String),
}

impl TryFrom<HealthEventWire> for HealthEvent {
    type Error = WireDecodeError;

    fn try_from(wire: HealthEventWire) -> Result<Self, Self::Error> {
        let timestamp = DateTime::parse_from_rfc3339(&wire.timestamp)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|_| WireDecodeError::Timestamp(wire.timestamp.clone()))?;
        let system: SystemClassifier = serde_json::from_value(serde_json::Value::String(wire.system.clone()))
            .map_err(|_| WireDecodeError::System(wire.system))?;
        let event_type: EventType = serde_json::from_value(serde_json::Value::String(wire.event_type.clone()))
            .map_err(|_| WireDecodeError::EventType(wire.event_type))?;
        let metrics = wire
            .metrics
            .into_iter()
            .map(|(k, v)| (k, MetricValue::from_wire_string(&v)))
            .collect();
        Ok(HealthEvent {
            timestamp,
            gpu_index: wire.gpu_index,
            gpu_uuid: wire.gpu_uuid,
            system,
            event_type,
            metrics,
            message: wire.message,
        })
    }
}
