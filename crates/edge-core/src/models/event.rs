//! Outbound event models (CloudEvents envelope and payloads)

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::SignalSample;

/// CloudEvents specification version carried by every envelope
pub const CLOUD_EVENT_SPEC_VERSION: &str = "1.0";

/// Which channel an outbound event belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Status,
    Network,
    Logs,
    Fingerprint,
    Dump,
}

impl EventKind {
    /// CloudEvents `type` attribute
    pub fn event_type(&self) -> &'static str {
        match self {
            EventKind::Status => "com.edge.device.status",
            EventKind::Network => "com.edge.device.network",
            EventKind::Logs => "com.edge.device.error",
            EventKind::Fingerprint => "com.edge.device.fingerprint",
            EventKind::Dump => "com.edge.device.candump",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EventKind::Status => "status",
            EventKind::Network => "network",
            EventKind::Logs => "logs",
            EventKind::Fingerprint => "fingerprint",
            EventKind::Dump => "dump",
        };
        f.write_str(s)
    }
}

/// An event handed to a [`crate::Publisher`]; the sender wraps it in an envelope
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundEvent {
    pub kind: EventKind,
    pub data: serde_json::Value,
}

impl OutboundEvent {
    pub fn new(kind: EventKind, data: serde_json::Value) -> Self {
        Self { kind, data }
    }

    /// Serialize a typed payload into an event
    pub fn from_payload<T: Serialize>(kind: EventKind, payload: &T) -> serde_json::Result<Self> {
        Ok(Self {
            kind,
            data: serde_json::to_value(payload)?,
        })
    }
}

/// CloudEvents envelope as published on the bus
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloudEvent {
    pub id: String,
    pub source: String,
    pub specversion: String,
    /// Ethereum address of the device
    pub subject: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub time: DateTime<Utc>,
    #[serde(default = "default_content_type")]
    pub datacontenttype: String,
    #[serde(rename = "vehicleTokenID", default, skip_serializing_if = "Option::is_none")]
    pub vehicle_token_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub make: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub year: Option<u32>,
    /// Hex Ethereum signature over the envelope without this field
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    pub data: serde_json::Value,
}

fn default_content_type() -> String {
    "application/json".to_string()
}

/// Vehicle attributes from the identity service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VehicleInfo {
    pub token_id: u64,
    pub make: String,
    pub model: String,
    pub year: u32,
}

/// Identity snapshot emitted once per successful fingerprint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FingerprintPayload {
    pub vin: String,
    pub protocol: String,
    pub query_name: String,
    pub software_version: String,
    pub uptime_secs: u64,
    pub battery_voltage: f64,
    /// Unix milliseconds
    pub timestamp: i64,
}

/// Status payload carrying a batch of samples
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusPayload {
    pub timestamp: i64,
    pub software_version: String,
    pub signals: Vec<SignalSample>,
}

/// Error payload produced by the log hook
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    pub timestamp: i64,
    pub level: String,
    pub target: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub fields: serde_json::Map<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub software_version: Option<String>,
}
