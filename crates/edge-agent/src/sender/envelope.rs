//! CloudEvents envelope construction

use chrono::{DateTime, Utc};
use edge_core::{CloudEvent, EventKind, OutboundEvent, VehicleInfo, CLOUD_EVENT_SPEC_VERSION};
use uuid::Uuid;

pub const CONTENT_TYPE_JSON: &str = "application/json";

/// Stamps envelopes for one device
#[derive(Debug, Clone)]
pub struct EnvelopeBuilder {
    source: String,
    subject: String,
}

impl EnvelopeBuilder {
    /// `subject` is the device's Ethereum address
    pub fn new(source: impl Into<String>, subject: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            subject: subject.into(),
        }
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Wrap an event. Vehicle attributes are attached to status events only.
    pub fn build(&self, event: OutboundEvent, time: DateTime<Utc>, vehicle: Option<&VehicleInfo>) -> CloudEvent {
        let vehicle = vehicle.filter(|_| event.kind == EventKind::Status);
        CloudEvent {
            id: Uuid::new_v4().to_string(),
            source: self.source.clone(),
            specversion: CLOUD_EVENT_SPEC_VERSION.to_string(),
            subject: self.subject.clone(),
            event_type: event.kind.event_type().to_string(),
            time,
            datacontenttype: CONTENT_TYPE_JSON.to_string(),
            vehicle_token_id: vehicle.map(|v| v.token_id),
            make: vehicle.map(|v| v.make.clone()),
            model: vehicle.map(|v| v.model.clone()),
            year: vehicle.map(|v| v.year),
            signature: None,
            data: event.data,
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use serde_json::json;

    use super::*;

    fn vehicle() -> VehicleInfo {
        VehicleInfo {
            token_id: 21,
            make: "Ford".to_string(),
            model: "F-150".to_string(),
            year: 2022,
        }
    }

    #[test]
    fn test_status_envelope_carries_vehicle() {
        let builder = EnvelopeBuilder::new("edge/agent", "0xabc");
        let time = Utc.with_ymd_and_hms(2026, 10, 1, 8, 0, 0).unwrap();
        let envelope = builder.build(OutboundEvent::new(EventKind::Status, json!({"signals": []})), time, Some(&vehicle()));

        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(value["type"], "com.edge.device.status");
        assert_eq!(value["subject"], "0xabc");
        assert_eq!(value["specversion"], "1.0");
        assert_eq!(value["vehicleTokenID"], 21);
        assert_eq!(value["make"], "Ford");
        assert_eq!(value["time"], "2026-10-01T08:00:00Z");
        assert!(value.get("signature").is_none());
    }

    #[test]
    fn test_other_kinds_omit_vehicle() {
        let builder = EnvelopeBuilder::new("edge/agent", "0xabc");
        let first = builder.build(OutboundEvent::new(EventKind::Logs, json!({})), Utc::now(), Some(&vehicle()));
        let second = builder.build(OutboundEvent::new(EventKind::Logs, json!({})), Utc::now(), None);

        let value = serde_json::to_value(&first).unwrap();
        assert!(value.get("vehicleTokenID").is_none());
        assert!(value.get("make").is_none());
        assert_ne!(first.id, second.id);
    }
}
