//! The topic+payload+metadata unit exchanged between bus and transport
//!
//! Wire shape: `{"topic": ..., "payload": ..., "timestamp": ISO-8601,
//! "sequence": n}`. Sequence numbers are assigned by the bus per topic at
//! publish time and carried for reorder detection on the receiving side;
//! they are advisory and never used to reorder delivery.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    pub topic: String,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub sequence: u64,
}

impl Envelope {
    /// Wrap a payload, stamping the current time
    pub fn new(topic: impl Into<String>, payload: Value, sequence: u64) -> Self {
        Self {
            topic: topic.into(),
            payload,
            timestamp: Utc::now(),
            sequence,
        }
    }

    /// Serialize to a wire frame
    pub fn to_frame(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Decode a wire frame
    pub fn from_frame(frame: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_envelope_wire_fields() {
        let envelope = Envelope::new("camera/setting", json!({"setting": "gain", "value": 50}), 3);
        let frame = envelope.to_frame().unwrap();
        let value: Value = serde_json::from_str(&frame).unwrap();

        assert_eq!(value["topic"], "camera/setting");
        assert_eq!(value["payload"]["setting"], "gain");
        assert_eq!(value["payload"]["value"], 50);
        assert_eq!(value["sequence"], 3);

        // Timestamp goes on the wire as an ISO-8601 string
        let timestamp = value["timestamp"].as_str().unwrap();
        assert!(timestamp.contains('T'));
        assert!(timestamp.parse::<DateTime<Utc>>().is_ok());
    }

    #[test]
    fn test_envelope_decode() {
        let frame = r#"{
            "topic": "mount/status",
            "payload": {"tracking": true},
            "timestamp": "2026-01-15T12:00:00Z",
            "sequence": 7
        }"#;

        let envelope = Envelope::from_frame(frame).unwrap();
        assert_eq!(envelope.topic, "mount/status");
        assert_eq!(envelope.payload, json!({"tracking": true}));
        assert_eq!(envelope.sequence, 7);
    }

    #[test]
    fn test_envelope_decode_missing_sequence() {
        // Peers that do not track sequences may omit the field
        let frame = r#"{
            "topic": "focuser/position",
            "payload": 12400,
            "timestamp": "2026-01-15T12:00:00Z"
        }"#;

        let envelope = Envelope::from_frame(frame).unwrap();
        assert_eq!(envelope.sequence, 0);
        assert_eq!(envelope.payload, json!(12400));
    }

    #[test]
    fn test_envelope_decode_rejects_garbage() {
        assert!(Envelope::from_frame("not json").is_err());
        assert!(Envelope::from_frame(r#"{"payload": 1}"#).is_err());
    }
}
