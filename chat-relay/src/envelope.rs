use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::{Map, Value};

use crate::registry::ConnectionId;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Kind {
    /// Generated by the relay itself, e.g. the welcome banner.
    System,
    /// Submitted by a client and relayed through the broker.
    Message,
}

/// One chat event as it travels from a socket, through the broker, and back
/// out to every socket.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: Kind,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "podName")]
    pub origin_instance: String,
}

impl Envelope {
    pub fn welcome(instance: &str, now: DateTime<Utc>) -> Self {
        Self {
            kind: Kind::System,
            content: format!("Connected to chat server (Pod: {instance})"),
            sender: None,
            timestamp: now,
            origin_instance: instance.to_string(),
        }
    }

    /// Builds the envelope published for a client message. Everything except
    /// the content is decided by the receiving instance.
    pub fn stamp(
        inbound: InboundMessage,
        sender: &ConnectionId,
        instance: &str,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            kind: Kind::Message,
            content: inbound.content,
            sender: Some(sender.to_string()),
            timestamp: now,
            origin_instance: instance.to_string(),
        }
    }

    pub fn encode(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn decode(bytes: &[u8]) -> serde_json::Result<Self> {
        from_object(bytes)
    }
}

/// What a client is allowed to contribute to an envelope. Any `type`,
/// `sender`, `timestamp` or `podName` it sends along is ignored.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct InboundMessage {
    pub content: String,
}

impl InboundMessage {
    pub fn parse(payload: &[u8]) -> serde_json::Result<Self> {
        from_object(payload)
    }
}

// Derived struct impls also accept a JSON array in field order.
fn from_object<T: DeserializeOwned>(bytes: &[u8]) -> serde_json::Result<T> {
    let object: Map<String, Value> = serde_json::from_slice(bytes)?;
    serde_json::from_value(Value::Object(object))
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use serde_json::{Value, json};

    use super::*;
    use crate::registry::ConnectionIds;

    fn fixed_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 0).unwrap()
    }

    #[test]
    fn welcome_matches_wire_shape() {
        let welcome = Envelope::welcome("pod-a", fixed_time());
        let value: Value = serde_json::from_slice(&welcome.encode().unwrap()).unwrap();

        assert_eq!(
            value,
            json!({
                "type": "system",
                "content": "Connected to chat server (Pod: pod-a)",
                "timestamp": "2024-05-01T12:30:00Z",
                "podName": "pod-a",
            })
        );
    }

    #[test]
    fn stamping_overrides_client_supplied_fields() {
        let inbound = InboundMessage::parse(
            br#"{"type":"system","content":"hi","sender":"mallory","timestamp":"1999-01-01T00:00:00Z","podName":"elsewhere"}"#,
        )
        .unwrap();
        let sender = ConnectionIds::new("pod-a").next();

        let envelope = Envelope::stamp(inbound, &sender, "pod-a", fixed_time());

        assert_eq!(envelope.kind, Kind::Message);
        assert_eq!(envelope.content, "hi");
        assert_eq!(envelope.sender.as_deref(), Some(sender.as_str()));
        assert_eq!(envelope.timestamp, fixed_time());
        assert_eq!(envelope.origin_instance, "pod-a");
    }

    #[test]
    fn inbound_without_type_is_accepted() {
        let inbound =
            InboundMessage::parse(br#"{"content":"hello","timestamp":"2024-05-01T00:00:00.000Z"}"#)
                .unwrap();
        assert_eq!(inbound.content, "hello");
    }

    #[test]
    fn unrecognizable_payloads_are_rejected() {
        for payload in [
            &b"not json"[..],
            b"42",
            b"[\"content\"]",
            b"{}",
            b"{\"content\": 7}",
        ] {
            assert!(
                InboundMessage::parse(payload).is_err(),
                "payload {:?} should be rejected",
                String::from_utf8_lossy(payload)
            );
        }
    }

    #[test]
    fn decode_requires_a_full_envelope() {
        assert!(Envelope::decode(br#"{"content":"hi"}"#).is_err());
        assert!(Envelope::decode(b"garbage").is_err());
        assert!(
            Envelope::decode(br#"["message","hi","pod-b-1","2024-05-01T12:30:00Z","pod-b"]"#)
                .is_err()
        );

        let decoded = Envelope::decode(
            br#"{"type":"message","content":"hi","sender":"pod-b-1","timestamp":"2024-05-01T12:30:00Z","podName":"pod-b"}"#,
        )
        .unwrap();
        assert_eq!(decoded.sender.as_deref(), Some("pod-b-1"));
        assert_eq!(decoded.origin_instance, "pod-b");
    }
}
