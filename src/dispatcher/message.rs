use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;

use crate::error::DispatchError;
use crate::transport::Frame;

/// A message read off a connection, waiting for delivery
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub connection_id: String,
    pub payload: Frame,
    pub received_at: Instant,
}

impl InboundMessage {
    pub fn new(connection_id: impl Into<String>, payload: Frame) -> Self {
        Self {
            connection_id: connection_id.into(),
            payload,
            received_at: Instant::now(),
        }
    }
}

/// Routing discriminator of an inbound message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageKind {
    StreamUpdate,
    MetricsUpdate,
    HeartbeatAck,
    Unknown(String),
}

impl MessageKind {
    pub fn parse(kind: &str) -> Self {
        match kind {
            "stream_update" => MessageKind::StreamUpdate,
            "metrics_update" => MessageKind::MetricsUpdate,
            "heartbeat_ack" | "pong" => MessageKind::HeartbeatAck,
            other => MessageKind::Unknown(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            MessageKind::StreamUpdate => "stream_update",
            MessageKind::MetricsUpdate => "metrics_update",
            MessageKind::HeartbeatAck => "heartbeat_ack",
            MessageKind::Unknown(kind) => kind,
        }
    }
}

/// A parsed inbound message
#[derive(Debug, Clone)]
pub struct Envelope {
    pub kind: MessageKind,
    /// The `payload` field when present, otherwise the whole message
    pub payload: Value,
}

impl Envelope {
    pub fn parse(frame: &Frame) -> Result<Self, DispatchError> {
        let mut value: Value = match frame {
            Frame::Text(text) => serde_json::from_str(text)?,
            Frame::Binary(bytes) => serde_json::from_slice(bytes)?,
        };

        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .or_else(|| value.get("kind").and_then(Value::as_str))
            .map(MessageKind::parse)
            .ok_or(DispatchError::MissingKind)?;

        let payload = if value.get("payload").is_some() {
            value["payload"].take()
        } else {
            value
        };

        Ok(Self { kind, payload })
    }
}

/// Messages sent from this client to remote endpoints
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientMessage {
    Subscribe { channels: Vec<String> },
    Ping,
}

impl ClientMessage {
    pub fn to_frame(&self) -> Frame {
        // Serializing a plain enum of strings cannot fail
        Frame::Text(serde_json::to_string(self).unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_envelope_prefers_type_then_kind() {
        let env = Envelope::parse(&Frame::from(r#"{"type":"stream_update","payload":{"n":1}}"#))
            .unwrap();
        assert_eq!(env.kind, MessageKind::StreamUpdate);
        assert_eq!(env.payload, json!({"n": 1}));

        let env = Envelope::parse(&Frame::from(r#"{"kind":"metrics_update","cpu":0.5}"#)).unwrap();
        assert_eq!(env.kind, MessageKind::MetricsUpdate);
        assert_eq!(env.payload, json!({"kind": "metrics_update", "cpu": 0.5}));
    }

    #[test]
    fn test_non_string_type_falls_back_to_kind() {
        let env = Envelope::parse(&Frame::from(r#"{"type":5,"kind":"stream_update","payload":1}"#))
            .unwrap();
        assert_eq!(env.kind, MessageKind::StreamUpdate);
        assert_eq!(env.payload, json!(1));

        assert!(matches!(
            Envelope::parse(&Frame::from(r#"{"type":null}"#)),
            Err(DispatchError::MissingKind)
        ));
    }

    #[test]
    fn test_envelope_from_binary() {
        let env = Envelope::parse(&Frame::from(br#"{"type":"pong"}"#.to_vec())).unwrap();
        assert_eq!(env.kind, MessageKind::HeartbeatAck);
    }

    #[test]
    fn test_envelope_errors() {
        assert!(matches!(
            Envelope::parse(&Frame::from("{not json")),
            Err(DispatchError::Malformed(_))
        ));
        assert!(matches!(
            Envelope::parse(&Frame::from(r#"{"data":1}"#)),
            Err(DispatchError::MissingKind)
        ));
    }

    #[test]
    fn test_unknown_kind_keeps_name() {
        let env = Envelope::parse(&Frame::from(r#"{"type":"agent_log"}"#)).unwrap();
        assert_eq!(env.kind, MessageKind::Unknown("agent_log".to_string()));
        assert_eq!(env.kind.as_str(), "agent_log");
    }

    #[test]
    fn test_client_message_wire_format() {
        let frame = ClientMessage::Subscribe {
            channels: vec!["agents".to_string()],
        }
        .to_frame();
        assert_eq!(
            frame,
            Frame::from(r#"{"type":"subscribe","payload":{"channels":["agents"]}}"#)
        );
        assert_eq!(ClientMessage::Ping.to_frame(), Frame::from(r#"{"type":"ping"}"#));
    }
}
