use std::sync::Arc;

use serde_json::Value;

use crate::error::DispatchError;

use super::message::{Envelope, InboundMessage, MessageKind};

/// Downstream consumer of routed messages.
///
/// Called synchronously from the drain loop; implementations must not block.
pub trait MessageHandler: Send + Sync {
    fn on_stream_update(&self, connection_id: &str, payload: &Value);

    fn on_metrics_update(&self, payload: &Value);

    fn on_heartbeat_ack(&self, _connection_id: &str) {}
}

/// What happened to a routed message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    Delivered(MessageKind),
    UnknownKind(String),
    Malformed,
}

/// Sends parsed messages to the matching handler slot
#[derive(Clone)]
pub struct MessageRouter {
    handler: Arc<dyn MessageHandler>,
}

impl MessageRouter {
    pub fn new(handler: Arc<dyn MessageHandler>) -> Self {
        Self { handler }
    }

    /// Route one message. Parse failures and unknown kinds are logged and
    /// reported, never propagated.
    pub fn route(&self, message: &InboundMessage) -> RouteOutcome {
        let envelope = match Envelope::parse(&message.payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                log_malformed(&message.connection_id, &e);
                return RouteOutcome::Malformed;
            }
        };

        match envelope.kind {
            MessageKind::StreamUpdate => {
                self.handler
                    .on_stream_update(&message.connection_id, &envelope.payload);
            }
            MessageKind::MetricsUpdate => {
                self.handler.on_metrics_update(&envelope.payload);
            }
            MessageKind::HeartbeatAck => {
                self.handler.on_heartbeat_ack(&message.connection_id);
            }
            MessageKind::Unknown(kind) => {
                tracing::warn!(
                    connection_id = %message.connection_id,
                    kind = %kind,
                    "Dropping message of unknown kind"
                );
                return RouteOutcome::UnknownKind(kind);
            }
        }

        RouteOutcome::Delivered(envelope.kind)
    }
}

fn log_malformed(connection_id: &str, error: &DispatchError) {
    tracing::warn!(
        connection_id = %connection_id,
        error = %error,
        "Skipping malformed message"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Frame;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<String>>,
    }

    impl MessageHandler for Recorder {
        fn on_stream_update(&self, connection_id: &str, payload: &Value) {
            self.calls.lock().push(format!("stream:{}:{}", connection_id, payload));
        }

        fn on_metrics_update(&self, payload: &Value) {
            self.calls.lock().push(format!("metrics:{}", payload));
        }

        fn on_heartbeat_ack(&self, connection_id: &str) {
            self.calls.lock().push(format!("ack:{}", connection_id));
        }
    }

    fn message(text: &str) -> InboundMessage {
        InboundMessage::new("a", Frame::from(text))
    }

    #[test]
    fn test_routes_by_kind() {
        let recorder = Arc::new(Recorder::default());
        let router = MessageRouter::new(recorder.clone());

        assert_eq!(
            router.route(&message(r#"{"type":"stream_update","payload":1}"#)),
            RouteOutcome::Delivered(MessageKind::StreamUpdate)
        );
        router.route(&message(r#"{"type":"metrics_update","payload":2}"#));
        router.route(&message(r#"{"type":"heartbeat_ack"}"#));

        assert_eq!(
            *recorder.calls.lock(),
            vec!["stream:a:1", "metrics:2", "ack:a"]
        );
    }

    #[test]
    fn test_bad_messages_do_not_reach_handler() {
        let recorder = Arc::new(Recorder::default());
        let router = MessageRouter::new(recorder.clone());

        assert_eq!(router.route(&message("<<<")), RouteOutcome::Malformed);
        assert_eq!(
            router.route(&message(r#"{"type":"mystery"}"#)),
            RouteOutcome::UnknownKind("mystery".to_string())
        );
        assert!(recorder.calls.lock().is_empty());
    }
}
