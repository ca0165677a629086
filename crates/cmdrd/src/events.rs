//! Session event bus.
//!
//! Publish-only from the core's perspective: the conversation/notification
//! layer subscribes and fans events out to its own transport (websockets in
//! the management app). Events carry target and conversation ids so
//! subscribers can scope their own filtering.

use cmdr_common::RiskTier;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

const CHANNEL_CAPACITY: usize = 256;

/// Events emitted around session lifecycle and command execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    SshConnected {
        target_id: i64,
    },
    SshDisconnected {
        target_id: i64,
    },
    SshOutput {
        target_id: i64,
        conversation_id: Option<i64>,
        command: String,
        risk_tier: RiskTier,
        exit_code: i32,
    },
    SshError {
        target_id: i64,
        conversation_id: Option<i64>,
        command: String,
        message: String,
    },
}

/// Broadcast bus for session events. Cheap to clone; publishing with no
/// subscribers is a no-op.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SessionEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn publish(&self, event: SessionEvent) {
        trace!(?event, "publishing session event");
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribers_receive_published_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.publish(SessionEvent::SshConnected { target_id: 7 });

        match rx.recv().await.unwrap() {
            SessionEvent::SshConnected { target_id } => assert_eq!(target_id, 7),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_publish_without_subscribers_is_noop() {
        let bus = EventBus::new();
        bus.publish(SessionEvent::SshDisconnected { target_id: 1 });
    }

    #[test]
    fn test_event_wire_names() {
        let event = SessionEvent::SshError {
            target_id: 1,
            conversation_id: None,
            command: "x".to_string(),
            message: "boom".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "ssh_error");
    }
}
