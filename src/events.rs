use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

/// Platform event kinds, named as the dotted strings external consumers
/// subscribe on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EventKind {
    #[serde(rename = "agent.online")]
    AgentOnline,
    #[serde(rename = "agent.offline")]
    AgentOffline,
    #[serde(rename = "session.state")]
    SessionState,
    #[serde(rename = "command.completed")]
    CommandCompleted,
    #[serde(rename = "command.failed")]
    CommandFailed,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlatformEvent {
    pub kind: EventKind,
    pub at: DateTime<Utc>,
    pub detail: serde_json::Value,
}

/// Fire-and-forget fan-out to external consumers (audit writers, metrics,
/// plugins). Emitting never blocks and never fails the caller; consumers
/// that fall behind lose events.
#[derive(Clone)]
pub struct EventEmitter {
    tx: broadcast::Sender<PlatformEvent>,
}

impl EventEmitter {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn emit(&self, kind: EventKind, detail: serde_json::Value) {
        let event = PlatformEvent {
            kind,
            at: Utc::now(),
            detail,
        };
        tracing::debug!(kind = ?event.kind, detail = %event.detail, "platform event");
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PlatformEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn events_reach_subscribers() {
        let emitter = EventEmitter::default();
        let mut rx = emitter.subscribe();
        emitter.emit(
            EventKind::AgentOffline,
            serde_json::json!({"agent_id": "A1"}),
        );
        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind, EventKind::AgentOffline);
        assert_eq!(event.detail["agent_id"], "A1");
    }

    #[test]
    fn emit_without_subscribers_is_fine() {
        let emitter = EventEmitter::default();
        emitter.emit(EventKind::SessionState, serde_json::json!({}));
    }

    #[test]
    fn kinds_serialize_dotted() {
        let json = serde_json::to_string(&EventKind::AgentOffline).unwrap();
        assert_eq!(json, r#""agent.offline""#);
    }
}
