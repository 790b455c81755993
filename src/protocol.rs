//! Wire protocol between the control plane and agent runtimes.
//!
//! Frames are JSON text with a top-level `type` tag. The protocol must stay
//! bit-compatible with deployed agents: the `timestamp` field is always the
//! RFC 3339 string form (a past release emitted a Unix integer and broke
//! parsers), and heartbeat status fields are nested under `payload`.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{AgentCapacity, CommandAction, SessionResources};

// WebSocket close codes. 4xxx is the application-reserved range; the agent
// distinguishes "retry with backoff" from "give up" by code.
pub const CLOSE_UNAUTHORIZED: u16 = 4401;
pub const CLOSE_UNKNOWN_AGENT: u16 = 4404;
pub const CLOSE_MALFORMED: u16 = 4400;
pub const CLOSE_REPLACED: u16 = 4409;
pub const CLOSE_SHUTDOWN: u16 = 4000;

/// Everything that travels the persistent agent connection, in either
/// direction.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    Register {
        timestamp: DateTime<Utc>,
        agent_id: String,
        platform: String,
        region: String,
        capacity: AgentCapacity,
        #[serde(default)]
        metadata: serde_json::Value,
    },
    RegisterOk {
        timestamp: DateTime<Utc>,
        /// Plaintext agent key, returned exactly once per agent lifetime.
        api_key: String,
    },
    Heartbeat {
        timestamp: DateTime<Utc>,
        payload: HeartbeatPayload,
    },
    Ping {
        timestamp: DateTime<Utc>,
    },
    Pong {
        timestamp: DateTime<Utc>,
    },
    Command {
        timestamp: DateTime<Utc>,
        command_id: Uuid,
        action: CommandAction,
        payload: serde_json::Value,
    },
    Ack {
        timestamp: DateTime<Utc>,
        command_id: Uuid,
    },
    Complete {
        timestamp: DateTime<Utc>,
        command_id: Uuid,
        result: serde_json::Value,
    },
    Failed {
        timestamp: DateTime<Utc>,
        command_id: Uuid,
        error_message: String,
    },
    Status {
        timestamp: DateTime<Utc>,
        command_id: Uuid,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        progress: Option<serde_json::Value>,
    },
    FramebufferData {
        timestamp: DateTime<Utc>,
        session_id: Uuid,
        /// Base64-encoded framebuffer bytes.
        bytes: String,
    },
    Shutdown {
        timestamp: DateTime<Utc>,
        reason: String,
    },
}

/// Heartbeat status, nested under `payload`. A flat heartbeat layout is
/// rejected as malformed and must not update liveness.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HeartbeatPayload {
    pub status: String,
    pub active_sessions: i64,
    pub capacity: AgentCapacity,
}

impl Frame {
    pub fn ping() -> Self {
        Self::Ping {
            timestamp: Utc::now(),
        }
    }

    pub fn pong() -> Self {
        Self::Pong {
            timestamp: Utc::now(),
        }
    }

    pub fn heartbeat(payload: HeartbeatPayload) -> Self {
        Self::Heartbeat {
            timestamp: Utc::now(),
            payload,
        }
    }

    pub fn command(command_id: Uuid, action: CommandAction, payload: serde_json::Value) -> Self {
        Self::Command {
            timestamp: Utc::now(),
            command_id,
            action,
            payload,
        }
    }

    pub fn ack(command_id: Uuid) -> Self {
        Self::Ack {
            timestamp: Utc::now(),
            command_id,
        }
    }

    pub fn complete(command_id: Uuid, result: serde_json::Value) -> Self {
        Self::Complete {
            timestamp: Utc::now(),
            command_id,
            result,
        }
    }

    pub fn failed(command_id: Uuid, error_message: impl Into<String>) -> Self {
        Self::Failed {
            timestamp: Utc::now(),
            command_id,
            error_message: error_message.into(),
        }
    }

    pub fn framebuffer_data(session_id: Uuid, data: &[u8]) -> Self {
        Self::FramebufferData {
            timestamp: Utc::now(),
            session_id,
            bytes: BASE64.encode(data),
        }
    }

    pub fn shutdown(reason: impl Into<String>) -> Self {
        Self::Shutdown {
            timestamp: Utc::now(),
            reason: reason.into(),
        }
    }
}

/// Decode failure classification. Incomplete input is a transport artifact
/// and is retried on the same connection; only genuinely unparseable input
/// closes it.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("incomplete frame")]
    Incomplete,

    #[error("malformed frame: {0}")]
    Malformed(String),
}

pub fn decode(text: &str) -> Result<Frame, DecodeError> {
    match serde_json::from_str(text) {
        Ok(frame) => Ok(frame),
        Err(e) if e.is_eof() => Err(DecodeError::Incomplete),
        Err(e) => Err(DecodeError::Malformed(e.to_string())),
    }
}

pub fn encode(frame: &Frame) -> String {
    serde_json::to_string(frame).unwrap_or_default()
}

pub fn decode_framebuffer_bytes(encoded: &str) -> Result<Vec<u8>, DecodeError> {
    BASE64
        .decode(encoded)
        .map_err(|e| DecodeError::Malformed(format!("invalid framebuffer bytes: {e}")))
}

// ---------------------------------------------------------------------------
// Action payloads
// ---------------------------------------------------------------------------

/// `start_session` command payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartSessionPayload {
    pub session_id: Uuid,
    pub user: String,
    pub template: String,
    pub resources: SessionResources,
    #[serde(default)]
    pub persistent_home: bool,
}

/// `stop_session` command payload. `delete_persistent` exists on the wire
/// but defaults to false: the user-scoped home volume is shared across
/// sessions and is normally never deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopSessionPayload {
    pub session_id: Uuid,
    #[serde(default)]
    pub delete_persistent: bool,
}

/// Payload for the remaining session-scoped actions (`hibernate_session`,
/// `wake_session`, `framebuffer_connect`, `framebuffer_disconnect`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRefPayload {
    pub session_id: Uuid,
}

/// `start_session` / `wake_session` success result reported by the runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkloadMetadata {
    pub workload_name: String,
    pub pod_ip: String,
    pub service_name: String,
    pub framebuffer_port: u16,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn capacity() -> AgentCapacity {
        AgentCapacity {
            max_cpu: "8".into(),
            max_memory: "16Gi".into(),
            max_sessions: 10,
        }
    }

    #[test]
    fn timestamp_is_rfc3339_string_on_the_wire() {
        let frame = Frame::Ping {
            timestamp: "2025-01-01T00:00:00Z".parse().unwrap(),
        };
        let json: serde_json::Value = serde_json::from_str(&encode(&frame)).unwrap();
        // Must be a string, never a Unix integer.
        assert_eq!(json["timestamp"], serde_json::json!("2025-01-01T00:00:00Z"));
    }

    #[test]
    fn heartbeat_requires_nested_payload() {
        let nested = r#"{
            "type": "heartbeat",
            "timestamp": "2025-01-01T00:00:00Z",
            "payload": {
                "status": "online",
                "active_sessions": 3,
                "capacity": {"max_cpu": "8", "max_memory": "16Gi", "max_sessions": 10}
            }
        }"#;
        let Frame::Heartbeat { payload, .. } = decode(nested).unwrap() else {
            panic!("expected heartbeat");
        };
        assert_eq!(payload.status, "online");
        assert_eq!(payload.active_sessions, 3);
        assert_eq!(payload.capacity, capacity());

        // The flat layout is malformed, not incomplete.
        let flat = r#"{"type": "heartbeat", "timestamp": "2025-01-01T00:00:00Z",
                       "status": "online", "active_sessions": 3}"#;
        assert!(matches!(decode(flat), Err(DecodeError::Malformed(_))));
    }

    #[test]
    fn register_frame_shape() {
        let text = r#"{
            "type": "register",
            "timestamp": "2025-01-01T00:00:00Z",
            "agent_id": "A1",
            "platform": "kubernetes",
            "region": "us-east",
            "capacity": {"max_cpu": "8", "max_memory": "16Gi", "max_sessions": 10}
        }"#;
        let Frame::Register {
            agent_id,
            platform,
            capacity: cap,
            metadata,
            ..
        } = decode(text).unwrap()
        else {
            panic!("expected register");
        };
        assert_eq!(agent_id, "A1");
        assert_eq!(platform, "kubernetes");
        assert_eq!(cap, capacity());
        assert!(metadata.is_null());
    }

    #[test]
    fn command_frame_round_trip() {
        let id = Uuid::new_v4();
        let frame = Frame::command(
            id,
            CommandAction::StartSession,
            serde_json::json!({"session_id": Uuid::new_v4()}),
        );
        let decoded = decode(&encode(&frame)).unwrap();
        let Frame::Command {
            command_id, action, ..
        } = decoded
        else {
            panic!("expected command");
        };
        assert_eq!(command_id, id);
        assert_eq!(action, CommandAction::StartSession);
    }

    #[test]
    fn truncated_frame_is_incomplete_not_malformed() {
        let full = encode(&Frame::ping());
        let cut = &full[..full.len() - 4];
        assert!(matches!(decode(cut), Err(DecodeError::Incomplete)));
    }

    #[test]
    fn garbage_is_malformed() {
        assert!(matches!(
            decode(r#"{"type": "no_such_frame", "timestamp": "2025-01-01T00:00:00Z"}"#),
            Err(DecodeError::Malformed(_))
        ));
    }

    #[test]
    fn framebuffer_bytes_round_trip() {
        let data = [0u8, 1, 2, 250, 255];
        let frame = Frame::framebuffer_data(Uuid::new_v4(), &data);
        let Frame::FramebufferData { bytes, .. } = decode(&encode(&frame)).unwrap() else {
            panic!("expected framebuffer_data");
        };
        assert_eq!(decode_framebuffer_bytes(&bytes).unwrap(), data);
    }

    #[test]
    fn stop_payload_delete_persistent_defaults_false() {
        let payload: StopSessionPayload =
            serde_json::from_value(serde_json::json!({"session_id": Uuid::new_v4()})).unwrap();
        assert!(!payload.delete_persistent);
    }
}
