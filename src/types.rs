use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Agent
// ---------------------------------------------------------------------------

/// Declared capacity of an agent. `max_cpu` and `max_memory` are agent-chosen
/// unit strings and opaque to the control plane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentCapacity {
    pub max_cpu: String,
    pub max_memory: String,
    pub max_sessions: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    PendingRegistration,
    Online,
    Offline,
    Draining,
}

impl AgentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PendingRegistration => "pending_registration",
            Self::Online => "online",
            Self::Offline => "offline",
            Self::Draining => "draining",
        }
    }
}

/// Represents an `agents` row. `agent_id` is externally chosen at
/// registration and immutable afterwards.
#[derive(Debug, Clone)]
pub struct Agent {
    pub agent_id: String,
    pub platform: String,
    pub region: String,
    pub capacity: AgentCapacity,
    pub status: AgentStatus,
    pub connection_id: Option<Uuid>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub api_key_hash: Option<String>,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Selection input for the dispatcher: an agent joined with its derived
/// count of non-terminal sessions. The count is never stored.
#[derive(Debug, Clone)]
pub struct AgentCandidate {
    pub agent: Agent,
    pub current_sessions: i64,
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Pending,
    Running,
    Hibernated,
    Terminated,
    Failed,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Hibernated => "hibernated",
            Self::Terminated => "terminated",
            Self::Failed => "failed",
        }
    }

    /// Terminated and failed sessions no longer occupy agent capacity.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Terminated | Self::Failed)
    }
}

/// Requested session resources. Opaque unit strings, passed through to the
/// agent runtime.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionResources {
    pub cpu: String,
    pub memory: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<String>,
}

/// Represents a `sessions` row.
#[derive(Debug, Clone)]
pub struct Session {
    pub session_id: Uuid,
    pub user_id: String,
    pub template_id: String,
    pub agent_id: Option<String>,
    pub platform: Option<String>,
    pub state: SessionState,
    pub resources: SessionResources,
    pub persistent_home: bool,
    pub platform_metadata: Option<serde_json::Value>,
    pub last_activity_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Command
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandAction {
    StartSession,
    StopSession,
    HibernateSession,
    WakeSession,
    ListSessions,
    FramebufferConnect,
    FramebufferData,
    FramebufferDisconnect,
}

impl CommandAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::StartSession => "start_session",
            Self::StopSession => "stop_session",
            Self::HibernateSession => "hibernate_session",
            Self::WakeSession => "wake_session",
            Self::ListSessions => "list_sessions",
            Self::FramebufferConnect => "framebuffer_connect",
            Self::FramebufferData => "framebuffer_data",
            Self::FramebufferDisconnect => "framebuffer_disconnect",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "start_session" => Some(Self::StartSession),
            "stop_session" => Some(Self::StopSession),
            "hibernate_session" => Some(Self::HibernateSession),
            "wake_session" => Some(Self::WakeSession),
            "list_sessions" => Some(Self::ListSessions),
            "framebuffer_connect" => Some(Self::FramebufferConnect),
            "framebuffer_data" => Some(Self::FramebufferData),
            "framebuffer_disconnect" => Some(Self::FramebufferDisconnect),
            _ => None,
        }
    }

    /// Lifecycle actions mutate session state and are serialized per session:
    /// at most one may be in flight at a time.
    pub fn is_lifecycle(self) -> bool {
        matches!(
            self,
            Self::StartSession | Self::StopSession | Self::HibernateSession | Self::WakeSession
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    Pending,
    Sent,
    Ack,
    Completed,
    Failed,
}

impl CommandStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sent => "sent",
            Self::Ack => "ack",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Position in the monotonic state machine. Transitions may only move to
    /// a strictly higher rank; a terminal row is never resurrected.
    pub fn rank(self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Sent => 1,
            Self::Ack => 2,
            Self::Completed | Self::Failed => 3,
        }
    }
}

/// Represents an `agent_commands` row. Created by the dispatcher; state is
/// advanced by the dispatcher as frames arrive, never by the agent directly.
#[derive(Debug, Clone)]
pub struct AgentCommand {
    pub command_id: Uuid,
    pub agent_id: String,
    pub session_id: Option<Uuid>,
    pub action: CommandAction,
    pub payload: serde_json::Value,
    pub status: CommandStatus,
    pub result: Option<serde_json::Value>,
    /// NULL in the store for anything but failed rows. Readers must accept
    /// absence; scanning this into a bare `String` has masked real failures.
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub acked_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl AgentCommand {
    pub fn new(
        agent_id: &str,
        session_id: Option<Uuid>,
        action: CommandAction,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            command_id: Uuid::new_v4(),
            agent_id: agent_id.to_owned(),
            session_id,
            action,
            payload,
            status: CommandStatus::Pending,
            result: None,
            error_message: None,
            created_at: Utc::now(),
            sent_at: None,
            acked_at: None,
            completed_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_round_trips_through_str() {
        for action in [
            CommandAction::StartSession,
            CommandAction::StopSession,
            CommandAction::HibernateSession,
            CommandAction::WakeSession,
            CommandAction::ListSessions,
            CommandAction::FramebufferConnect,
            CommandAction::FramebufferData,
            CommandAction::FramebufferDisconnect,
        ] {
            assert_eq!(CommandAction::parse(action.as_str()), Some(action));
        }
        assert_eq!(CommandAction::parse("reboot_agent"), None);
    }

    #[test]
    fn lifecycle_actions() {
        assert!(CommandAction::StartSession.is_lifecycle());
        assert!(CommandAction::StopSession.is_lifecycle());
        assert!(!CommandAction::ListSessions.is_lifecycle());
        assert!(!CommandAction::FramebufferConnect.is_lifecycle());
    }

    #[test]
    fn status_ranks_are_monotonic() {
        assert!(CommandStatus::Pending.rank() < CommandStatus::Sent.rank());
        assert!(CommandStatus::Sent.rank() < CommandStatus::Ack.rank());
        assert!(CommandStatus::Ack.rank() < CommandStatus::Completed.rank());
        assert_eq!(
            CommandStatus::Completed.rank(),
            CommandStatus::Failed.rank()
        );
    }

    #[test]
    fn terminal_session_states() {
        assert!(SessionState::Terminated.is_terminal());
        assert!(SessionState::Failed.is_terminal());
        assert!(!SessionState::Hibernated.is_terminal());
    }
}
