//! In-memory store used by the test suites and for single-process local
//! development. Conflict semantics mirror the Postgres implementation.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::CoreError;
use crate::types::{
    Agent, AgentCandidate, AgentCapacity, AgentCommand, CommandStatus, Session, SessionState,
};

use super::{AgentStore, CommandStore, SessionStore};

#[derive(Default)]
pub struct MemoryStore {
    agents: Mutex<HashMap<String, Agent>>,
    sessions: Mutex<HashMap<Uuid, Session>>,
    commands: Mutex<HashMap<Uuid, AgentCommand>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn active_sessions_for(sessions: &HashMap<Uuid, Session>, agent_id: &str) -> i64 {
        sessions
            .values()
            .filter(|s| s.agent_id.as_deref() == Some(agent_id) && !s.state.is_terminal())
            .count() as i64
    }
}

#[async_trait]
impl AgentStore for MemoryStore {
    async fn insert(&self, agent: &Agent) -> Result<(), CoreError> {
        let mut agents = self.agents.lock().expect("agent index poisoned");
        if agents.contains_key(&agent.agent_id) {
            return Err(CoreError::Conflict(format!(
                "agent {} already registered",
                agent.agent_id
            )));
        }
        agents.insert(agent.agent_id.clone(), agent.clone());
        Ok(())
    }

    async fn get(&self, agent_id: &str) -> Result<Option<Agent>, CoreError> {
        let agents = self.agents.lock().expect("agent index poisoned");
        Ok(agents.get(agent_id).cloned())
    }

    async fn update_registration(
        &self,
        agent_id: &str,
        platform: &str,
        region: &str,
        capacity: &AgentCapacity,
        metadata: &serde_json::Value,
    ) -> Result<(), CoreError> {
        let mut agents = self.agents.lock().expect("agent index poisoned");
        let agent = agents
            .get_mut(agent_id)
            .ok_or_else(|| CoreError::UnknownAgent(agent_id.to_owned()))?;
        agent.platform = platform.to_owned();
        agent.region = region.to_owned();
        agent.capacity = capacity.clone();
        agent.metadata = metadata.clone();
        Ok(())
    }

    async fn mark_online(&self, agent_id: &str, connection_id: Uuid) -> Result<(), CoreError> {
        let mut agents = self.agents.lock().expect("agent index poisoned");
        let agent = agents
            .get_mut(agent_id)
            .ok_or_else(|| CoreError::UnknownAgent(agent_id.to_owned()))?;
        agent.status = crate::types::AgentStatus::Online;
        agent.connection_id = Some(connection_id);
        agent.last_heartbeat_at = Some(Utc::now());
        Ok(())
    }

    async fn mark_offline(
        &self,
        agent_id: &str,
        expected_connection: Uuid,
    ) -> Result<bool, CoreError> {
        let mut agents = self.agents.lock().expect("agent index poisoned");
        let Some(agent) = agents.get_mut(agent_id) else {
            return Ok(false);
        };
        if agent.connection_id != Some(expected_connection) {
            return Ok(false);
        }
        agent.status = crate::types::AgentStatus::Offline;
        agent.connection_id = None;
        Ok(true)
    }

    async fn record_heartbeat(&self, agent_id: &str, at: DateTime<Utc>) -> Result<(), CoreError> {
        let mut agents = self.agents.lock().expect("agent index poisoned");
        let agent = agents
            .get_mut(agent_id)
            .ok_or_else(|| CoreError::UnknownAgent(agent_id.to_owned()))?;
        agent.last_heartbeat_at = Some(at);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<AgentCandidate>, CoreError> {
        let agents = self.agents.lock().expect("agent index poisoned");
        let sessions = self.sessions.lock().expect("session index poisoned");
        let mut out: Vec<AgentCandidate> = agents
            .values()
            .map(|a| AgentCandidate {
                current_sessions: Self::active_sessions_for(&sessions, &a.agent_id),
                agent: a.clone(),
            })
            .collect();
        out.sort_by(|a, b| a.agent.agent_id.cmp(&b.agent.agent_id));
        Ok(out)
    }

    async fn list_candidates(
        &self,
        platform: Option<&str>,
        region: Option<&str>,
    ) -> Result<Vec<AgentCandidate>, CoreError> {
        let all = AgentStore::list(self).await?;
        Ok(all
            .into_iter()
            .filter(|c| c.agent.status == crate::types::AgentStatus::Online)
            .filter(|c| platform.is_none_or(|p| c.agent.platform == p))
            .filter(|c| region.is_none_or(|r| c.agent.region == r))
            .collect())
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn insert(&self, session: &Session) -> Result<(), CoreError> {
        let mut sessions = self.sessions.lock().expect("session index poisoned");
        if sessions.contains_key(&session.session_id) {
            return Err(CoreError::Conflict(format!(
                "session {} already exists",
                session.session_id
            )));
        }
        sessions.insert(session.session_id, session.clone());
        Ok(())
    }

    async fn get(&self, session_id: Uuid) -> Result<Option<Session>, CoreError> {
        let sessions = self.sessions.lock().expect("session index poisoned");
        Ok(sessions.get(&session_id).cloned())
    }

    async fn list(&self, state: Option<SessionState>) -> Result<Vec<Session>, CoreError> {
        let sessions = self.sessions.lock().expect("session index poisoned");
        let mut out: Vec<Session> = sessions
            .values()
            .filter(|s| state.is_none_or(|st| s.state == st))
            .cloned()
            .collect();
        out.sort_by_key(|s| s.created_at);
        Ok(out)
    }

    async fn assign_agent(
        &self,
        session_id: Uuid,
        agent_id: &str,
        platform: &str,
    ) -> Result<(), CoreError> {
        let mut sessions = self.sessions.lock().expect("session index poisoned");
        let session = sessions
            .get_mut(&session_id)
            .ok_or(CoreError::UnknownSession(session_id))?;
        session.agent_id = Some(agent_id.to_owned());
        session.platform = Some(platform.to_owned());
        Ok(())
    }

    async fn set_state(&self, session_id: Uuid, state: SessionState) -> Result<(), CoreError> {
        let mut sessions = self.sessions.lock().expect("session index poisoned");
        let session = sessions
            .get_mut(&session_id)
            .ok_or(CoreError::UnknownSession(session_id))?;
        session.state = state;
        Ok(())
    }

    async fn set_platform_metadata(
        &self,
        session_id: Uuid,
        metadata: &serde_json::Value,
    ) -> Result<(), CoreError> {
        let mut sessions = self.sessions.lock().expect("session index poisoned");
        let session = sessions
            .get_mut(&session_id)
            .ok_or(CoreError::UnknownSession(session_id))?;
        session.platform_metadata = Some(metadata.clone());
        Ok(())
    }

    async fn touch_activity(&self, session_id: Uuid, at: DateTime<Utc>) -> Result<(), CoreError> {
        let mut sessions = self.sessions.lock().expect("session index poisoned");
        let session = sessions
            .get_mut(&session_id)
            .ok_or(CoreError::UnknownSession(session_id))?;
        session.last_activity_at = at;
        Ok(())
    }

    async fn list_idle_running(
        &self,
        idle_since: DateTime<Utc>,
    ) -> Result<Vec<Session>, CoreError> {
        let sessions = self.sessions.lock().expect("session index poisoned");
        Ok(sessions
            .values()
            .filter(|s| s.state == SessionState::Running && s.last_activity_at < idle_since)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl CommandStore for MemoryStore {
    async fn create(&self, command: &AgentCommand) -> Result<(), CoreError> {
        let mut commands = self.commands.lock().expect("command index poisoned");
        if commands.contains_key(&command.command_id) {
            return Err(CoreError::Conflict(format!(
                "command {} already exists",
                command.command_id
            )));
        }
        commands.insert(command.command_id, command.clone());
        Ok(())
    }

    async fn get(&self, command_id: Uuid) -> Result<Option<AgentCommand>, CoreError> {
        let commands = self.commands.lock().expect("command index poisoned");
        Ok(commands.get(&command_id).cloned())
    }

    async fn mark_sent(&self, command_id: Uuid, at: DateTime<Utc>) -> Result<(), CoreError> {
        self.transition(command_id, CommandStatus::Sent, |cmd| cmd.sent_at = Some(at))
    }

    async fn mark_acked(&self, command_id: Uuid, at: DateTime<Utc>) -> Result<(), CoreError> {
        self.transition(command_id, CommandStatus::Ack, |cmd| {
            cmd.acked_at = Some(at);
        })
    }

    async fn mark_completed(
        &self,
        command_id: Uuid,
        result: &serde_json::Value,
        at: DateTime<Utc>,
    ) -> Result<(), CoreError> {
        self.transition(command_id, CommandStatus::Completed, |cmd| {
            cmd.result = Some(result.clone());
            cmd.completed_at = Some(at);
        })
    }

    async fn mark_failed(
        &self,
        command_id: Uuid,
        error_message: &str,
        at: DateTime<Utc>,
    ) -> Result<(), CoreError> {
        self.transition(command_id, CommandStatus::Failed, |cmd| {
            cmd.error_message = Some(error_message.to_owned());
            cmd.completed_at = Some(at);
        })
    }

    async fn list_inflight(&self, agent_id: &str) -> Result<Vec<AgentCommand>, CoreError> {
        let commands = self.commands.lock().expect("command index poisoned");
        let mut out: Vec<AgentCommand> = commands
            .values()
            .filter(|c| c.agent_id == agent_id && !c.status.is_terminal())
            .cloned()
            .collect();
        out.sort_by_key(|c| c.created_at);
        Ok(out)
    }

    async fn list_overdue(
        &self,
        created_before: DateTime<Utc>,
    ) -> Result<Vec<AgentCommand>, CoreError> {
        let commands = self.commands.lock().expect("command index poisoned");
        Ok(commands
            .values()
            .filter(|c| !c.status.is_terminal() && c.created_at < created_before)
            .cloned()
            .collect())
    }

    async fn find_active_lifecycle(
        &self,
        session_id: Uuid,
    ) -> Result<Option<AgentCommand>, CoreError> {
        let commands = self.commands.lock().expect("command index poisoned");
        Ok(commands
            .values()
            .find(|c| {
                c.session_id == Some(session_id)
                    && c.action.is_lifecycle()
                    && !c.status.is_terminal()
            })
            .cloned())
    }
}

impl MemoryStore {
    /// Apply a status transition, enforcing the monotonic state machine.
    fn transition(
        &self,
        command_id: Uuid,
        to: CommandStatus,
        apply: impl FnOnce(&mut AgentCommand),
    ) -> Result<(), CoreError> {
        let mut commands = self.commands.lock().expect("command index poisoned");
        let command = commands
            .get_mut(&command_id)
            .ok_or(CoreError::UnknownCommand(command_id))?;
        if to.rank() <= command.status.rank() {
            return Err(CoreError::Conflict(format!(
                "command {command_id} cannot move {} -> {}",
                command.status.as_str(),
                to.as_str()
            )));
        }
        command.status = to;
        apply(command);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CommandAction;

    fn command(agent_id: &str, session_id: Option<Uuid>) -> AgentCommand {
        AgentCommand::new(
            agent_id,
            session_id,
            CommandAction::StartSession,
            serde_json::json!({}),
        )
    }

    #[tokio::test]
    async fn command_transitions_are_monotonic() {
        let store = MemoryStore::new();
        let cmd = command("A1", None);
        store.create(&cmd).await.unwrap();

        store.mark_sent(cmd.command_id, Utc::now()).await.unwrap();
        store.mark_acked(cmd.command_id, Utc::now()).await.unwrap();
        store
            .mark_completed(cmd.command_id, &serde_json::json!({"ok": true}), Utc::now())
            .await
            .unwrap();

        // Backward and terminal-reopen transitions conflict.
        assert!(matches!(
            store.mark_sent(cmd.command_id, Utc::now()).await,
            Err(CoreError::Conflict(_))
        ));
        assert!(matches!(
            store.mark_failed(cmd.command_id, "late", Utc::now()).await,
            Err(CoreError::Conflict(_))
        ));

        let row = CommandStore::get(&store, cmd.command_id).await.unwrap().unwrap();
        assert_eq!(row.status, CommandStatus::Completed);
        assert!(row.error_message.is_none());
    }

    #[tokio::test]
    async fn failed_row_has_error_message_completed_row_does_not() {
        let store = MemoryStore::new();
        let ok = command("A1", None);
        let bad = command("A1", None);
        store.create(&ok).await.unwrap();
        store.create(&bad).await.unwrap();

        store
            .mark_completed(ok.command_id, &serde_json::json!({}), Utc::now())
            .await
            .unwrap();
        store
            .mark_failed(bad.command_id, "image pull backoff", Utc::now())
            .await
            .unwrap();

        let ok_row = CommandStore::get(&store, ok.command_id).await.unwrap().unwrap();
        let bad_row = CommandStore::get(&store, bad.command_id).await.unwrap().unwrap();
        assert_eq!(ok_row.error_message, None);
        assert_eq!(bad_row.error_message.as_deref(), Some("image pull backoff"));
    }

    #[tokio::test]
    async fn inflight_excludes_terminal() {
        let store = MemoryStore::new();
        let a = command("A1", None);
        let b = command("A1", None);
        let other = command("A2", None);
        for c in [&a, &b, &other] {
            store.create(c).await.unwrap();
        }
        store
            .mark_failed(a.command_id, "boom", Utc::now())
            .await
            .unwrap();

        let inflight = store.list_inflight("A1").await.unwrap();
        assert_eq!(inflight.len(), 1);
        assert_eq!(inflight[0].command_id, b.command_id);
    }

    #[tokio::test]
    async fn active_lifecycle_lookup() {
        let store = MemoryStore::new();
        let session_id = Uuid::new_v4();
        let cmd = command("A1", Some(session_id));
        store.create(&cmd).await.unwrap();

        let found = store.find_active_lifecycle(session_id).await.unwrap();
        assert_eq!(found.map(|c| c.command_id), Some(cmd.command_id));

        store
            .mark_completed(cmd.command_id, &serde_json::json!({}), Utc::now())
            .await
            .unwrap();
        assert!(
            store
                .find_active_lifecycle(session_id)
                .await
                .unwrap()
                .is_none()
        );
    }
}
