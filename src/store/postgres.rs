//! Postgres-backed store. Queries are runtime-checked so the crate builds
//! without a live database; the schema lives in `migrations/`.

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::postgres::{PgPool, PgRow};
use uuid::Uuid;

use crate::error::CoreError;
use crate::types::{
    Agent, AgentCandidate, AgentCapacity, AgentCommand, AgentStatus, CommandAction, CommandStatus,
    Session, SessionResources, SessionState,
};

use super::{AgentStore, CommandStore, SessionStore};

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

const AGENT_COLUMNS: &str = "agent_id, platform, region, max_cpu, max_memory, max_sessions, \
     status, connection_id, last_heartbeat_at, api_key_hash, metadata, created_at";

const SESSION_COLUMNS: &str = "session_id, user_id, template_id, agent_id, platform, state, \
     cpu, memory, storage, persistent_home, platform_metadata, last_activity_at, created_at";

const COMMAND_COLUMNS: &str = "command_id, agent_id, session_id, action, payload, status, \
     result, error_message, created_at, sent_at, acked_at, completed_at";

#[async_trait]
impl AgentStore for PgStore {
    async fn insert(&self, agent: &Agent) -> Result<(), CoreError> {
        let res = sqlx::query(
            "INSERT INTO agents (agent_id, platform, region, max_cpu, max_memory, max_sessions, \
             status, api_key_hash, metadata, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) \
             ON CONFLICT (agent_id) DO NOTHING",
        )
        .bind(&agent.agent_id)
        .bind(&agent.platform)
        .bind(&agent.region)
        .bind(&agent.capacity.max_cpu)
        .bind(&agent.capacity.max_memory)
        .bind(agent.capacity.max_sessions)
        .bind(agent.status.as_str())
        .bind(&agent.api_key_hash)
        .bind(&agent.metadata)
        .bind(agent.created_at)
        .execute(&self.pool)
        .await?;

        if res.rows_affected() == 0 {
            return Err(CoreError::Conflict(format!(
                "agent {} already registered",
                agent.agent_id
            )));
        }
        Ok(())
    }

    async fn get(&self, agent_id: &str) -> Result<Option<Agent>, CoreError> {
        let row = sqlx::query(&format!(
            "SELECT {AGENT_COLUMNS} FROM agents WHERE agent_id = $1"
        ))
        .bind(agent_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(agent_from_row).transpose()
    }

    async fn update_registration(
        &self,
        agent_id: &str,
        platform: &str,
        region: &str,
        capacity: &AgentCapacity,
        metadata: &serde_json::Value,
    ) -> Result<(), CoreError> {
        let res = sqlx::query(
            "UPDATE agents SET platform = $2, region = $3, max_cpu = $4, max_memory = $5, \
             max_sessions = $6, metadata = $7 WHERE agent_id = $1",
        )
        .bind(agent_id)
        .bind(platform)
        .bind(region)
        .bind(&capacity.max_cpu)
        .bind(&capacity.max_memory)
        .bind(capacity.max_sessions)
        .bind(metadata)
        .execute(&self.pool)
        .await?;

        if res.rows_affected() == 0 {
            return Err(CoreError::UnknownAgent(agent_id.to_owned()));
        }
        Ok(())
    }

    async fn mark_online(&self, agent_id: &str, connection_id: Uuid) -> Result<(), CoreError> {
        let res = sqlx::query(
            "UPDATE agents SET status = 'online', connection_id = $2, last_heartbeat_at = now() \
             WHERE agent_id = $1",
        )
        .bind(agent_id)
        .bind(connection_id)
        .execute(&self.pool)
        .await?;

        if res.rows_affected() == 0 {
            return Err(CoreError::UnknownAgent(agent_id.to_owned()));
        }
        Ok(())
    }

    async fn mark_offline(
        &self,
        agent_id: &str,
        expected_connection: Uuid,
    ) -> Result<bool, CoreError> {
        let res = sqlx::query(
            "UPDATE agents SET status = 'offline', connection_id = NULL \
             WHERE agent_id = $1 AND connection_id = $2",
        )
        .bind(agent_id)
        .bind(expected_connection)
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() > 0)
    }

    async fn record_heartbeat(&self, agent_id: &str, at: DateTime<Utc>) -> Result<(), CoreError> {
        let res = sqlx::query("UPDATE agents SET last_heartbeat_at = $2 WHERE agent_id = $1")
            .bind(agent_id)
            .bind(at)
            .execute(&self.pool)
            .await?;

        if res.rows_affected() == 0 {
            return Err(CoreError::UnknownAgent(agent_id.to_owned()));
        }
        Ok(())
    }

    async fn list(&self) -> Result<Vec<AgentCandidate>, CoreError> {
        self.list_filtered(None, None, false).await
    }

    async fn list_candidates(
        &self,
        platform: Option<&str>,
        region: Option<&str>,
    ) -> Result<Vec<AgentCandidate>, CoreError> {
        self.list_filtered(platform, region, true).await
    }
}

impl PgStore {
    async fn list_filtered(
        &self,
        platform: Option<&str>,
        region: Option<&str>,
        online_only: bool,
    ) -> Result<Vec<AgentCandidate>, CoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {AGENT_COLUMNS}, COALESCE(sc.cnt, 0) AS current_sessions \
             FROM agents a \
             LEFT JOIN (SELECT agent_id, COUNT(*) AS cnt FROM sessions \
                        WHERE state IN ('pending', 'running', 'hibernated') \
                        GROUP BY agent_id) sc USING (agent_id) \
             WHERE ($1::text IS NULL OR a.platform = $1) \
               AND ($2::text IS NULL OR a.region = $2) \
               AND (NOT $3 OR a.status = 'online') \
             ORDER BY a.agent_id"
        ))
        .bind(platform)
        .bind(region)
        .bind(online_only)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(AgentCandidate {
                    agent: agent_from_row(row)?,
                    current_sessions: row.try_get("current_sessions")?,
                })
            })
            .collect()
    }
}

#[async_trait]
impl SessionStore for PgStore {
    async fn insert(&self, session: &Session) -> Result<(), CoreError> {
        sqlx::query(
            "INSERT INTO sessions (session_id, user_id, template_id, agent_id, platform, state, \
             cpu, memory, storage, persistent_home, platform_metadata, last_activity_at, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)",
        )
        .bind(session.session_id)
        .bind(&session.user_id)
        .bind(&session.template_id)
        .bind(&session.agent_id)
        .bind(&session.platform)
        .bind(session.state.as_str())
        .bind(&session.resources.cpu)
        .bind(&session.resources.memory)
        .bind(&session.resources.storage)
        .bind(session.persistent_home)
        .bind(&session.platform_metadata)
        .bind(session.last_activity_at)
        .bind(session.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, session_id: Uuid) -> Result<Option<Session>, CoreError> {
        let row = sqlx::query(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions WHERE session_id = $1"
        ))
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(session_from_row).transpose()
    }

    async fn list(&self, state: Option<SessionState>) -> Result<Vec<Session>, CoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions \
             WHERE ($1::text IS NULL OR state = $1) ORDER BY created_at"
        ))
        .bind(state.map(SessionState::as_str))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(session_from_row).collect()
    }

    async fn assign_agent(
        &self,
        session_id: Uuid,
        agent_id: &str,
        platform: &str,
    ) -> Result<(), CoreError> {
        let res =
            sqlx::query("UPDATE sessions SET agent_id = $2, platform = $3 WHERE session_id = $1")
                .bind(session_id)
                .bind(agent_id)
                .bind(platform)
                .execute(&self.pool)
                .await?;

        if res.rows_affected() == 0 {
            return Err(CoreError::UnknownSession(session_id));
        }
        Ok(())
    }

    async fn set_state(&self, session_id: Uuid, state: SessionState) -> Result<(), CoreError> {
        let res = sqlx::query("UPDATE sessions SET state = $2 WHERE session_id = $1")
            .bind(session_id)
            .bind(state.as_str())
            .execute(&self.pool)
            .await?;

        if res.rows_affected() == 0 {
            return Err(CoreError::UnknownSession(session_id));
        }
        Ok(())
    }

    async fn set_platform_metadata(
        &self,
        session_id: Uuid,
        metadata: &serde_json::Value,
    ) -> Result<(), CoreError> {
        let res = sqlx::query("UPDATE sessions SET platform_metadata = $2 WHERE session_id = $1")
            .bind(session_id)
            .bind(metadata)
            .execute(&self.pool)
            .await?;

        if res.rows_affected() == 0 {
            return Err(CoreError::UnknownSession(session_id));
        }
        Ok(())
    }

    async fn touch_activity(&self, session_id: Uuid, at: DateTime<Utc>) -> Result<(), CoreError> {
        let res = sqlx::query("UPDATE sessions SET last_activity_at = $2 WHERE session_id = $1")
            .bind(session_id)
            .bind(at)
            .execute(&self.pool)
            .await?;

        if res.rows_affected() == 0 {
            return Err(CoreError::UnknownSession(session_id));
        }
        Ok(())
    }

    async fn list_idle_running(
        &self,
        idle_since: DateTime<Utc>,
    ) -> Result<Vec<Session>, CoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions \
             WHERE state = 'running' AND last_activity_at < $1"
        ))
        .bind(idle_since)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(session_from_row).collect()
    }
}

#[async_trait]
impl CommandStore for PgStore {
    async fn create(&self, command: &AgentCommand) -> Result<(), CoreError> {
        sqlx::query(
            "INSERT INTO agent_commands (command_id, agent_id, session_id, action, payload, \
             status, created_at) VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(command.command_id)
        .bind(&command.agent_id)
        .bind(command.session_id)
        .bind(command.action.as_str())
        .bind(&command.payload)
        .bind(command.status.as_str())
        .bind(command.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, command_id: Uuid) -> Result<Option<AgentCommand>, CoreError> {
        let row = sqlx::query(&format!(
            "SELECT {COMMAND_COLUMNS} FROM agent_commands WHERE command_id = $1"
        ))
        .bind(command_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(command_from_row).transpose()
    }

    async fn mark_sent(&self, command_id: Uuid, at: DateTime<Utc>) -> Result<(), CoreError> {
        let res = sqlx::query(
            "UPDATE agent_commands SET status = 'sent', sent_at = $2 \
             WHERE command_id = $1 AND status = 'pending'",
        )
        .bind(command_id)
        .bind(at)
        .execute(&self.pool)
        .await?;
        self.check_transition(command_id, res.rows_affected(), "sent")
            .await
    }

    async fn mark_acked(&self, command_id: Uuid, at: DateTime<Utc>) -> Result<(), CoreError> {
        let res = sqlx::query(
            "UPDATE agent_commands SET status = 'ack', acked_at = $2 \
             WHERE command_id = $1 AND status IN ('pending', 'sent')",
        )
        .bind(command_id)
        .bind(at)
        .execute(&self.pool)
        .await?;
        self.check_transition(command_id, res.rows_affected(), "ack")
            .await
    }

    async fn mark_completed(
        &self,
        command_id: Uuid,
        result: &serde_json::Value,
        at: DateTime<Utc>,
    ) -> Result<(), CoreError> {
        let res = sqlx::query(
            "UPDATE agent_commands SET status = 'completed', result = $2, completed_at = $3 \
             WHERE command_id = $1 AND status IN ('pending', 'sent', 'ack')",
        )
        .bind(command_id)
        .bind(result)
        .bind(at)
        .execute(&self.pool)
        .await?;
        self.check_transition(command_id, res.rows_affected(), "completed")
            .await
    }

    async fn mark_failed(
        &self,
        command_id: Uuid,
        error_message: &str,
        at: DateTime<Utc>,
    ) -> Result<(), CoreError> {
        let res = sqlx::query(
            "UPDATE agent_commands SET status = 'failed', error_message = $2, completed_at = $3 \
             WHERE command_id = $1 AND status IN ('pending', 'sent', 'ack')",
        )
        .bind(command_id)
        .bind(error_message)
        .bind(at)
        .execute(&self.pool)
        .await?;
        self.check_transition(command_id, res.rows_affected(), "failed")
            .await
    }

    async fn list_inflight(&self, agent_id: &str) -> Result<Vec<AgentCommand>, CoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {COMMAND_COLUMNS} FROM agent_commands \
             WHERE agent_id = $1 AND status IN ('pending', 'sent', 'ack') ORDER BY created_at"
        ))
        .bind(agent_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(command_from_row).collect()
    }

    async fn list_overdue(
        &self,
        created_before: DateTime<Utc>,
    ) -> Result<Vec<AgentCommand>, CoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {COMMAND_COLUMNS} FROM agent_commands \
             WHERE status IN ('pending', 'sent', 'ack') AND created_at < $1"
        ))
        .bind(created_before)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(command_from_row).collect()
    }

    async fn find_active_lifecycle(
        &self,
        session_id: Uuid,
    ) -> Result<Option<AgentCommand>, CoreError> {
        let row = sqlx::query(&format!(
            "SELECT {COMMAND_COLUMNS} FROM agent_commands \
             WHERE session_id = $1 AND status IN ('pending', 'sent', 'ack') \
               AND action IN ('start_session', 'stop_session', 'hibernate_session', 'wake_session') \
             LIMIT 1"
        ))
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(command_from_row).transpose()
    }
}

impl PgStore {
    /// Disambiguate a zero-row guarded UPDATE: the command either does not
    /// exist or the transition would violate the state machine.
    async fn check_transition(
        &self,
        command_id: Uuid,
        rows_affected: u64,
        to: &str,
    ) -> Result<(), CoreError> {
        if rows_affected > 0 {
            return Ok(());
        }
        let current =
            sqlx::query_scalar::<_, String>("SELECT status FROM agent_commands WHERE command_id = $1")
                .bind(command_id)
                .fetch_optional(&self.pool)
                .await?;
        match current {
            None => Err(CoreError::UnknownCommand(command_id)),
            Some(status) => Err(CoreError::Conflict(format!(
                "command {command_id} cannot move {status} -> {to}"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

fn agent_from_row(row: &PgRow) -> Result<Agent, CoreError> {
    let status: String = row.try_get("status")?;
    Ok(Agent {
        agent_id: row.try_get("agent_id")?,
        platform: row.try_get("platform")?,
        region: row.try_get("region")?,
        capacity: AgentCapacity {
            max_cpu: row.try_get("max_cpu")?,
            max_memory: row.try_get("max_memory")?,
            max_sessions: row.try_get("max_sessions")?,
        },
        status: parse_agent_status(&status)?,
        connection_id: row.try_get("connection_id")?,
        last_heartbeat_at: row.try_get("last_heartbeat_at")?,
        api_key_hash: row.try_get("api_key_hash")?,
        metadata: row
            .try_get::<Option<serde_json::Value>, _>("metadata")?
            .unwrap_or(serde_json::Value::Null),
        created_at: row.try_get("created_at")?,
    })
}

fn session_from_row(row: &PgRow) -> Result<Session, CoreError> {
    let state: String = row.try_get("state")?;
    Ok(Session {
        session_id: row.try_get("session_id")?,
        user_id: row.try_get("user_id")?,
        template_id: row.try_get("template_id")?,
        agent_id: row.try_get("agent_id")?,
        platform: row.try_get("platform")?,
        state: parse_session_state(&state)?,
        resources: SessionResources {
            cpu: row.try_get("cpu")?,
            memory: row.try_get("memory")?,
            storage: row.try_get("storage")?,
        },
        persistent_home: row.try_get("persistent_home")?,
        platform_metadata: row.try_get("platform_metadata")?,
        last_activity_at: row.try_get("last_activity_at")?,
        created_at: row.try_get("created_at")?,
    })
}

fn command_from_row(row: &PgRow) -> Result<AgentCommand, CoreError> {
    let action: String = row.try_get("action")?;
    let status: String = row.try_get("status")?;
    Ok(AgentCommand {
        command_id: row.try_get("command_id")?,
        agent_id: row.try_get("agent_id")?,
        session_id: row.try_get("session_id")?,
        action: CommandAction::parse(&action)
            .ok_or_else(|| CoreError::Other(anyhow!("unknown command action: {action}")))?,
        payload: row.try_get("payload")?,
        status: parse_command_status(&status)?,
        result: row.try_get("result")?,
        // error_message is NULL on anything but failed rows; scanning it
        // into a non-nullable string would abort the read.
        error_message: row.try_get::<Option<String>, _>("error_message")?,
        created_at: row.try_get("created_at")?,
        sent_at: row.try_get("sent_at")?,
        acked_at: row.try_get("acked_at")?,
        completed_at: row.try_get("completed_at")?,
    })
}

fn parse_agent_status(s: &str) -> Result<AgentStatus, CoreError> {
    match s {
        "pending_registration" => Ok(AgentStatus::PendingRegistration),
        "online" => Ok(AgentStatus::Online),
        "offline" => Ok(AgentStatus::Offline),
        "draining" => Ok(AgentStatus::Draining),
        other => Err(CoreError::Other(anyhow!("unknown agent status: {other}"))),
    }
}

fn parse_session_state(s: &str) -> Result<SessionState, CoreError> {
    match s {
        "pending" => Ok(SessionState::Pending),
        "running" => Ok(SessionState::Running),
        "hibernated" => Ok(SessionState::Hibernated),
        "terminated" => Ok(SessionState::Terminated),
        "failed" => Ok(SessionState::Failed),
        other => Err(CoreError::Other(anyhow!("unknown session state: {other}"))),
    }
}

fn parse_command_status(s: &str) -> Result<CommandStatus, CoreError> {
    match s {
        "pending" => Ok(CommandStatus::Pending),
        "sent" => Ok(CommandStatus::Sent),
        "ack" => Ok(CommandStatus::Ack),
        "completed" => Ok(CommandStatus::Completed),
        "failed" => Ok(CommandStatus::Failed),
        other => Err(CoreError::Other(anyhow!("unknown command status: {other}"))),
    }
}
