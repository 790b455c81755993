pub mod memory;
pub mod pool;
pub mod postgres;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::config::Config;
use crate::coordinator::SessionCoordinator;
use crate::dispatch::Dispatcher;
use crate::error::CoreError;
use crate::events::EventEmitter;
use crate::hub::AgentHub;
use crate::identity::TokenService;
use crate::proxy::FramebufferProxy;
use crate::registry::AgentRegistry;
use crate::types::{
    Agent, AgentCandidate, AgentCapacity, AgentCommand, Session, SessionState,
};

/// Durable `agents` rows. The registry is the only component that inserts.
#[async_trait]
pub trait AgentStore: Send + Sync {
    async fn insert(&self, agent: &Agent) -> Result<(), CoreError>;

    async fn get(&self, agent_id: &str) -> Result<Option<Agent>, CoreError>;

    async fn update_registration(
        &self,
        agent_id: &str,
        platform: &str,
        region: &str,
        capacity: &AgentCapacity,
        metadata: &serde_json::Value,
    ) -> Result<(), CoreError>;

    async fn mark_online(&self, agent_id: &str, connection_id: Uuid) -> Result<(), CoreError>;

    /// Compare-and-set offline: only succeeds while `connection_id` still
    /// matches, so a stale close handler cannot clobber a fresh connection.
    /// Returns whether the transition happened.
    async fn mark_offline(
        &self,
        agent_id: &str,
        expected_connection: Uuid,
    ) -> Result<bool, CoreError>;

    async fn record_heartbeat(&self, agent_id: &str, at: DateTime<Utc>) -> Result<(), CoreError>;

    /// All agents with their derived active-session counts.
    async fn list(&self) -> Result<Vec<AgentCandidate>, CoreError>;

    /// Online agents matching the optional filters, with derived counts.
    async fn list_candidates(
        &self,
        platform: Option<&str>,
        region: Option<&str>,
    ) -> Result<Vec<AgentCandidate>, CoreError>;
}

/// Durable `sessions` rows. Lifecycle fields are written only by the
/// session coordinator.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn insert(&self, session: &Session) -> Result<(), CoreError>;

    async fn get(&self, session_id: Uuid) -> Result<Option<Session>, CoreError>;

    async fn list(&self, state: Option<SessionState>) -> Result<Vec<Session>, CoreError>;

    async fn assign_agent(
        &self,
        session_id: Uuid,
        agent_id: &str,
        platform: &str,
    ) -> Result<(), CoreError>;

    async fn set_state(&self, session_id: Uuid, state: SessionState) -> Result<(), CoreError>;

    async fn set_platform_metadata(
        &self,
        session_id: Uuid,
        metadata: &serde_json::Value,
    ) -> Result<(), CoreError>;

    async fn touch_activity(&self, session_id: Uuid, at: DateTime<Utc>) -> Result<(), CoreError>;

    /// Running sessions whose last activity is older than `idle_since`.
    /// Future-dated activity timestamps are treated as recent.
    async fn list_idle_running(
        &self,
        idle_since: DateTime<Utc>,
    ) -> Result<Vec<Session>, CoreError>;
}

/// Durable `agent_commands` rows, state-machined per row. Transitions that
/// would move backwards or reopen a terminal row return a conflict.
#[async_trait]
pub trait CommandStore: Send + Sync {
    async fn create(&self, command: &AgentCommand) -> Result<(), CoreError>;

    async fn get(&self, command_id: Uuid) -> Result<Option<AgentCommand>, CoreError>;

    async fn mark_sent(&self, command_id: Uuid, at: DateTime<Utc>) -> Result<(), CoreError>;

    async fn mark_acked(&self, command_id: Uuid, at: DateTime<Utc>) -> Result<(), CoreError>;

    async fn mark_completed(
        &self,
        command_id: Uuid,
        result: &serde_json::Value,
        at: DateTime<Utc>,
    ) -> Result<(), CoreError>;

    async fn mark_failed(
        &self,
        command_id: Uuid,
        error_message: &str,
        at: DateTime<Utc>,
    ) -> Result<(), CoreError>;

    /// Non-terminal commands targeting the agent.
    async fn list_inflight(&self, agent_id: &str) -> Result<Vec<AgentCommand>, CoreError>;

    /// Non-terminal commands created before the cutoff, across all agents.
    /// Feeds the overdue sweep that catches rows orphaned by a restart.
    async fn list_overdue(
        &self,
        created_before: DateTime<Utc>,
    ) -> Result<Vec<AgentCommand>, CoreError>;

    /// The non-terminal lifecycle command for a session, if any. At most one
    /// exists at a time.
    async fn find_active_lifecycle(
        &self,
        session_id: Uuid,
    ) -> Result<Option<AgentCommand>, CoreError>;
}

#[derive(Clone)]
pub struct AppState {
    pub agents: Arc<dyn AgentStore>,
    pub sessions: Arc<dyn SessionStore>,
    pub commands: Arc<dyn CommandStore>,
    pub tokens: Arc<TokenService>,
    pub registry: Arc<AgentRegistry>,
    pub hub: Arc<AgentHub>,
    pub dispatcher: Arc<Dispatcher>,
    pub coordinator: Arc<SessionCoordinator>,
    pub proxy: Arc<FramebufferProxy>,
    pub events: EventEmitter,
    pub config: Arc<Config>,
}

impl AppState {
    /// Wire the core services over a set of stores. The returned receiver
    /// must be drained by `dispatch::run_frame_router`.
    pub fn new(
        config: Arc<Config>,
        agents: Arc<dyn AgentStore>,
        sessions: Arc<dyn SessionStore>,
        commands: Arc<dyn CommandStore>,
    ) -> (Self, tokio::sync::mpsc::Receiver<crate::hub::HubEvent>) {
        let events = EventEmitter::default();
        let tokens = Arc::new(TokenService::new(
            config.bootstrap_key.clone(),
            agents.clone(),
        ));
        let registry = Arc::new(AgentRegistry::new(agents.clone()));
        let (hub, hub_rx) = AgentHub::new(registry.clone(), events.clone(), config.clone());
        let dispatcher = Dispatcher::new(
            hub.clone(),
            agents.clone(),
            sessions.clone(),
            commands.clone(),
            events.clone(),
            config.clone(),
        );
        let coordinator = SessionCoordinator::new(
            sessions.clone(),
            dispatcher.clone(),
            events.clone(),
            config.clone(),
        );
        let proxy = FramebufferProxy::new(
            sessions.clone(),
            dispatcher.clone(),
            hub.clone(),
            coordinator.clone(),
            config.clone(),
        );

        (
            Self {
                agents,
                sessions,
                commands,
                tokens,
                registry,
                hub,
                dispatcher,
                coordinator,
                proxy,
                events,
                config,
            },
            hub_rx,
        )
    }
}
