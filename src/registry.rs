use std::sync::Arc;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::CoreError;
use crate::identity::{Verdict, issue_agent_key};
use crate::store::AgentStore;
use crate::types::{Agent, AgentCandidate, AgentCapacity, AgentStatus};

/// Outcome of a registration call. `api_key` is present only for a
/// first-time registration and is never reproducible afterwards.
#[derive(Debug)]
pub struct Registration {
    pub api_key: Option<String>,
}

/// Owns the durable agent records. All writes to the agent table go
/// through here.
pub struct AgentRegistry {
    agents: Arc<dyn AgentStore>,
}

impl AgentRegistry {
    pub fn new(agents: Arc<dyn AgentStore>) -> Self {
        Self { agents }
    }

    /// Register or re-register an agent. The bootstrap key only ever admits
    /// a previously unknown `agent_id`; a known agent must present its own
    /// key, and may update its declared platform details but not change
    /// platform outright.
    #[tracing::instrument(skip(self, capacity, metadata), err)]
    pub async fn register(
        &self,
        agent_id: &str,
        platform: &str,
        region: &str,
        capacity: &AgentCapacity,
        metadata: &serde_json::Value,
        verdict: Verdict,
    ) -> Result<Registration, CoreError> {
        match (self.agents.get(agent_id).await?, verdict) {
            (None, Verdict::BootstrapOk) => {
                let (api_key, api_key_hash) = issue_agent_key();
                let agent = Agent {
                    agent_id: agent_id.to_owned(),
                    platform: platform.to_owned(),
                    region: region.to_owned(),
                    capacity: capacity.clone(),
                    status: AgentStatus::PendingRegistration,
                    connection_id: None,
                    last_heartbeat_at: None,
                    api_key_hash: Some(api_key_hash),
                    metadata: metadata.clone(),
                    created_at: Utc::now(),
                };
                self.agents.insert(&agent).await?;
                tracing::info!(agent_id, platform, region, "agent registered");
                Ok(Registration {
                    api_key: Some(api_key),
                })
            }
            (Some(existing), Verdict::AgentKeyOk) => {
                if existing.platform != platform {
                    return Err(CoreError::Conflict(format!(
                        "agent {agent_id} is registered for platform {}, not {platform}",
                        existing.platform
                    )));
                }
                self.agents
                    .update_registration(agent_id, platform, region, capacity, metadata)
                    .await?;
                tracing::info!(agent_id, "agent re-registered");
                Ok(Registration { api_key: None })
            }
            _ => Err(CoreError::Unauthorized),
        }
    }

    pub async fn get(&self, agent_id: &str) -> Result<Option<Agent>, CoreError> {
        self.agents.get(agent_id).await
    }

    pub async fn mark_online(&self, agent_id: &str, connection_id: Uuid) -> Result<(), CoreError> {
        self.agents.mark_online(agent_id, connection_id).await
    }

    /// CAS on `connection_id`: a close handler for a superseded connection
    /// must not mark a freshly bound agent offline.
    pub async fn mark_offline(
        &self,
        agent_id: &str,
        expected_connection: Uuid,
    ) -> Result<bool, CoreError> {
        self.agents.mark_offline(agent_id, expected_connection).await
    }

    pub async fn record_heartbeat(
        &self,
        agent_id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), CoreError> {
        self.agents.record_heartbeat(agent_id, at).await
    }

    pub async fn list(&self) -> Result<Vec<AgentCandidate>, CoreError> {
        self.agents.list().await
    }
}
