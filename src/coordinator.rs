//! Session coordinator: the only writer of session lifecycle state. All
//! mutations flow through the dispatcher so the command state machine holds
//! for every path, including the idle-hibernation sweep.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use uuid::Uuid;

use crate::config::Config;
use crate::dispatch::{CommandDispatch, CommandOutcome};
use crate::error::CoreError;
use crate::events::{EventEmitter, EventKind};
use crate::protocol::{SessionRefPayload, StartSessionPayload, StopSessionPayload};
use crate::store::SessionStore;
use crate::types::{CommandAction, Session, SessionResources, SessionState};

/// At most one `last_activity_at` write per session per window.
const ACTIVITY_DEBOUNCE: Duration = Duration::from_secs(30);

/// Slack on top of the dispatcher's own per-action deadline, so the outcome
/// waiter observes the dispatcher-side timeout rather than racing it.
const AWAIT_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct CreateSession {
    pub user_id: String,
    pub template_id: String,
    pub resources: SessionResources,
    pub persistent_home: bool,
    /// Pins agent selection to a platform when set.
    pub platform: Option<String>,
}

pub struct SessionCoordinator {
    sessions: Arc<dyn SessionStore>,
    dispatcher: Arc<dyn CommandDispatch>,
    events: EventEmitter,
    config: Arc<Config>,
    activity: Mutex<HashMap<Uuid, DateTime<Utc>>>,
}

impl SessionCoordinator {
    pub fn new(
        sessions: Arc<dyn SessionStore>,
        dispatcher: Arc<dyn CommandDispatch>,
        events: EventEmitter,
        config: Arc<Config>,
    ) -> Arc<Self> {
        Arc::new(Self {
            sessions,
            dispatcher,
            events,
            config,
            activity: Mutex::new(HashMap::new()),
        })
    }

    // -----------------------------------------------------------------------
    // Lifecycle entry points
    // -----------------------------------------------------------------------

    /// Create a session and kick off placement. Returns the pending row;
    /// the transition to running (or failed) lands when the start command
    /// resolves.
    #[tracing::instrument(skip(self, req), fields(user_id = %req.user_id), err)]
    pub async fn create(self: &Arc<Self>, req: CreateSession) -> Result<Session, CoreError> {
        let session = Session {
            session_id: Uuid::new_v4(),
            user_id: req.user_id,
            template_id: req.template_id,
            agent_id: None,
            platform: req.platform,
            state: SessionState::Pending,
            resources: req.resources,
            persistent_home: req.persistent_home,
            platform_metadata: None,
            last_activity_at: Utc::now(),
            created_at: Utc::now(),
        };
        self.sessions.insert(&session).await?;
        tracing::info!(session_id = %session.session_id, "session created");

        let payload = StartSessionPayload {
            session_id: session.session_id,
            user: session.user_id.clone(),
            template: session.template_id.clone(),
            resources: session.resources.clone(),
            persistent_home: session.persistent_home,
        };
        let payload = serde_json::to_value(payload)
            .map_err(|e| CoreError::Other(anyhow::anyhow!("payload encoding: {e}")))?;

        match self
            .dispatcher
            .dispatch(session.session_id, CommandAction::StartSession, payload)
            .await
        {
            Ok(command_id) => {
                self.spawn_outcome_waiter(
                    session.session_id,
                    command_id,
                    CommandAction::StartSession,
                );
            }
            Err(e) => {
                // No dispatch cycle will place this session; fail it now.
                self.fail_session(session.session_id, &e.to_string(), e.is_retryable())
                    .await;
            }
        }

        self.sessions
            .get(session.session_id)
            .await?
            .ok_or(CoreError::UnknownSession(session.session_id))
    }

    /// Stop the session's workload and mark it terminated. The user-scoped
    /// persistent volume is retained.
    #[tracing::instrument(skip(self), err)]
    pub async fn terminate(self: &Arc<Self>, session_id: Uuid) -> Result<(), CoreError> {
        let session = self.get(session_id).await?;
        if session.state == SessionState::Terminated {
            return Ok(());
        }

        if session.agent_id.is_none() {
            // Nothing was ever placed; terminate directly.
            self.sessions
                .set_state(session_id, SessionState::Terminated)
                .await?;
            return Ok(());
        }

        let payload = serde_json::to_value(StopSessionPayload {
            session_id,
            delete_persistent: false,
        })
        .map_err(|e| CoreError::Other(anyhow::anyhow!("payload encoding: {e}")))?;
        let command_id = self
            .dispatcher
            .dispatch(session_id, CommandAction::StopSession, payload)
            .await?;
        self.spawn_outcome_waiter(session_id, command_id, CommandAction::StopSession);
        Ok(())
    }

    /// Scale the workload to zero, preserving the persistent volume.
    #[tracing::instrument(skip(self), err)]
    pub async fn hibernate(self: &Arc<Self>, session_id: Uuid) -> Result<(), CoreError> {
        let session = self.get(session_id).await?;
        if session.state != SessionState::Running {
            return Err(CoreError::Conflict(format!(
                "session {session_id} is {}, not running",
                session.state.as_str()
            )));
        }

        let payload = session_ref_payload(session_id)?;
        let command_id = self
            .dispatcher
            .dispatch(session_id, CommandAction::HibernateSession, payload)
            .await?;
        self.spawn_outcome_waiter(session_id, command_id, CommandAction::HibernateSession);
        Ok(())
    }

    /// Scale the workload back up and refresh the connection endpoint.
    #[tracing::instrument(skip(self), err)]
    pub async fn wake(self: &Arc<Self>, session_id: Uuid) -> Result<(), CoreError> {
        let session = self.get(session_id).await?;
        if session.state != SessionState::Hibernated {
            return Err(CoreError::Conflict(format!(
                "session {session_id} is {}, not hibernated",
                session.state.as_str()
            )));
        }

        let payload = session_ref_payload(session_id)?;
        let command_id = self
            .dispatcher
            .dispatch(session_id, CommandAction::WakeSession, payload)
            .await?;
        self.spawn_outcome_waiter(session_id, command_id, CommandAction::WakeSession);
        Ok(())
    }

    pub async fn get(&self, session_id: Uuid) -> Result<Session, CoreError> {
        self.sessions
            .get(session_id)
            .await?
            .ok_or(CoreError::UnknownSession(session_id))
    }

    pub async fn list(&self, state: Option<SessionState>) -> Result<Vec<Session>, CoreError> {
        self.sessions.list(state).await
    }

    // -----------------------------------------------------------------------
    // Activity
    // -----------------------------------------------------------------------

    /// Record user interaction, debounced to one store write per session per
    /// window. Fed by the framebuffer proxy on every data exchange.
    pub async fn record_activity(&self, session_id: Uuid) {
        let now = Utc::now();
        {
            let mut activity = self.activity.lock().expect("activity map poisoned");
            if let Some(last) = activity.get(&session_id) {
                let elapsed = (now - *last).to_std().unwrap_or_default();
                if elapsed < ACTIVITY_DEBOUNCE {
                    return;
                }
            }
            activity.insert(session_id, now);
        }
        if let Err(e) = self.sessions.touch_activity(session_id, now).await {
            tracing::debug!(%session_id, error = %e, "failed to record activity");
        }
    }

    // -----------------------------------------------------------------------
    // Idle hibernation sweep
    // -----------------------------------------------------------------------

    pub async fn run_idle_sweep(self: Arc<Self>, mut shutdown: watch::Receiver<()>) {
        tracing::info!("idle hibernation sweep started");
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    tracing::info!("idle hibernation sweep shutting down");
                    break;
                }
                () = tokio::time::sleep(self.config.idle_sweep_interval) => {
                    self.sweep_idle_once().await;
                }
            }
        }
    }

    /// One pass of the idle scanner. Sessions with recent (or future-dated)
    /// activity are skipped by the store query; everything else goes through
    /// the normal hibernate path so the state machine holds.
    pub async fn sweep_idle_once(self: &Arc<Self>) {
        let threshold = chrono::Duration::from_std(self.config.default_idle_timeout)
            .unwrap_or_else(|_| chrono::Duration::seconds(1800));
        let cutoff = Utc::now() - threshold;

        let idle = match self.sessions.list_idle_running(cutoff).await {
            Ok(sessions) => sessions,
            Err(e) => {
                tracing::error!(error = %e, "idle sweep query failed");
                return;
            }
        };

        for session in idle {
            tracing::info!(
                session_id = %session.session_id,
                last_activity_at = %session.last_activity_at,
                "hibernating idle session"
            );
            match self.hibernate(session.session_id).await {
                Ok(()) => {}
                // A lifecycle command already in flight wins; skip quietly.
                Err(CoreError::Conflict(_)) => {}
                Err(e) => {
                    tracing::warn!(session_id = %session.session_id, error = %e, "idle hibernate failed");
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Outcome application
    // -----------------------------------------------------------------------

    fn spawn_outcome_waiter(
        self: &Arc<Self>,
        session_id: Uuid,
        command_id: Uuid,
        action: CommandAction,
    ) {
        let coordinator = self.clone();
        let timeout = self.config.command_timeout(action) + AWAIT_GRACE;
        tokio::spawn(async move {
            let outcome = coordinator
                .dispatcher
                .await_command(command_id, timeout)
                .await;
            coordinator
                .apply_outcome(session_id, action, outcome)
                .await;
        });
    }

    async fn apply_outcome(&self, session_id: Uuid, action: CommandAction, outcome: CommandOutcome) {
        match (action, outcome) {
            (CommandAction::StartSession, CommandOutcome::Completed(result)) => {
                if let Err(e) = self.sessions.set_platform_metadata(session_id, &result).await {
                    tracing::error!(%session_id, error = %e, "failed to store platform metadata");
                }
                self.transition(session_id, SessionState::Running).await;
            }
            (CommandAction::StartSession, CommandOutcome::Failed(reason)) => {
                let retryable =
                    reason == "agent_disconnected" || reason == "no_agent_available";
                self.fail_session(session_id, &reason, retryable).await;
            }
            (CommandAction::StartSession, CommandOutcome::Timeout) => {
                self.fail_session(session_id, "timeout", false).await;
            }
            (CommandAction::StopSession, CommandOutcome::Completed(_)) => {
                self.transition(session_id, SessionState::Terminated).await;
            }
            (CommandAction::HibernateSession, CommandOutcome::Completed(_)) => {
                self.transition(session_id, SessionState::Hibernated).await;
            }
            (CommandAction::WakeSession, CommandOutcome::Completed(result)) => {
                self.merge_platform_metadata(session_id, &result).await;
                self.transition(session_id, SessionState::Running).await;
            }
            (action, CommandOutcome::Failed(reason)) => {
                // Non-start failures surface to the user; session state is
                // left where it was.
                tracing::warn!(
                    %session_id,
                    action = action.as_str(),
                    reason,
                    "session command failed"
                );
            }
            (action, CommandOutcome::Timeout) => {
                tracing::warn!(%session_id, action = action.as_str(), "session command timed out");
            }
            (action, CommandOutcome::Completed(_)) => {
                tracing::debug!(%session_id, action = action.as_str(), "command completed");
            }
        }
    }

    async fn transition(&self, session_id: Uuid, state: SessionState) {
        if let Err(e) = self.sessions.set_state(session_id, state).await {
            tracing::error!(%session_id, error = %e, "failed to set session state");
            return;
        }
        tracing::info!(%session_id, state = state.as_str(), "session state changed");
        self.events.emit(
            EventKind::SessionState,
            serde_json::json!({ "session_id": session_id, "state": state.as_str() }),
        );
    }

    async fn fail_session(&self, session_id: Uuid, reason: &str, retryable: bool) {
        if let Err(e) = self.sessions.set_state(session_id, SessionState::Failed).await {
            tracing::error!(%session_id, error = %e, "failed to mark session failed");
            return;
        }
        tracing::warn!(%session_id, reason, retryable, "session failed");
        self.events.emit(
            EventKind::SessionState,
            serde_json::json!({
                "session_id": session_id,
                "state": "failed",
                "reason": reason,
                "retryable": retryable,
            }),
        );
    }

    async fn merge_platform_metadata(&self, session_id: Uuid, update: &serde_json::Value) {
        let existing = match self.sessions.get(session_id).await {
            Ok(Some(session)) => session.platform_metadata,
            _ => None,
        };
        let mut merged = existing.unwrap_or_else(|| serde_json::json!({}));
        if let (Some(base), Some(new)) = (merged.as_object_mut(), update.as_object()) {
            for (key, value) in new {
                base.insert(key.clone(), value.clone());
            }
        }
        if let Err(e) = self.sessions.set_platform_metadata(session_id, &merged).await {
            tracing::error!(%session_id, error = %e, "failed to merge platform metadata");
        }
    }

}

fn session_ref_payload(session_id: Uuid) -> Result<serde_json::Value, CoreError> {
    serde_json::to_value(SessionRefPayload { session_id })
        .map_err(|e| CoreError::Other(anyhow::anyhow!("payload encoding: {e}")))
}
