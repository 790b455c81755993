//! Control-plane leg of the framebuffer relay:
//!
//! ```text
//! browser <--ws--> control plane <--agent conn--> agent <--tcp--> session
//! ```
//!
//! Browser bytes are wrapped in `framebuffer_data` frames onto the agent's
//! existing hub connection; agent frames are routed here by the frame router
//! and forwarded to the browser socket.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use axum::extract::ws::{Message, WebSocket};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::config::Config;
use crate::coordinator::SessionCoordinator;
use crate::dispatch::{CommandDispatch, CommandOutcome};
use crate::error::CoreError;
use crate::hub::AgentHub;
use crate::protocol::{self, Frame, SessionRefPayload};
use crate::store::SessionStore;
use crate::types::{CommandAction, SessionState};

struct Tunnel {
    agent_id: String,
    to_browser: mpsc::Sender<Vec<u8>>,
}

pub struct FramebufferProxy {
    sessions: Arc<dyn SessionStore>,
    dispatcher: Arc<dyn CommandDispatch>,
    hub: Arc<AgentHub>,
    coordinator: Arc<SessionCoordinator>,
    config: Arc<Config>,
    /// Active tunnels keyed by session. One mutex, held only across map
    /// operations.
    tunnels: Mutex<HashMap<Uuid, Tunnel>>,
}

impl FramebufferProxy {
    pub fn new(
        sessions: Arc<dyn SessionStore>,
        dispatcher: Arc<dyn CommandDispatch>,
        hub: Arc<AgentHub>,
        coordinator: Arc<SessionCoordinator>,
        config: Arc<Config>,
    ) -> Arc<Self> {
        Arc::new(Self {
            sessions,
            dispatcher,
            hub,
            coordinator,
            config,
            tunnels: Mutex::new(HashMap::new()),
        })
    }

    /// Serve one browser connection for the session's framebuffer stream.
    /// Returns when either end closes or the tunnel idles out.
    pub async fn serve(self: &Arc<Self>, session_id: Uuid, mut socket: WebSocket) {
        let agent_id = match self.open_tunnel(session_id).await {
            Ok(agent_id) => agent_id,
            Err(e) => {
                tracing::warn!(%session_id, error = %e, "framebuffer tunnel refused");
                let _ = socket
                    .send(Message::Text(
                        serde_json::json!({"error": e.to_string()}).to_string().into(),
                    ))
                    .await;
                return;
            }
        };

        let (tx, mut rx) = mpsc::channel::<Vec<u8>>(64);
        self.tunnels.lock().expect("tunnel map poisoned").insert(
            session_id,
            Tunnel {
                agent_id: agent_id.clone(),
                to_browser: tx,
            },
        );
        tracing::info!(%session_id, agent_id, "framebuffer tunnel open");

        let idle = self.config.framebuffer_idle_timeout;
        let mut deadline = tokio::time::Instant::now() + idle;

        loop {
            tokio::select! {
                msg = socket.recv() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            deadline = tokio::time::Instant::now() + idle;
                            let frame = Frame::framebuffer_data(session_id, &data);
                            if self.hub.send(&agent_id, frame).await.is_err() {
                                tracing::warn!(%session_id, "agent leg lost, closing tunnel");
                                break;
                            }
                            self.coordinator.record_activity(session_id).await;
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => {} // text/ping/pong
                        Some(Err(e)) => {
                            tracing::debug!(%session_id, error = %e, "browser socket error");
                            break;
                        }
                    }
                }
                data = rx.recv() => {
                    match data {
                        Some(data) => {
                            deadline = tokio::time::Instant::now() + idle;
                            if socket.send(Message::Binary(data.into())).await.is_err() {
                                break;
                            }
                        }
                        None => break, // tunnel torn down (agent disconnect)
                    }
                }
                () = tokio::time::sleep_until(deadline) => {
                    tracing::info!(%session_id, "framebuffer tunnel idle, closing");
                    break;
                }
            }
        }

        self.close_tunnel(session_id).await;
    }

    /// Look up the session, confirm its agent leg, and ask the agent to open
    /// the port-forward.
    async fn open_tunnel(&self, session_id: Uuid) -> Result<String, CoreError> {
        let session = self
            .sessions
            .get(session_id)
            .await?
            .ok_or(CoreError::UnknownSession(session_id))?;
        if session.state != SessionState::Running {
            return Err(CoreError::Conflict(format!(
                "session {session_id} is {}, not running",
                session.state.as_str()
            )));
        }
        let agent_id = session
            .agent_id
            .ok_or_else(|| CoreError::Conflict(format!("session {session_id} has no agent")))?;
        if !self.hub.is_connected(&agent_id) {
            return Err(CoreError::AgentDisconnected);
        }

        let payload = serde_json::to_value(SessionRefPayload { session_id })
            .map_err(|e| CoreError::Other(anyhow::anyhow!("payload encoding: {e}")))?;
        let command_id = self
            .dispatcher
            .dispatch(session_id, CommandAction::FramebufferConnect, payload)
            .await?;
        match self
            .dispatcher
            .await_command(command_id, self.config.command_timeout_framebuffer)
            .await
        {
            CommandOutcome::Completed(_) => Ok(agent_id),
            CommandOutcome::Failed(reason) => Err(CoreError::Platform(reason)),
            CommandOutcome::Timeout => Err(CoreError::Timeout),
        }
    }

    async fn close_tunnel(&self, session_id: Uuid) {
        let removed = self
            .tunnels
            .lock()
            .expect("tunnel map poisoned")
            .remove(&session_id);
        if removed.is_none() {
            return;
        }
        tracing::info!(%session_id, "framebuffer tunnel closed");

        let payload = serde_json::to_value(SessionRefPayload { session_id }).unwrap_or_default();
        if let Err(e) = self
            .dispatcher
            .dispatch(session_id, CommandAction::FramebufferDisconnect, payload)
            .await
        {
            tracing::debug!(%session_id, error = %e, "framebuffer disconnect not delivered");
        }
    }

    /// Agent-to-browser direction, called by the frame router for every
    /// inbound `framebuffer_data` frame.
    pub async fn handle_agent_data(&self, agent_id: &str, session_id: Uuid, encoded: &str) {
        let data = match protocol::decode_framebuffer_bytes(encoded) {
            Ok(data) => data,
            Err(e) => {
                tracing::warn!(%session_id, agent_id, error = %e, "bad framebuffer payload");
                return;
            }
        };

        let sender = {
            let tunnels = self.tunnels.lock().expect("tunnel map poisoned");
            tunnels
                .get(&session_id)
                .filter(|t| t.agent_id == agent_id)
                .map(|t| t.to_browser.clone())
        };
        let Some(sender) = sender else {
            tracing::debug!(%session_id, agent_id, "framebuffer data for unknown tunnel");
            return;
        };

        // A browser that cannot keep up loses frames rather than stalling
        // the agent connection.
        if sender.try_send(data).is_err() {
            tracing::debug!(%session_id, "browser behind, dropping framebuffer frame");
        }
        self.coordinator.record_activity(session_id).await;
    }

    /// Tear down every tunnel riding a disconnected agent; the browser loops
    /// observe the closed channel and finish.
    pub async fn handle_agent_disconnect(&self, agent_id: &str) {
        let mut tunnels = self.tunnels.lock().expect("tunnel map poisoned");
        tunnels.retain(|session_id, tunnel| {
            if tunnel.agent_id == agent_id {
                tracing::info!(%session_id, agent_id, "tunnel dropped with agent");
                false
            } else {
                true
            }
        });
    }
}
