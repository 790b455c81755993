//! The agent hub: the single point at which agents are bound to the live
//! process. Each connection runs its own reader and writer tasks; the shared
//! agent index is one mutex-guarded map, held only across map operations.

mod connection;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::sync::atomic::Ordering;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use chrono::Utc;
use futures_util::stream::StreamExt;
use tokio::sync::{mpsc, watch};

pub use connection::ConnectionHandle;
use connection::Outbound;

use crate::config::Config;
use crate::error::CoreError;
use crate::events::{EventEmitter, EventKind};
use crate::identity::Verdict;
use crate::protocol::{
    self, CLOSE_REPLACED, CLOSE_UNAUTHORIZED, CLOSE_UNKNOWN_AGENT, Frame,
};
use crate::registry::AgentRegistry;

/// How long a bootstrap connection gets to present its `register` frame.
const REGISTER_TIMEOUT: Duration = Duration::from_secs(10);

/// Inbound traffic the hub does not consume itself, forwarded to the
/// dispatcher and framebuffer proxy by the frame router task.
#[derive(Debug)]
pub enum HubEvent {
    Frame { agent_id: String, frame: Frame },
    Disconnected { agent_id: String },
}

pub struct AgentHub {
    connections: Mutex<HashMap<String, Arc<ConnectionHandle>>>,
    registry: Arc<AgentRegistry>,
    events: EventEmitter,
    inbound: mpsc::Sender<HubEvent>,
    pub(crate) config: Arc<Config>,
}

impl AgentHub {
    pub fn new(
        registry: Arc<AgentRegistry>,
        events: EventEmitter,
        config: Arc<Config>,
    ) -> (Arc<Self>, mpsc::Receiver<HubEvent>) {
        let (inbound, rx) = mpsc::channel(256);
        (
            Arc::new(Self {
                connections: Mutex::new(HashMap::new()),
                registry,
                events,
                inbound,
                config,
            }),
            rx,
        )
    }

    // -----------------------------------------------------------------------
    // Admission
    // -----------------------------------------------------------------------

    /// Drive an upgraded agent socket through admission and, if admitted,
    /// serve it until it closes. The credential verdict is computed from the
    /// upgrade headers before this is called.
    pub async fn serve_connection(
        self: &Arc<Self>,
        agent_id: String,
        verdict: Verdict,
        mut socket: WebSocket,
    ) {
        match verdict {
            Verdict::AgentKeyOk => self.bind_and_run(agent_id, socket).await,
            Verdict::BootstrapOk => {
                // First-time registration over the wire: the first frame must
                // be `register`, answered with `register_ok` and a one-time key.
                match self.registration_handshake(&agent_id, &mut socket).await {
                    Ok(()) => self.bind_and_run(agent_id, socket).await,
                    Err(code) => close_socket(socket, code, "registration refused").await,
                }
            }
            Verdict::Missing | Verdict::Mismatch => {
                // Distinguish a bad credential from an agent we have never
                // heard of.
                let known = matches!(self.registry.get(&agent_id).await, Ok(Some(_)));
                let code = if known {
                    CLOSE_UNAUTHORIZED
                } else {
                    CLOSE_UNKNOWN_AGENT
                };
                tracing::warn!(agent_id, ?verdict, "agent connection refused");
                close_socket(socket, code, "unauthorized").await;
            }
        }
    }

    async fn registration_handshake(
        &self,
        agent_id: &str,
        socket: &mut WebSocket,
    ) -> Result<(), u16> {
        let first = tokio::time::timeout(REGISTER_TIMEOUT, socket.next()).await;
        let Ok(Some(Ok(Message::Text(text)))) = first else {
            return Err(CLOSE_UNAUTHORIZED);
        };
        let frame = protocol::decode(&text).map_err(|_| protocol::CLOSE_MALFORMED)?;
        let Frame::Register {
            agent_id: frame_agent_id,
            platform,
            region,
            capacity,
            metadata,
            ..
        } = frame
        else {
            return Err(protocol::CLOSE_MALFORMED);
        };
        if frame_agent_id != agent_id {
            return Err(CLOSE_UNAUTHORIZED);
        }

        let registration = self
            .registry
            .register(
                agent_id,
                &platform,
                &region,
                &capacity,
                &metadata,
                Verdict::BootstrapOk,
            )
            .await
            .map_err(|e| match e {
                CoreError::Unauthorized => CLOSE_UNAUTHORIZED,
                _ => protocol::CLOSE_SHUTDOWN,
            })?;

        let Some(api_key) = registration.api_key else {
            return Err(CLOSE_UNAUTHORIZED);
        };
        let reply = Frame::RegisterOk {
            timestamp: Utc::now(),
            api_key,
        };
        socket
            .send(Message::Text(protocol::encode(&reply).into()))
            .await
            .map_err(|_| protocol::CLOSE_SHUTDOWN)?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Bind / unbind
    // -----------------------------------------------------------------------

    async fn bind_and_run(self: &Arc<Self>, agent_id: String, socket: WebSocket) {
        let (tx, rx) = mpsc::channel(self.config.writer_channel_capacity);
        let handle = Arc::new(ConnectionHandle::new(agent_id.clone(), tx));

        // New wins: a reconnecting agent must not be locked out by a zombie
        // connection the hub has not yet noticed.
        let old = {
            let mut connections = self.connections.lock().expect("agent index poisoned");
            connections.insert(agent_id.clone(), handle.clone())
        };
        if let Some(old) = old {
            let _ = old
                .outbound
                .try_send(Outbound::Frame(Frame::shutdown("replaced by new connection")));
            old.set_close_code(CLOSE_REPLACED);
            old.cancel.cancel();
            tracing::info!(agent_id, "replaced duplicate agent connection");
        }

        if let Err(e) = self
            .registry
            .mark_online(&agent_id, handle.connection_id)
            .await
        {
            tracing::error!(agent_id, error = %e, "failed to mark agent online");
            self.connections
                .lock()
                .expect("agent index poisoned")
                .remove(&agent_id);
            close_socket(socket, CLOSE_UNKNOWN_AGENT, "unknown agent").await;
            return;
        }

        self.events.emit(
            EventKind::AgentOnline,
            serde_json::json!({
                "agent_id": agent_id,
                "connection_id": handle.connection_id,
            }),
        );
        tracing::info!(agent_id, connection_id = %handle.connection_id, "agent connected");

        let (sink, stream) = socket.split();
        tokio::spawn(connection::run_writer(
            self.clone(),
            handle.clone(),
            sink,
            rx,
        ));
        connection::run_reader(self.clone(), handle, stream).await;
    }

    /// Tear down a connection exactly once: drop it from the index, CAS the
    /// agent offline, and tell the dispatcher so in-flight commands fail.
    pub(crate) async fn unbind(&self, handle: &Arc<ConnectionHandle>) {
        if handle.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        handle.cancel.cancel();

        {
            let mut connections = self.connections.lock().expect("agent index poisoned");
            if connections
                .get(&handle.agent_id)
                .is_some_and(|current| current.connection_id == handle.connection_id)
            {
                connections.remove(&handle.agent_id);
            }
        }

        match self
            .registry
            .mark_offline(&handle.agent_id, handle.connection_id)
            .await
        {
            Ok(true) => {
                tracing::info!(agent_id = %handle.agent_id, "agent disconnected");
                self.events.emit(
                    EventKind::AgentOffline,
                    serde_json::json!({ "agent_id": handle.agent_id }),
                );
                let _ = self
                    .inbound
                    .send(HubEvent::Disconnected {
                        agent_id: handle.agent_id.clone(),
                    })
                    .await;
            }
            Ok(false) => {
                // A newer connection owns the agent; nothing to report.
                tracing::debug!(agent_id = %handle.agent_id, "stale close handler lost the race");
            }
            Err(e) => {
                tracing::error!(agent_id = %handle.agent_id, error = %e, "failed to mark agent offline");
            }
        }
    }

    // -----------------------------------------------------------------------
    // Frame routing
    // -----------------------------------------------------------------------

    pub(crate) async fn route_frame(&self, handle: &Arc<ConnectionHandle>, frame: Frame) {
        match frame {
            Frame::Heartbeat { payload, .. } => {
                let now = Utc::now();
                handle.touch_heartbeat(now);
                handle
                    .active_sessions
                    .store(payload.active_sessions, Ordering::SeqCst);
                if let Err(e) = self.registry.record_heartbeat(&handle.agent_id, now).await {
                    tracing::warn!(agent_id = %handle.agent_id, error = %e, "failed to record heartbeat");
                }
            }
            Frame::Pong { .. } => {
                handle.awaiting_pong.store(false, Ordering::SeqCst);
            }
            Frame::Ping { .. } => {
                let _ = handle.outbound.try_send(Outbound::Frame(Frame::pong()));
            }
            frame @ (Frame::Ack { .. }
            | Frame::Complete { .. }
            | Frame::Failed { .. }
            | Frame::Status { .. }
            | Frame::FramebufferData { .. }) => {
                let _ = self
                    .inbound
                    .send(HubEvent::Frame {
                        agent_id: handle.agent_id.clone(),
                        frame,
                    })
                    .await;
            }
            Frame::Register { .. }
            | Frame::RegisterOk { .. }
            | Frame::Command { .. }
            | Frame::Shutdown { .. } => {
                tracing::warn!(agent_id = %handle.agent_id, "unexpected frame type on bound connection");
            }
        }
    }

    // -----------------------------------------------------------------------
    // Outgoing
    // -----------------------------------------------------------------------

    /// Enqueue a frame for an agent's writer. A queue that stays full past
    /// the writer timeout marks the connection unhealthy and closes it.
    pub async fn send(&self, agent_id: &str, frame: Frame) -> Result<(), CoreError> {
        let handle = {
            let connections = self.connections.lock().expect("agent index poisoned");
            connections.get(agent_id).cloned()
        }
        .ok_or(CoreError::AgentDisconnected)?;

        match handle
            .outbound
            .send_timeout(Outbound::Frame(frame), self.config.writer_timeout)
            .await
        {
            Ok(()) => Ok(()),
            Err(_) => {
                tracing::warn!(agent_id, "writer queue unavailable, closing connection");
                handle.cancel.cancel();
                Err(CoreError::AgentDisconnected)
            }
        }
    }

    pub fn is_connected(&self, agent_id: &str) -> bool {
        self.connections
            .lock()
            .expect("agent index poisoned")
            .contains_key(agent_id)
    }

    /// Last session count the agent reported in a heartbeat, if connected.
    pub fn reported_sessions(&self, agent_id: &str) -> Option<i64> {
        self.connections
            .lock()
            .expect("agent index poisoned")
            .get(agent_id)
            .map(|h| h.active_sessions.load(Ordering::SeqCst))
    }

    // -----------------------------------------------------------------------
    // Background tasks
    // -----------------------------------------------------------------------

    /// Process-wide sweep closing connections whose last heartbeat is older
    /// than the stale threshold.
    pub async fn run_stale_sweep(self: Arc<Self>, mut shutdown: watch::Receiver<()>) {
        tracing::info!("stale connection sweep started");
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    tracing::info!("stale connection sweep shutting down");
                    break;
                }
                () = tokio::time::sleep(self.config.stale_check_interval) => {
                    self.sweep_stale();
                }
            }
        }
    }

    fn sweep_stale(&self) {
        let threshold = chrono::Duration::from_std(self.config.stale_threshold)
            .unwrap_or_else(|_| chrono::Duration::seconds(45));
        let cutoff = Utc::now() - threshold;

        let stale: Vec<Arc<ConnectionHandle>> = {
            let connections = self.connections.lock().expect("agent index poisoned");
            connections
                .values()
                .filter(|h| h.last_heartbeat() < cutoff)
                .cloned()
                .collect()
        };

        for handle in stale {
            tracing::warn!(
                agent_id = %handle.agent_id,
                last_heartbeat = %handle.last_heartbeat(),
                "agent heartbeat stale, closing connection"
            );
            handle.cancel.cancel();
        }
    }

    /// Close every bound connection with a shutdown frame. In-flight
    /// commands fail through the normal disconnect path.
    pub async fn shutdown_all(&self) {
        let handles: Vec<Arc<ConnectionHandle>> = {
            let connections = self.connections.lock().expect("agent index poisoned");
            connections.values().cloned().collect()
        };
        for handle in handles {
            let _ = handle
                .outbound
                .try_send(Outbound::Frame(Frame::shutdown("control plane shutting down")));
            handle.cancel.cancel();
        }
    }
}

async fn close_socket(mut socket: WebSocket, code: u16, reason: &'static str) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.into(),
        })))
        .await;
}
