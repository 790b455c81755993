//! The agent runtime: a separate process that binds to the control plane
//! from outside, executes platform operations, and reports outcomes.

pub mod framebuffer;
pub mod handler;
pub mod kubernetes;

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use anyhow::{Context, anyhow};
use clap::Parser;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_util::sync::CancellationToken;

use crate::protocol::{self, DecodeError, Frame, HeartbeatPayload, SessionRefPayload};
use crate::types::{AgentCapacity, CommandAction};

use framebuffer::{FramebufferTarget, FramebufferTunnels};
use handler::HandlerRegistry;

const MAX_BACKOFF: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Parser)]
#[command(name = "holodeck-agent", about = "Holodeck platform agent")]
pub struct AgentConfig {
    #[arg(long, env = "HOLODECK_SERVER_URL", default_value = "http://127.0.0.1:8080")]
    pub server_url: String,

    #[arg(long, env = "HOLODECK_AGENT_ID")]
    pub agent_id: String,

    #[arg(long, env = "HOLODECK_AGENT_PLATFORM", default_value = "kubernetes")]
    pub platform: String,

    #[arg(long, env = "HOLODECK_AGENT_REGION", default_value = "")]
    pub region: String,

    /// Shared secret for first-time registration only.
    #[arg(long, env = "HOLODECK_BOOTSTRAP_KEY", default_value = "")]
    pub bootstrap_key: String,

    /// Where the issued agent key is persisted across restarts.
    #[arg(long, env = "HOLODECK_AGENT_STATE_DIR", default_value = "/var/lib/holodeck-agent")]
    pub state_dir: PathBuf,

    #[arg(long, env = "HOLODECK_AGENT_NAMESPACE", default_value = "holodeck-sessions")]
    pub namespace: String,

    #[arg(long, env = "HOLODECK_AGENT_MAX_CPU", default_value = "8")]
    pub max_cpu: String,

    #[arg(long, env = "HOLODECK_AGENT_MAX_MEMORY", default_value = "16Gi")]
    pub max_memory: String,

    #[arg(long, env = "HOLODECK_AGENT_MAX_SESSIONS", default_value_t = 10)]
    pub max_sessions: i32,

    #[arg(long, env = "HOLODECK_HEARTBEAT_INTERVAL", default_value_t = 30)]
    pub heartbeat_interval_secs: u64,
}

impl AgentConfig {
    pub fn capacity(&self) -> AgentCapacity {
        AgentCapacity {
            max_cpu: self.max_cpu.clone(),
            max_memory: self.max_memory.clone(),
            max_sessions: self.max_sessions,
        }
    }

    fn http_base(&self) -> &str {
        self.server_url.trim_end_matches('/')
    }

    fn ws_url(&self) -> String {
        let base = self.http_base();
        let ws_base = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            base.to_owned()
        };
        format!("{ws_base}/agents/connect")
    }

    fn key_path(&self) -> PathBuf {
        self.state_dir.join("agent.key")
    }
}

enum ConnectionEnd {
    /// The control plane told us to go away; do not reconnect.
    Shutdown,
    /// Transport loss; reconnect with backoff.
    Lost,
}

/// Run the agent: register if needed, then hold a connection to the control
/// plane, reconnecting with exponential backoff until told to shut down.
pub async fn run(
    config: AgentConfig,
    handlers: Arc<HandlerRegistry>,
    active_sessions: Arc<AtomicI64>,
    target: Arc<dyn FramebufferTarget>,
) -> anyhow::Result<()> {
    let api_key = ensure_registered(&config).await?;

    let mut delay = Duration::from_secs(1);
    loop {
        match connect_and_serve(&config, &api_key, &handlers, &active_sessions, &target).await {
            Ok(ConnectionEnd::Shutdown) => {
                tracing::info!("control plane requested shutdown");
                return Ok(());
            }
            Ok(ConnectionEnd::Lost) => {
                tracing::warn!(delay = ?delay, "connection lost, reconnecting");
            }
            Err(e) => {
                tracing::warn!(error = %e, delay = ?delay, "connection failed, retrying");
            }
        }
        tokio::time::sleep(delay).await;
        delay = (delay * 2).min(MAX_BACKOFF);
    }
}

// ---------------------------------------------------------------------------
// Registration
// ---------------------------------------------------------------------------

/// Load the persisted agent key, or perform first-time registration with the
/// bootstrap key. Registration retries with exponential backoff; the issued
/// key is written to the state dir and never reissued by the server.
async fn ensure_registered(config: &AgentConfig) -> anyhow::Result<String> {
    let key_path = config.key_path();
    if let Ok(stored) = tokio::fs::read_to_string(&key_path).await {
        let stored = stored.trim().to_owned();
        if !stored.is_empty() {
            tracing::info!(agent_id = %config.agent_id, "using stored agent key");
            return Ok(stored);
        }
    }

    if config.bootstrap_key.is_empty() {
        return Err(anyhow!(
            "no stored agent key at {} and no bootstrap key configured",
            key_path.display()
        ));
    }

    let client = reqwest::Client::new();
    let url = format!("{}/agents/register", config.http_base());
    let mut delay = Duration::from_secs(1);
    loop {
        match try_register(&client, &url, config).await {
            Ok(api_key) => {
                tokio::fs::create_dir_all(&config.state_dir)
                    .await
                    .context("creating state dir")?;
                tokio::fs::write(&key_path, &api_key)
                    .await
                    .context("persisting agent key")?;
                tracing::info!(agent_id = %config.agent_id, "registered with control plane");
                return Ok(api_key);
            }
            Err(e) => {
                tracing::warn!(error = %e, delay = ?delay, "registration failed, retrying");
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(MAX_BACKOFF);
            }
        }
    }
}

async fn try_register(
    client: &reqwest::Client,
    url: &str,
    config: &AgentConfig,
) -> anyhow::Result<String> {
    let body = serde_json::json!({
        "agent_id": config.agent_id,
        "platform": config.platform,
        "region": config.region,
        "capacity": config.capacity(),
        "metadata": { "namespace": config.namespace },
    });
    let resp = client
        .post(url)
        .header("x-holodeck-key", &config.bootstrap_key)
        .json(&body)
        .send()
        .await?;
    let status = resp.status();
    if !status.is_success() {
        return Err(anyhow!("registration refused: {status}"));
    }
    let parsed: serde_json::Value = resp.json().await?;
    parsed["api_key"]
        .as_str()
        .map(str::to_owned)
        .ok_or_else(|| anyhow!("registration response has no api_key; is this agent already registered?"))
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

async fn connect_and_serve(
    config: &AgentConfig,
    api_key: &str,
    handlers: &Arc<HandlerRegistry>,
    active_sessions: &Arc<AtomicI64>,
    target: &Arc<dyn FramebufferTarget>,
) -> anyhow::Result<ConnectionEnd> {
    let mut request = config
        .ws_url()
        .into_client_request()
        .context("building connect request")?;
    request
        .headers_mut()
        .insert("x-agent-id", config.agent_id.parse().context("agent id header")?);
    request
        .headers_mut()
        .insert("x-holodeck-key", api_key.parse().context("key header")?);

    let (stream, _) = connect_async(request)
        .await
        .context("connecting to control plane")?;
    tracing::info!(url = %config.ws_url(), "connected to control plane");

    let (mut sink, mut reader) = stream.split();
    let (out_tx, mut out_rx) = mpsc::channel::<Frame>(64);
    let tunnels = FramebufferTunnels::new(target.clone(), out_tx.clone());
    let cancel = CancellationToken::new();

    // Single writer preserves frame order on the wire.
    let writer = tokio::spawn({
        let cancel = cancel.clone();
        async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    frame = out_rx.recv() => match frame {
                        Some(frame) => {
                            let msg = Message::Text(protocol::encode(&frame).into());
                            if sink.send(msg).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }
            let _ = sink.close().await;
        }
    });

    let heartbeat = tokio::spawn({
        let cancel = cancel.clone();
        let out_tx = out_tx.clone();
        let capacity = config.capacity();
        let active = active_sessions.clone();
        let interval = Duration::from_secs(config.heartbeat_interval_secs);
        async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let payload = HeartbeatPayload {
                            status: "online".into(),
                            active_sessions: active.load(Ordering::SeqCst),
                            capacity: capacity.clone(),
                        };
                        if out_tx.send(Frame::heartbeat(payload)).await.is_err() {
                            break;
                        }
                    }
                }
            }
        }
    });

    let end = read_loop(&mut reader, &out_tx, handlers, &tunnels).await;

    cancel.cancel();
    tunnels.disconnect_all();
    let _ = writer.await;
    let _ = heartbeat.await;
    Ok(end)
}

async fn read_loop<S>(
    reader: &mut S,
    out_tx: &mpsc::Sender<Frame>,
    handlers: &Arc<HandlerRegistry>,
    tunnels: &Arc<FramebufferTunnels>,
) -> ConnectionEnd
where
    S: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    while let Some(msg) = reader.next().await {
        match msg {
            Ok(Message::Text(text)) => match protocol::decode(text.as_str()) {
                Ok(frame) => {
                    if let Some(end) = handle_frame(frame, out_tx, handlers, tunnels).await {
                        return end;
                    }
                }
                Err(DecodeError::Incomplete) => {
                    tracing::debug!("incomplete frame, retrying on same connection");
                }
                Err(DecodeError::Malformed(e)) => {
                    tracing::warn!(error = %e, "malformed frame from control plane");
                }
            },
            Ok(Message::Close(frame)) => {
                tracing::info!(?frame, "control plane closed the connection");
                return ConnectionEnd::Lost;
            }
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(error = %e, "socket read error");
                return ConnectionEnd::Lost;
            }
        }
    }
    ConnectionEnd::Lost
}

async fn handle_frame(
    frame: Frame,
    out_tx: &mpsc::Sender<Frame>,
    handlers: &Arc<HandlerRegistry>,
    tunnels: &Arc<FramebufferTunnels>,
) -> Option<ConnectionEnd> {
    match frame {
        Frame::Ping { .. } => {
            let _ = out_tx.send(Frame::pong()).await;
        }
        Frame::Command {
            command_id,
            action,
            payload,
            ..
        } => {
            // Ack first, execute after; the control plane times out commands
            // that never ack.
            let _ = out_tx.send(Frame::ack(command_id)).await;
            match action {
                CommandAction::FramebufferConnect => {
                    let out_tx = out_tx.clone();
                    let tunnels = tunnels.clone();
                    tokio::spawn(async move {
                        let reply = match serde_json::from_value::<SessionRefPayload>(payload) {
                            Ok(p) => match tunnels.connect(p.session_id).await {
                                Ok(()) => Frame::complete(
                                    command_id,
                                    serde_json::json!({ "connected": true }),
                                ),
                                Err(e) => Frame::failed(command_id, e.to_string()),
                            },
                            Err(e) => Frame::failed(command_id, format!("bad payload: {e}")),
                        };
                        let _ = out_tx.send(reply).await;
                    });
                }
                CommandAction::FramebufferDisconnect => {
                    let reply = match serde_json::from_value::<SessionRefPayload>(payload) {
                        Ok(p) => {
                            tunnels.disconnect(p.session_id);
                            Frame::complete(command_id, serde_json::json!({ "disconnected": true }))
                        }
                        Err(e) => Frame::failed(command_id, format!("bad payload: {e}")),
                    };
                    let _ = out_tx.send(reply).await;
                }
                action => match handlers.get(action) {
                    Some(handler) => {
                        let out_tx = out_tx.clone();
                        tokio::spawn(async move {
                            let reply = match handler.handle(payload).await {
                                Ok(result) => Frame::complete(command_id, result),
                                Err(e) => Frame::failed(command_id, e.to_string()),
                            };
                            let _ = out_tx.send(reply).await;
                        });
                    }
                    None => {
                        let _ = out_tx
                            .send(Frame::failed(command_id, "unknown_action"))
                            .await;
                    }
                },
            }
        }
        Frame::FramebufferData {
            session_id, bytes, ..
        } => {
            tunnels.write(session_id, &bytes);
        }
        Frame::Shutdown { reason, .. } => {
            tracing::info!(reason, "shutdown frame received");
            return Some(ConnectionEnd::Shutdown);
        }
        _ => {}
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(server_url: &str) -> AgentConfig {
        AgentConfig::parse_from([
            "holodeck-agent",
            "--agent-id",
            "A1",
            "--server-url",
            server_url,
        ])
    }

    #[test]
    fn ws_url_from_http() {
        assert_eq!(
            config("http://cp.example:8080").ws_url(),
            "ws://cp.example:8080/agents/connect"
        );
        assert_eq!(
            config("https://cp.example/").ws_url(),
            "wss://cp.example/agents/connect"
        );
    }

    #[test]
    fn capacity_from_flags() {
        let cap = config("http://x").capacity();
        assert_eq!(cap.max_cpu, "8");
        assert_eq!(cap.max_memory, "16Gi");
        assert_eq!(cap.max_sessions, 10);
    }
}
