//! Shared harness for the integration suites: a full control plane over the
//! in-memory store, served on an ephemeral port, plus a scripted agent
//! client speaking the real wire protocol.
#![allow(dead_code)] // each suite uses a different slice of the harness

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

use holodeck::config::Config;
use holodeck::dispatch::run_frame_router;
use holodeck::protocol::{self, Frame, HeartbeatPayload};
use holodeck::store::memory::MemoryStore;
use holodeck::store::{AppState, SessionStore};
use holodeck::types::{
    AgentCapacity, CommandAction, Session, SessionResources, SessionState,
};
use holodeck::api;

pub const BOOTSTRAP_KEY: &str = "BK";
const RECV_TIMEOUT: Duration = Duration::from_secs(5);

pub struct TestHarness {
    pub state: AppState,
    pub store: Arc<MemoryStore>,
    pub addr: SocketAddr,
    _shutdown: watch::Sender<()>,
}

pub fn test_config() -> Config {
    Config {
        listen: "127.0.0.1:0".into(),
        database_url: String::new(),
        bootstrap_key: BOOTSTRAP_KEY.into(),
        heartbeat_interval: Duration::from_secs(10),
        stale_check_interval: Duration::from_millis(200),
        stale_threshold: Duration::from_secs(45),
        command_timeout_start: Duration::from_secs(5),
        command_timeout_stop: Duration::from_secs(5),
        command_timeout_hibernate: Duration::from_secs(5),
        command_timeout_wake: Duration::from_secs(5),
        command_timeout_framebuffer: Duration::from_secs(5),
        idle_sweep_interval: Duration::from_secs(60),
        default_idle_timeout: Duration::from_secs(1800),
        writer_channel_capacity: 64,
        writer_timeout: Duration::from_secs(5),
        framebuffer_idle_timeout: Duration::from_secs(30),
    }
}

pub async fn start(config: Config) -> TestHarness {
    let store = Arc::new(MemoryStore::new());
    let (state, hub_rx) = AppState::new(
        Arc::new(config),
        store.clone(),
        store.clone(),
        store.clone(),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(());
    tokio::spawn(run_frame_router(
        hub_rx,
        state.dispatcher.clone(),
        state.proxy.clone(),
    ));
    tokio::spawn(state.hub.clone().run_stale_sweep(shutdown_rx));

    let app = api::router(state.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind test listener");
    let addr = listener.local_addr().expect("listener addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("test server");
    });

    TestHarness {
        state,
        store,
        addr,
        _shutdown: shutdown_tx,
    }
}

pub fn capacity() -> AgentCapacity {
    AgentCapacity {
        max_cpu: "8".into(),
        max_memory: "16Gi".into(),
        max_sessions: 10,
    }
}

/// Register an agent over HTTP with the bootstrap key; returns its api key.
pub async fn register_agent_http(addr: SocketAddr, agent_id: &str) -> String {
    let resp = reqwest::Client::new()
        .post(format!("http://{addr}/agents/register"))
        .header("x-holodeck-key", BOOTSTRAP_KEY)
        .json(&serde_json::json!({
            "agent_id": agent_id,
            "platform": "kubernetes",
            "region": "us-east",
            "capacity": capacity(),
        }))
        .send()
        .await
        .expect("register request");
    assert!(resp.status().is_success(), "registration failed: {}", resp.status());
    let body: serde_json::Value = resp.json().await.expect("register body");
    body["api_key"].as_str().expect("api_key in response").to_owned()
}

pub async fn insert_session(harness: &TestHarness, agent_id: Option<&str>) -> Uuid {
    let session = Session {
        session_id: Uuid::new_v4(),
        user_id: "user-1".into(),
        template_id: "firefox".into(),
        agent_id: agent_id.map(str::to_owned),
        platform: agent_id.map(|_| "kubernetes".to_owned()),
        state: SessionState::Pending,
        resources: SessionResources {
            cpu: "2".into(),
            memory: "4Gi".into(),
            storage: None,
        },
        persistent_home: false,
        platform_metadata: None,
        last_activity_at: Utc::now(),
        created_at: Utc::now(),
    };
    SessionStore::insert(harness.store.as_ref(), &session)
        .await
        .expect("insert session");
    session.session_id
}

// ---------------------------------------------------------------------------
// Scripted agent
// ---------------------------------------------------------------------------

pub struct FakeAgent {
    socket: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl FakeAgent {
    pub async fn connect(addr: SocketAddr, agent_id: &str, key: &str) -> Self {
        let mut request = format!("ws://{addr}/agents/connect")
            .into_client_request()
            .expect("client request");
        request
            .headers_mut()
            .insert("x-agent-id", agent_id.parse().expect("agent id header"));
        request
            .headers_mut()
            .insert("x-holodeck-key", key.parse().expect("key header"));
        let (socket, _) = tokio_tungstenite::connect_async(request)
            .await
            .expect("agent connect");
        Self { socket }
    }

    pub async fn send(&mut self, frame: &Frame) {
        self.socket
            .send(Message::Text(protocol::encode(frame).into()))
            .await
            .expect("agent send");
    }

    pub async fn send_text(&mut self, text: &str) {
        self.socket
            .send(Message::Text(text.to_owned().into()))
            .await
            .expect("agent send text");
    }

    pub async fn heartbeat(&mut self, active_sessions: i64) {
        self.send(&Frame::heartbeat(HeartbeatPayload {
            status: "online".into(),
            active_sessions,
            capacity: capacity(),
        }))
        .await;
    }

    /// Next protocol frame, answering pings transparently. `None` when the
    /// server closed the connection.
    pub async fn recv(&mut self) -> Option<Frame> {
        loop {
            let msg = tokio::time::timeout(RECV_TIMEOUT, self.socket.next())
                .await
                .expect("recv timed out")?;
            match msg {
                Ok(Message::Text(text)) => {
                    let frame = protocol::decode(text.as_str()).expect("undecodable frame");
                    if matches!(frame, Frame::Ping { .. }) {
                        self.send(&Frame::pong()).await;
                        continue;
                    }
                    return Some(frame);
                }
                Ok(Message::Close(_)) => return None,
                Ok(_) => continue,
                Err(_) => return None,
            }
        }
    }

    /// Wait for the server's close frame and return its code.
    pub async fn expect_close(&mut self) -> u16 {
        loop {
            let msg = tokio::time::timeout(RECV_TIMEOUT, self.socket.next())
                .await
                .expect("close timed out");
            match msg {
                Some(Ok(Message::Close(Some(frame)))) => return frame.code.into(),
                Some(Ok(_)) => continue,
                Some(Err(_)) | None => panic!("connection ended without a close frame"),
            }
        }
    }

    pub async fn expect_command(&mut self) -> (Uuid, CommandAction, serde_json::Value) {
        loop {
            match self.recv().await.expect("connection closed awaiting command") {
                Frame::Command {
                    command_id,
                    action,
                    payload,
                    ..
                } => return (command_id, action, payload),
                _ => continue,
            }
        }
    }
}
