//! Agent hub integration: wire registration, duplicate connections,
//! heartbeat acceptance, and stale-connection reaping.

mod helpers;

use std::time::Duration;

use chrono::Utc;

use holodeck::events::EventKind;
use holodeck::protocol::{
    CLOSE_MALFORMED, CLOSE_UNAUTHORIZED, CLOSE_UNKNOWN_AGENT, Frame,
};
use holodeck::store::{AgentStore, CommandStore};
use holodeck::types::{AgentStatus, CommandAction, CommandStatus};

use helpers::{FakeAgent, insert_session, register_agent_http, start, test_config};

fn register_frame(agent_id: &str) -> Frame {
    Frame::Register {
        timestamp: Utc::now(),
        agent_id: agent_id.into(),
        platform: "kubernetes".into(),
        region: "us-east".into(),
        capacity: helpers::capacity(),
        metadata: serde_json::json!({}),
    }
}

#[tokio::test]
async fn first_time_registration_over_the_wire() {
    let harness = start(test_config()).await;

    let mut agent = FakeAgent::connect(harness.addr, "A1", helpers::BOOTSTRAP_KEY).await;
    agent.send(&register_frame("A1")).await;

    let Some(Frame::RegisterOk { api_key, .. }) = agent.recv().await else {
        panic!("expected register_ok");
    };
    assert_eq!(api_key.len(), 64);
    assert!(api_key.chars().all(|c| c.is_ascii_hexdigit()));

    let row = AgentStore::get(harness.store.as_ref(), "A1")
        .await
        .unwrap()
        .expect("agent row created");
    assert!(row.api_key_hash.is_some());
    // The handshake binds the connection right after registering.
    assert_eq!(row.status, AgentStatus::Online);

    // A second identical registration attempt is refused with a close code.
    let mut dup = FakeAgent::connect(harness.addr, "A1", helpers::BOOTSTRAP_KEY).await;
    dup.send(&register_frame("A1")).await;
    assert_eq!(dup.expect_close().await, CLOSE_UNAUTHORIZED);
}

#[tokio::test]
async fn connect_rejections_distinguish_unknown_from_unauthorized() {
    let harness = start(test_config()).await;

    // Never-registered agent with a junk key.
    let mut ghost = FakeAgent::connect(harness.addr, "ghost", "nope").await;
    assert_eq!(ghost.expect_close().await, CLOSE_UNKNOWN_AGENT);

    // Registered agent with the wrong key.
    register_agent_http(harness.addr, "A1").await;
    let mut imposter = FakeAgent::connect(harness.addr, "A1", "wrong-key").await;
    assert_eq!(imposter.expect_close().await, CLOSE_UNAUTHORIZED);
}

#[tokio::test]
async fn http_registration_issues_key_once() {
    let harness = start(test_config()).await;

    let api_key = register_agent_http(harness.addr, "A1").await;
    assert_eq!(api_key.len(), 64);

    // Bootstrap again: refused.
    let resp = reqwest::Client::new()
        .post(format!("http://{}/agents/register", harness.addr))
        .header("x-holodeck-key", helpers::BOOTSTRAP_KEY)
        .json(&serde_json::json!({
            "agent_id": "A1",
            "platform": "kubernetes",
            "capacity": helpers::capacity(),
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);

    // Re-register with the agent key: accepted, no new key.
    let resp = reqwest::Client::new()
        .post(format!("http://{}/agents/register", harness.addr))
        .header("x-holodeck-key", &api_key)
        .json(&serde_json::json!({
            "agent_id": "A1",
            "platform": "kubernetes",
            "region": "eu-west",
            "capacity": helpers::capacity(),
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert!(body.get("api_key").is_none());
}

#[tokio::test]
async fn duplicate_connection_new_wins() {
    let harness = start(test_config()).await;
    let api_key = register_agent_http(harness.addr, "A1").await;

    let mut first = FakeAgent::connect(harness.addr, "A1", &api_key).await;
    first.heartbeat(0).await;

    let mut second = FakeAgent::connect(harness.addr, "A1", &api_key).await;

    // The old connection gets a shutdown frame, then the close.
    match first.recv().await {
        Some(Frame::Shutdown { reason, .. }) => {
            assert!(reason.contains("replaced"));
        }
        other => panic!("expected shutdown frame, got {other:?}"),
    }
    assert!(first.recv().await.is_none());

    // The new connection is the bound one and keeps working.
    second.heartbeat(2).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(harness.state.hub.is_connected("A1"));
    assert_eq!(harness.state.hub.reported_sessions("A1"), Some(2));

    let row = AgentStore::get(harness.store.as_ref(), "A1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.status, AgentStatus::Online);
}

#[tokio::test]
async fn nested_heartbeat_accepted_flat_heartbeat_rejected() {
    let harness = start(test_config()).await;
    let api_key = register_agent_http(harness.addr, "A1").await;

    let mut agent = FakeAgent::connect(harness.addr, "A1", &api_key).await;
    agent.heartbeat(3).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(harness.state.hub.reported_sessions("A1"), Some(3));
    let hb_after_nested = AgentStore::get(harness.store.as_ref(), "A1")
        .await
        .unwrap()
        .unwrap()
        .last_heartbeat_at
        .expect("heartbeat recorded");

    // The flat layout is malformed: the connection closes and liveness is
    // not updated.
    agent
        .send_text(r#"{"type":"heartbeat","timestamp":"2025-01-01T00:00:00Z","status":"online","active_sessions":5}"#)
        .await;
    assert_eq!(agent.expect_close().await, CLOSE_MALFORMED);

    let row = AgentStore::get(harness.store.as_ref(), "A1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.last_heartbeat_at, Some(hb_after_nested));
    assert_ne!(harness.state.hub.reported_sessions("A1"), Some(5));
}

#[tokio::test]
async fn stale_agent_swept_offline_and_commands_fail() {
    let mut config = test_config();
    config.stale_threshold = Duration::from_secs(1);
    config.stale_check_interval = Duration::from_millis(100);
    let harness = start(config).await;

    let api_key = register_agent_http(harness.addr, "A1").await;
    let mut agent = FakeAgent::connect(harness.addr, "A1", &api_key).await;
    agent.heartbeat(0).await;

    let mut events = harness.state.events.subscribe();

    // A start command is in flight when the agent goes quiet.
    let session_id = insert_session(&harness, None).await;
    let command_id = {
        use holodeck::dispatch::CommandDispatch;
        harness
            .state
            .dispatcher
            .dispatch(
                session_id,
                CommandAction::StartSession,
                serde_json::json!({"session_id": session_id}),
            )
            .await
            .expect("dispatch")
    };
    let (got_id, action, _) = agent.expect_command().await;
    assert_eq!(got_id, command_id);
    assert_eq!(action, CommandAction::StartSession);

    // No more heartbeats: within the sweep interval the hub closes the
    // connection and the agent goes offline.
    let mut saw_offline = false;
    for _ in 0..50 {
        let row = AgentStore::get(harness.store.as_ref(), "A1")
            .await
            .unwrap()
            .unwrap();
        if row.status == AgentStatus::Offline {
            saw_offline = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(saw_offline, "agent never went offline");

    // The in-flight command fails with the synthetic disconnect reason.
    let mut failed = false;
    for _ in 0..50 {
        let row = CommandStore::get(harness.store.as_ref(), command_id)
            .await
            .unwrap()
            .unwrap();
        if row.status == CommandStatus::Failed {
            assert!(
                row.error_message
                    .as_deref()
                    .unwrap_or_default()
                    .contains("agent_disconnected")
            );
            failed = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(failed, "in-flight command never failed");

    // And the offline event fired.
    let mut saw_event = false;
    while let Ok(event) =
        tokio::time::timeout(Duration::from_millis(500), events.recv()).await
    {
        if let Ok(event) = event
            && event.kind == EventKind::AgentOffline
        {
            saw_event = true;
            break;
        }
    }
    assert!(saw_event, "agent.offline never emitted");
}

#[tokio::test]
async fn register_frame_for_wrong_agent_id_refused() {
    let harness = start(test_config()).await;
    let mut agent = FakeAgent::connect(harness.addr, "A1", helpers::BOOTSTRAP_KEY).await;
    agent.send(&register_frame("A2")).await;
    assert_eq!(agent.expect_close().await, CLOSE_UNAUTHORIZED);

    assert!(
        AgentStore::get(harness.store.as_ref(), "A2")
            .await
            .unwrap()
            .is_none()
    );
}
