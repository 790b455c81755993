//! Dispatcher integration over the real hub and wire protocol: duplicate
//! suppression, the command state machine end to end, timeouts, and late
//! responses.

mod helpers;

use std::time::Duration;

use holodeck::dispatch::{CommandDispatch, CommandOutcome};
use holodeck::protocol::Frame;
use holodeck::store::CommandStore;
use holodeck::types::{CommandAction, CommandStatus};

use helpers::{FakeAgent, insert_session, register_agent_http, start, test_config};

#[tokio::test]
async fn concurrent_dispatch_returns_one_command() {
    let harness = start(test_config()).await;
    let api_key = register_agent_http(harness.addr, "A1").await;
    let mut agent = FakeAgent::connect(harness.addr, "A1", &api_key).await;
    agent.heartbeat(0).await;

    let session_id = insert_session(&harness, Some("A1")).await;
    let payload = serde_json::json!({"session_id": session_id});

    let dispatcher = harness.state.dispatcher.clone();
    let (a, b) = tokio::join!(
        dispatcher.dispatch(session_id, CommandAction::StartSession, payload.clone()),
        dispatcher.dispatch(session_id, CommandAction::StartSession, payload),
    );
    let a = a.expect("first dispatch");
    let b = b.expect("second dispatch");
    assert_eq!(a, b, "both callers must see the same command");

    let inflight = CommandStore::list_inflight(harness.store.as_ref(), "A1")
        .await
        .unwrap();
    assert_eq!(inflight.len(), 1, "exactly one row created");
}

#[tokio::test]
async fn command_completes_through_the_wire() {
    let harness = start(test_config()).await;
    let api_key = register_agent_http(harness.addr, "A1").await;
    let mut agent = FakeAgent::connect(harness.addr, "A1", &api_key).await;
    agent.heartbeat(0).await;

    let session_id = insert_session(&harness, Some("A1")).await;
    let dispatcher = harness.state.dispatcher.clone();
    let command_id = dispatcher
        .dispatch(
            session_id,
            CommandAction::StartSession,
            serde_json::json!({"session_id": session_id, "user": "user-1"}),
        )
        .await
        .expect("dispatch");

    // The runtime sees the same command the dispatcher emitted.
    let (got_id, action, payload) = agent.expect_command().await;
    assert_eq!(got_id, command_id);
    assert_eq!(action, CommandAction::StartSession);
    assert_eq!(payload["user"], "user-1");

    agent.send(&Frame::ack(command_id)).await;
    agent
        .send(&Frame::complete(
            command_id,
            serde_json::json!({"workload_name": "hd-abc", "pod_ip": "10.0.0.9"}),
        ))
        .await;

    let outcome = dispatcher
        .await_command(command_id, Duration::from_secs(5))
        .await;
    let CommandOutcome::Completed(result) = outcome else {
        panic!("expected completion, got {outcome:?}");
    };
    assert_eq!(result["pod_ip"], "10.0.0.9");

    // Monotonic row: terminal with full timestamp trail, no error message.
    let row = CommandStore::get(harness.store.as_ref(), command_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.status, CommandStatus::Completed);
    assert!(row.sent_at.is_some());
    assert!(row.acked_at.is_some());
    assert!(row.completed_at.is_some());
    assert!(row.error_message.is_none());
}

#[tokio::test]
async fn failed_command_carries_error_message() {
    let harness = start(test_config()).await;
    let api_key = register_agent_http(harness.addr, "A1").await;
    let mut agent = FakeAgent::connect(harness.addr, "A1", &api_key).await;
    agent.heartbeat(0).await;

    let session_id = insert_session(&harness, Some("A1")).await;
    let dispatcher = harness.state.dispatcher.clone();
    let command_id = dispatcher
        .dispatch(
            session_id,
            CommandAction::StartSession,
            serde_json::json!({"session_id": session_id}),
        )
        .await
        .unwrap();

    let (got_id, _, _) = agent.expect_command().await;
    agent.send(&Frame::ack(got_id)).await;
    agent
        .send(&Frame::failed(got_id, "image pull backoff"))
        .await;

    let outcome = dispatcher
        .await_command(command_id, Duration::from_secs(5))
        .await;
    let CommandOutcome::Failed(reason) = outcome else {
        panic!("expected failure, got {outcome:?}");
    };
    assert_eq!(reason, "image pull backoff");

    let row = CommandStore::get(harness.store.as_ref(), command_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.error_message.as_deref(), Some("image pull backoff"));
}

#[tokio::test]
async fn unanswered_command_times_out_and_late_reply_is_discarded() {
    let mut config = test_config();
    config.command_timeout_start = Duration::from_millis(500);
    let harness = start(config).await;

    let api_key = register_agent_http(harness.addr, "A1").await;
    let mut agent = FakeAgent::connect(harness.addr, "A1", &api_key).await;
    agent.heartbeat(0).await;

    let session_id = insert_session(&harness, Some("A1")).await;
    let dispatcher = harness.state.dispatcher.clone();
    let command_id = dispatcher
        .dispatch(
            session_id,
            CommandAction::StartSession,
            serde_json::json!({"session_id": session_id}),
        )
        .await
        .unwrap();

    let (got_id, _, _) = agent.expect_command().await;
    agent.send(&Frame::ack(got_id)).await;
    // Never complete: the dispatcher's deadline fires.

    let outcome = dispatcher
        .await_command(command_id, Duration::from_secs(5))
        .await;
    assert!(matches!(outcome, CommandOutcome::Failed(ref r) if r == "timeout"));

    // A late completion does not resurrect the terminal row.
    agent
        .send(&Frame::complete(command_id, serde_json::json!({"late": true})))
        .await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    let row = CommandStore::get(harness.store.as_ref(), command_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.status, CommandStatus::Failed);
    assert_eq!(row.error_message.as_deref(), Some("timeout"));
    assert!(row.result.is_none());
}

#[tokio::test]
async fn dispatch_without_connected_agent_fails_as_disconnected() {
    let harness = start(test_config()).await;
    register_agent_http(harness.addr, "A1").await;
    // Agent registered but never connected: no candidate survives selection.
    let session_id = insert_session(&harness, Some("A1")).await;

    let dispatcher = harness.state.dispatcher.clone();
    let command_id = dispatcher
        .dispatch(
            session_id,
            CommandAction::StartSession,
            serde_json::json!({"session_id": session_id}),
        )
        .await
        .expect("dispatch still records the attempt");

    let outcome = dispatcher
        .await_command(command_id, Duration::from_secs(5))
        .await;
    assert!(matches!(outcome, CommandOutcome::Failed(ref r) if r == "agent_disconnected"));
}

#[tokio::test]
async fn non_lifecycle_commands_are_not_suppressed() {
    let harness = start(test_config()).await;
    let api_key = register_agent_http(harness.addr, "A1").await;
    let mut agent = FakeAgent::connect(harness.addr, "A1", &api_key).await;
    agent.heartbeat(0).await;

    let session_id = insert_session(&harness, Some("A1")).await;
    let dispatcher = harness.state.dispatcher.clone();

    let a = dispatcher
        .dispatch(
            session_id,
            CommandAction::FramebufferConnect,
            serde_json::json!({"session_id": session_id}),
        )
        .await
        .unwrap();
    let b = dispatcher
        .dispatch(
            session_id,
            CommandAction::FramebufferConnect,
            serde_json::json!({"session_id": session_id}),
        )
        .await
        .unwrap();
    assert_ne!(a, b);
}
