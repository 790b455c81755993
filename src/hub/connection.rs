use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU16, Ordering};

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use chrono::{DateTime, Utc};
use futures_util::SinkExt;
use futures_util::stream::{SplitSink, SplitStream, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::protocol::{self, CLOSE_MALFORMED, CLOSE_SHUTDOWN, DecodeError, Frame};

use super::AgentHub;

/// An item on a connection's outgoing queue. The queue is bounded; a send
/// that cannot make progress within the writer timeout marks the connection
/// unhealthy.
#[derive(Debug)]
pub(crate) enum Outbound {
    Frame(Frame),
    Close(u16, &'static str),
}

/// Live state for one bound agent connection. Everything durable lives in
/// the store; this is a rebuildable hint.
pub struct ConnectionHandle {
    pub connection_id: Uuid,
    pub agent_id: String,
    pub(crate) outbound: mpsc::Sender<Outbound>,
    pub(crate) cancel: CancellationToken,
    pub(crate) last_heartbeat: Mutex<DateTime<Utc>>,
    /// Reported by the agent in heartbeat payloads. A hint only; the derived
    /// store count is authoritative for selection.
    pub(crate) active_sessions: AtomicI64,
    pub(crate) awaiting_pong: AtomicBool,
    pub(crate) closed: AtomicBool,
    close_code: AtomicU16,
}

impl ConnectionHandle {
    pub(crate) fn new(agent_id: String, outbound: mpsc::Sender<Outbound>) -> Self {
        Self {
            connection_id: Uuid::new_v4(),
            agent_id,
            outbound,
            cancel: CancellationToken::new(),
            last_heartbeat: Mutex::new(Utc::now()),
            active_sessions: AtomicI64::new(0),
            awaiting_pong: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            close_code: AtomicU16::new(CLOSE_SHUTDOWN),
        }
    }

    pub(crate) fn set_close_code(&self, code: u16) {
        self.close_code.store(code, Ordering::SeqCst);
    }

    pub(crate) fn close_code(&self) -> u16 {
        self.close_code.load(Ordering::SeqCst)
    }

    pub(crate) fn last_heartbeat(&self) -> DateTime<Utc> {
        *self.last_heartbeat.lock().expect("heartbeat lock poisoned")
    }

    pub(crate) fn touch_heartbeat(&self, at: DateTime<Utc>) {
        *self.last_heartbeat.lock().expect("heartbeat lock poisoned") = at;
    }
}

/// Reader task: deserializes frames off the socket and routes them. Runs in
/// the upgraded connection's own task; returning tears the connection down.
pub(crate) async fn run_reader(
    hub: Arc<AgentHub>,
    handle: Arc<ConnectionHandle>,
    mut stream: SplitStream<WebSocket>,
) {
    loop {
        tokio::select! {
            () = handle.cancel.cancelled() => break,
            msg = stream.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => match protocol::decode(&text) {
                        Ok(frame) => hub.route_frame(&handle, frame).await,
                        Err(DecodeError::Incomplete) => {
                            // Transport artifact, not agent misbehavior: keep
                            // the connection and wait for the next read.
                            tracing::debug!(
                                agent_id = %handle.agent_id,
                                "incomplete frame, retrying on same connection"
                            );
                        }
                        Err(DecodeError::Malformed(err)) => {
                            tracing::warn!(
                                agent_id = %handle.agent_id,
                                error = %err,
                                "malformed frame, closing connection"
                            );
                            handle.set_close_code(CLOSE_MALFORMED);
                            let _ = handle
                                .outbound
                                .try_send(Outbound::Close(CLOSE_MALFORMED, "malformed frame"));
                            break;
                        }
                    },
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {} // transport-level ping/pong/binary
                    Some(Err(e)) => {
                        tracing::debug!(agent_id = %handle.agent_id, error = %e, "socket read error");
                        break;
                    }
                }
            }
        }
    }

    hub.unbind(&handle).await;
}

/// Writer task: the single producer onto the wire for this connection, which
/// preserves per-agent frame order. Also drives the server-side ping.
pub(crate) async fn run_writer(
    hub: Arc<AgentHub>,
    handle: Arc<ConnectionHandle>,
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<Outbound>,
) {
    let mut ping = tokio::time::interval(hub.config.heartbeat_interval);
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    ping.tick().await; // immediate first tick

    loop {
        tokio::select! {
            () = handle.cancel.cancelled() => {
                // Flush frames already queued (the shutdown frame for a
                // replaced connection must reach the old peer) then close.
                while let Ok(out) = rx.try_recv() {
                    let Outbound::Frame(frame) = out else { break };
                    let msg = Message::Text(protocol::encode(&frame).into());
                    if sink.send(msg).await.is_err() {
                        break;
                    }
                }
                let _ = sink
                    .send(Message::Close(Some(CloseFrame {
                        code: handle.close_code(),
                        reason: "closed".into(),
                    })))
                    .await;
                break;
            }
            out = rx.recv() => match out {
                Some(Outbound::Frame(frame)) => {
                    let msg = Message::Text(protocol::encode(&frame).into());
                    let sent = tokio::time::timeout(hub.config.writer_timeout, sink.send(msg)).await;
                    match sent {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => {
                            tracing::debug!(agent_id = %handle.agent_id, error = %e, "socket write error");
                            break;
                        }
                        Err(_) => {
                            tracing::warn!(
                                agent_id = %handle.agent_id,
                                "write stalled past writer timeout, closing connection"
                            );
                            break;
                        }
                    }
                }
                Some(Outbound::Close(code, reason)) => {
                    let _ = sink
                        .send(Message::Close(Some(CloseFrame {
                            code,
                            reason: reason.into(),
                        })))
                        .await;
                    break;
                }
                None => break,
            },
            _ = ping.tick() => {
                if handle.awaiting_pong.swap(true, Ordering::SeqCst) {
                    tracing::warn!(agent_id = %handle.agent_id, "no pong since last ping, closing connection");
                    break;
                }
                let msg = Message::Text(protocol::encode(&Frame::ping()).into());
                if sink.send(msg).await.is_err() {
                    break;
                }
            }
        }
    }

    // Make sure the reader observes the teardown too.
    handle.cancel.cancel();
}
