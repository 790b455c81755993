//! Agent-side leg of the framebuffer relay: a TCP connection per session to
//! the workload's framebuffer server, bridged onto the hub connection as
//! `framebuffer_data` frames.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::protocol::{self, Frame};

const READ_BUF: usize = 16 * 1024;

/// Resolves a session to its framebuffer endpoint. Implemented by the
/// platform runtime.
#[async_trait]
pub trait FramebufferTarget: Send + Sync {
    async fn framebuffer_endpoint(&self, session_id: Uuid) -> anyhow::Result<(String, u16)>;
}

struct Tunnel {
    to_session: mpsc::Sender<Vec<u8>>,
    cancel: CancellationToken,
}

/// Open port-forwards for the lifetime of one hub connection. Dropped
/// wholesale when the connection goes away.
pub struct FramebufferTunnels {
    target: Arc<dyn FramebufferTarget>,
    outbound: mpsc::Sender<Frame>,
    tunnels: Mutex<HashMap<Uuid, Tunnel>>,
}

impl FramebufferTunnels {
    pub fn new(target: Arc<dyn FramebufferTarget>, outbound: mpsc::Sender<Frame>) -> Arc<Self> {
        Arc::new(Self {
            target,
            outbound,
            tunnels: Mutex::new(HashMap::new()),
        })
    }

    /// Open the TCP leg for a session and start streaming. Reconnecting an
    /// already-tunneled session replaces the old tunnel.
    pub async fn connect(self: &Arc<Self>, session_id: Uuid) -> anyhow::Result<()> {
        let (host, port) = self.target.framebuffer_endpoint(session_id).await?;
        let stream = TcpStream::connect((host.as_str(), port)).await?;
        tracing::info!(%session_id, host, port, "framebuffer port-forward open");

        let (read_half, write_half) = stream.into_split();
        let (tx, rx) = mpsc::channel::<Vec<u8>>(64);
        let cancel = CancellationToken::new();

        let old = self.tunnels.lock().expect("tunnel map poisoned").insert(
            session_id,
            Tunnel {
                to_session: tx,
                cancel: cancel.clone(),
            },
        );
        if let Some(old) = old {
            old.cancel.cancel();
        }

        tokio::spawn(pump_to_session(session_id, write_half, rx, cancel.clone()));
        tokio::spawn(pump_to_control_plane(
            self.clone(),
            session_id,
            read_half,
            cancel,
        ));
        Ok(())
    }

    /// Browser-to-session direction: decode and forward one frame's bytes.
    pub fn write(&self, session_id: Uuid, encoded: &str) {
        let data = match protocol::decode_framebuffer_bytes(encoded) {
            Ok(data) => data,
            Err(e) => {
                tracing::warn!(%session_id, error = %e, "bad framebuffer payload");
                return;
            }
        };
        let sender = {
            let tunnels = self.tunnels.lock().expect("tunnel map poisoned");
            tunnels.get(&session_id).map(|t| t.to_session.clone())
        };
        match sender {
            Some(sender) => {
                if sender.try_send(data).is_err() {
                    tracing::debug!(%session_id, "session leg behind, dropping frame");
                }
            }
            None => {
                tracing::debug!(%session_id, "framebuffer data for unknown tunnel");
            }
        }
    }

    pub fn disconnect(&self, session_id: Uuid) {
        let removed = self
            .tunnels
            .lock()
            .expect("tunnel map poisoned")
            .remove(&session_id);
        if let Some(tunnel) = removed {
            tunnel.cancel.cancel();
            tracing::info!(%session_id, "framebuffer port-forward closed");
        }
    }

    pub fn disconnect_all(&self) {
        let mut tunnels = self.tunnels.lock().expect("tunnel map poisoned");
        for (_, tunnel) in tunnels.drain() {
            tunnel.cancel.cancel();
        }
    }

    fn drop_tunnel(&self, session_id: Uuid) {
        self.tunnels
            .lock()
            .expect("tunnel map poisoned")
            .remove(&session_id);
    }
}

async fn pump_to_session(
    session_id: Uuid,
    mut write_half: tokio::net::tcp::OwnedWriteHalf,
    mut rx: mpsc::Receiver<Vec<u8>>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            data = rx.recv() => match data {
                Some(data) => {
                    if let Err(e) = write_half.write_all(&data).await {
                        tracing::debug!(%session_id, error = %e, "session write failed");
                        cancel.cancel();
                        break;
                    }
                }
                None => break,
            },
        }
    }
}

async fn pump_to_control_plane(
    tunnels: Arc<FramebufferTunnels>,
    session_id: Uuid,
    mut read_half: tokio::net::tcp::OwnedReadHalf,
    cancel: CancellationToken,
) {
    let mut buf = vec![0u8; READ_BUF];
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            read = read_half.read(&mut buf) => match read {
                Ok(0) => {
                    tracing::info!(%session_id, "framebuffer server closed the stream");
                    break;
                }
                Ok(n) => {
                    let frame = Frame::framebuffer_data(session_id, &buf[..n]);
                    if tunnels.outbound.send(frame).await.is_err() {
                        break; // hub connection gone
                    }
                }
                Err(e) => {
                    tracing::debug!(%session_id, error = %e, "session read failed");
                    break;
                }
            },
        }
    }
    cancel.cancel();
    tunnels.drop_tunnel(session_id);
}
