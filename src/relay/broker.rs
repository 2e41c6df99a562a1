//! Two-slot relay broker
//!
//! The broker pairs at most one reporter with at most one viewer. Each slot
//! has its own lock. Paths that need several locks take the viewer slot
//! first, the run buffer next and the reporter slot last, so a viewer
//! attaching while a start is being forwarded sees the start exactly once,
//! as its first frame.
//!
//! The buffer keeps the current run's `start` and, once the run is over,
//! its `end`. A viewer joining late gets both, in that order.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, Mutex};

use crate::common::{Error, Result};

use super::protocol::{self, Message, Role};

const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Conventional limit for [`Broker::wait_for_viewer`] and [`Broker::wait_for_reporter`]
pub const DEFAULT_ROLE_WAIT: Duration = Duration::from_secs(60);

/// Frames a connection may have queued before it counts as stalled
pub const OUTBOX_CAPACITY: usize = 1024;

/// Frame queued for a connection's writer task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text(String),
    Close { code: u16, reason: String },
}

#[derive(Debug)]
struct Peer {
    id: u64,
    tx: mpsc::Sender<Outbound>,
}

impl Peer {
    /// Queue a frame; a closed or full outbox counts as a failed send
    fn send(&self, frame: Outbound) -> bool {
        match self.tx.try_send(frame) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(peer = self.id, "Outbox full, peer is not keeping up");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }
}

#[derive(Debug, Default)]
struct RunBuffer {
    start: Option<String>,
    end: Option<String>,
}

/// Connection slots plus the buffered run frames
#[derive(Debug)]
pub struct Broker {
    reporter: Mutex<Option<Peer>>,
    viewer: Mutex<Option<Peer>>,
    run: Mutex<RunBuffer>,
    next_id: AtomicU64,
    outbox_capacity: usize,
}

impl Default for Broker {
    fn default() -> Self {
        Self::with_outbox_capacity(OUTBOX_CAPACITY)
    }
}

impl Broker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Broker whose per-connection queues hold at most `capacity` frames
    pub fn with_outbox_capacity(capacity: usize) -> Self {
        Self {
            reporter: Mutex::new(None),
            viewer: Mutex::new(None),
            run: Mutex::new(RunBuffer::default()),
            next_id: AtomicU64::new(0),
            outbox_capacity: capacity.max(1),
        }
    }

    fn slot(&self, role: Role) -> &Mutex<Option<Peer>> {
        match role {
            Role::Reporter => &self.reporter,
            Role::Viewer => &self.viewer,
        }
    }

    /// Occupy a slot; the returned receiver feeds the connection's writer
    ///
    /// Fails with `RoleOccupied` when the slot already holds a connection.
    /// A viewer gets the buffered run frames first, and a connected reporter
    /// is told that a viewer is now present.
    pub async fn attach(&self, role: Role) -> Result<(u64, mpsc::Receiver<Outbound>)> {
        let (tx, rx) = mpsc::channel(self.outbox_capacity);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let peer = Peer { id, tx };

        match role {
            Role::Reporter => {
                let mut slot = self.reporter.lock().await;
                if slot.is_some() {
                    return Err(Error::RoleOccupied(role));
                }
                *slot = Some(peer);
            }
            Role::Viewer => {
                {
                    let mut slot = self.viewer.lock().await;
                    if slot.is_some() {
                        return Err(Error::RoleOccupied(role));
                    }
                    let run = self.run.lock().await;
                    for frame in [&run.start, &run.end].into_iter().flatten() {
                        tracing::debug!("Delivering buffered run frame to viewer");
                        peer.send(Outbound::Text(frame.clone()));
                    }
                    *slot = Some(peer);
                }
                self.acknowledge_reporter().await;
            }
        }

        tracing::info!(%role, peer = id, "Connection attached");
        Ok((id, rx))
    }

    async fn acknowledge_reporter(&self) {
        let ack = match Message::start_ack().to_text() {
            Ok(ack) => ack,
            Err(e) => {
                tracing::error!("Failed to encode start acknowledgment: {}", e);
                return;
            }
        };
        let mut slot = self.reporter.lock().await;
        if let Some(reporter) = slot.as_ref() {
            if !reporter.send(Outbound::Text(ack)) {
                tracing::warn!(peer = reporter.id, "Reporter went away, clearing slot");
                *slot = None;
            }
        }
    }

    /// Release a slot, but only if it is still held by `id`
    pub async fn detach(&self, role: Role, id: u64) {
        let mut slot = self.slot(role).lock().await;
        if slot.as_ref().is_some_and(|peer| peer.id == id) {
            *slot = None;
            tracing::info!(%role, peer = id, "Connection detached");
        }
    }

    /// Close whatever connection holds a slot and clear it
    pub async fn disconnect(&self, role: Role) {
        if let Some(peer) = self.slot(role).lock().await.take() {
            peer.send(Outbound::Close {
                code: 1000,
                reason: "relay shutting down".to_string(),
            });
            tracing::info!(%role, peer = peer.id, "Connection closed by broker");
        }
    }

    /// Handle a frame from the reporter
    ///
    /// A start that reaches a viewer is acknowledged right away.
    pub async fn forward_from_reporter(&self, text: String) {
        let mut viewer = self.viewer.lock().await;

        let kind = protocol::message_type(&text);
        let is_start = kind.as_deref() == Some("start");
        match kind.as_deref() {
            Some("start") => {
                *self.run.lock().await = RunBuffer {
                    start: Some(text.clone()),
                    end: None,
                };
                tracing::debug!("Buffered start message");
            }
            Some("end") => {
                self.run.lock().await.end = Some(text.clone());
                tracing::debug!("Buffered end message");
            }
            _ => {}
        }

        let delivered = match viewer.as_ref() {
            Some(peer) => {
                let sent = peer.send(Outbound::Text(text));
                if !sent {
                    tracing::warn!(peer = peer.id, "Send to viewer failed, clearing slot");
                    *viewer = None;
                }
                sent
            }
            None => {
                tracing::debug!("No viewer connected, dropping reporter message");
                false
            }
        };

        if is_start && delivered {
            self.acknowledge_reporter().await;
        }
    }

    /// Handle a frame from the viewer
    pub async fn forward_from_viewer(&self, text: String) {
        let mut reporter = self.reporter.lock().await;
        match reporter.as_ref() {
            Some(peer) => {
                if !peer.send(Outbound::Text(text)) {
                    tracing::warn!(peer = peer.id, "Send to reporter failed, clearing slot");
                    *reporter = None;
                }
            }
            None => tracing::debug!("No reporter connected, dropping viewer message"),
        }
    }

    pub async fn is_connected(&self, role: Role) -> bool {
        self.slot(role).lock().await.is_some()
    }

    pub async fn is_reporter_connected(&self) -> bool {
        self.is_connected(Role::Reporter).await
    }

    pub async fn is_viewer_connected(&self) -> bool {
        self.is_connected(Role::Viewer).await
    }

    /// The most recent start message, if any reporter has sent one
    pub async fn buffered_start(&self) -> Option<String> {
        self.run.lock().await.start.clone()
    }

    /// The end of the buffered run, once the reporter has sent it
    pub async fn buffered_end(&self) -> Option<String> {
        self.run.lock().await.end.clone()
    }

    async fn wait_for(&self, role: Role, timeout: Duration) -> Result<()> {
        let started = Instant::now();
        loop {
            if self.is_connected(role).await {
                return Ok(());
            }
            if started.elapsed() >= timeout {
                return Err(Error::timeout(&format!("{} connection", role), timeout));
            }
            tokio::time::sleep(WAIT_POLL_INTERVAL).await;
        }
    }

    /// Wait until a viewer occupies its slot
    pub async fn wait_for_viewer(&self, timeout: Duration) -> Result<()> {
        self.wait_for(Role::Viewer, timeout).await
    }

    /// Wait until a reporter occupies its slot
    pub async fn wait_for_reporter(&self, timeout: Duration) -> Result<()> {
        self.wait_for(Role::Reporter, timeout).await
    }
}
