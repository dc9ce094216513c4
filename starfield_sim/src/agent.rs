//! SimulatedClient - runs one `SyncSession` inside the step-driven simulation.
//!
//! The production session owns its receive loop (`SyncSession::run`). Under
//! simulation the world decides when envelopes arrive, so this wrapper pumps
//! the inbox once per tick, schedules reconnect attempts on the client's own
//! clock and remembers the last pose that actually left the client.

use crate::context::SimContext;
use crate::network::{RecvState, SimNetwork};

use starfield_core::{BroadcastDecision, Pose, SnapshotStore, SyncConfig, SyncError, SyncSession};
use starfield_env::{PeerId, WorldContext};
use std::sync::Arc;

/// A simulated participant's client.
pub struct SimulatedClient {
    /// The underlying session
    inner: SyncSession<SimContext, SimNetwork>,

    ctx: Arc<SimContext>,
    net: Arc<SimNetwork>,

    /// Client index (for identification in reports)
    index: usize,

    /// Last pose that reached the transport
    last_sent: Option<Pose>,

    /// Monotonic ms of the next reconnect attempt while disconnected
    retry_at_ms: Option<u64>,

    reconnect_backoff_ms: u64,

    /// Crashed clients are frozen: no publishing, no inbox, no sweeps
    crashed: bool,
}

impl SimulatedClient {
    pub fn new(
        ctx: Arc<SimContext>,
        net: Arc<SimNetwork>,
        snapshots: Arc<dyn SnapshotStore>,
        config: SyncConfig,
        room_id: &str,
        index: usize,
    ) -> Self {
        let reconnect_backoff_ms = config.reconnect_backoff_ms;
        let inner = SyncSession::new(ctx.clone(), net.clone(), snapshots, config, room_id);

        Self {
            inner,
            ctx,
            net,
            index,
            last_sent: None,
            retry_at_ms: None,
            reconnect_backoff_ms,
            crashed: false,
        }
    }

    /// Joins the room with the given roster.
    pub async fn start(&mut self, roster: &[PeerId]) -> Result<(), SyncError> {
        self.inner.init(roster).await
    }

    /// Offers the avatar's current pose to the session.
    pub async fn publish(&mut self, pose: Pose) -> Result<BroadcastDecision, SyncError> {
        if self.crashed {
            return Ok(BroadcastDecision::Throttled);
        }

        let sent_before = self.inner.broadcast_stats().sent;
        let decision = self.inner.publish_pose(pose).await?;
        if self.inner.broadcast_stats().sent > sent_before {
            self.last_sent = Some(pose);
        }
        Ok(decision)
    }

    /// Handles everything in the inbox, retries the relay if due and runs
    /// the staleness sweep. Returns peers evicted this tick.
    pub async fn drain(&mut self) -> Vec<PeerId> {
        if self.crashed {
            return Vec::new();
        }

        loop {
            match self.net.try_recv() {
                RecvState::Message(sender, envelope) => {
                    self.inner.handle_envelope(sender, &envelope);
                }
                RecvState::Empty => break,
                RecvState::Closed => {
                    self.inner.mark_disconnected();
                    self.retry_at_ms = Some(self.now_ms() + self.reconnect_backoff_ms);
                    break;
                }
            }
        }

        if !self.inner.is_connected() {
            self.maybe_reconnect().await;
        }

        self.inner.tick()
    }

    async fn maybe_reconnect(&mut self) {
        let now = self.now_ms();
        let due = *self
            .retry_at_ms
            .get_or_insert(now + self.reconnect_backoff_ms);
        if now < due {
            return;
        }

        match self.inner.reconnect_attempt().await {
            Ok(true) => self.retry_at_ms = None,
            Ok(false) => self.retry_at_ms = Some(now + self.reconnect_backoff_ms),
            Err(e) => {
                tracing::warn!(client = self.index, error = %e, "reconnect aborted");
                self.retry_at_ms = None;
            }
        }
    }

    /// Freezes the client as if its process died.
    pub fn crash(&mut self) {
        self.crashed = true;
    }

    pub fn is_crashed(&self) -> bool {
        self.crashed
    }

    fn now_ms(&self) -> u64 {
        self.ctx.now().as_millis() as u64
    }

    pub fn peer_id(&self) -> PeerId {
        self.inner.peer_id()
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn last_sent(&self) -> Option<&Pose> {
        self.last_sent.as_ref()
    }

    pub fn context(&self) -> &Arc<SimContext> {
        &self.ctx
    }

    pub fn session(&self) -> &SyncSession<SimContext, SimNetwork> {
        &self.inner
    }

    pub fn session_mut(&mut self) -> &mut SyncSession<SimContext, SimNetwork> {
        &mut self.inner
    }
}
