//! The "POSE" broadcaster - throttled, lossy fan-out of the local avatar.
//!
//! `broadcast` may be called every frame. The [`BroadcastGate`] decides what
//! actually goes out:
//! - calls closer than `broadcast_interval_ms` to the last accepted call are dropped
//! - an idle avatar (slow, not thrusting, not turning, not drifting) is not re-sent,
//!   except for a keepalive every `idle_keepalive_ms`
//! - every `snapshot_interval_ms` the pose is also written to the snapshot store
//!
//! Send and snapshot failures are logged and absorbed; the next accepted
//! call carries fresher state anyway.

use crate::config::SyncConfig;
use crate::pose::Pose;
use crate::snapshot::{SnapshotRecord, SnapshotStore};
use crate::wire::{PoseMessage, TransportMessage};
use serde::{Deserialize, Serialize};
use starfield_env::{NetworkTransport, PeerId, WorldContext};
use std::sync::Arc;

/// What the gate decided for one `broadcast` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BroadcastDecision {
    /// Arrived inside the throttle interval
    Throttled,
    /// Passed the throttle
    Accepted { send: bool, snapshot: bool },
}

impl BroadcastDecision {
    pub fn sends(&self) -> bool {
        matches!(self, BroadcastDecision::Accepted { send: true, .. })
    }

    pub fn snapshots(&self) -> bool {
        matches!(self, BroadcastDecision::Accepted { snapshot: true, .. })
    }
}

/// Pure throttle/suppression state machine, driven by a monotonic clock.
#[derive(Debug, Clone)]
pub struct BroadcastGate {
    config: SyncConfig,
    last_accepted_at: Option<u64>,
    last_sent: Option<(Pose, u64)>,
    last_snapshot_at: Option<u64>,
}

impl BroadcastGate {
    pub fn new(config: SyncConfig) -> Self {
        Self {
            config,
            last_accepted_at: None,
            last_sent: None,
            last_snapshot_at: None,
        }
    }

    /// Decides for `pose` at monotonic time `now_ms` and records the outcome.
    pub fn evaluate(&mut self, pose: &Pose, now_ms: u64) -> BroadcastDecision {
        if let Some(last) = self.last_accepted_at {
            if now_ms.saturating_sub(last) < self.config.broadcast_interval_ms {
                return BroadcastDecision::Throttled;
            }
        }
        self.last_accepted_at = Some(now_ms);

        let send = match &self.last_sent {
            None => true,
            Some((previous, sent_at)) => {
                !self.is_idle(pose, previous)
                    || now_ms.saturating_sub(*sent_at) >= self.config.idle_keepalive_ms
            }
        };
        if send {
            self.last_sent = Some((*pose, now_ms));
        }

        let snapshot = match self.last_snapshot_at {
            None => true,
            Some(at) => now_ms.saturating_sub(at) >= self.config.snapshot_interval_ms,
        };
        if snapshot {
            self.last_snapshot_at = Some(now_ms);
        }

        BroadcastDecision::Accepted { send, snapshot }
    }

    /// Not meaningfully moving relative to the last sent sample.
    fn is_idle(&self, pose: &Pose, last_sent: &Pose) -> bool {
        pose.speed() <= self.config.speed_epsilon
            && !pose.thrusting
            && pose.rotation_delta(last_sent) <= self.config.rotation_epsilon
            && pose.position_delta(last_sent) <= self.config.position_epsilon
    }

    /// Forgets the last sent sample so the next accepted call is sent.
    pub fn reset(&mut self) {
        self.last_sent = None;
    }
}

/// Counters for one broadcaster.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastStats {
    pub sent: u64,
    pub throttled: u64,
    pub suppressed: u64,
    pub send_failures: u64,
    pub snapshots_written: u64,
    pub snapshot_failures: u64,
}

/// Sends the local avatar's pose over the transport and to snapshots.
pub struct PoseBroadcaster<Ctx: WorldContext, Net: NetworkTransport> {
    peer_id: PeerId,
    ctx: Arc<Ctx>,
    net: Arc<Net>,
    snapshots: Arc<dyn SnapshotStore>,
    gate: BroadcastGate,
    last_timestamp: u64,
    stats: BroadcastStats,
}

impl<Ctx: WorldContext, Net: NetworkTransport> PoseBroadcaster<Ctx, Net> {
    pub fn new(
        ctx: Arc<Ctx>,
        net: Arc<Net>,
        snapshots: Arc<dyn SnapshotStore>,
        config: SyncConfig,
    ) -> Self {
        Self {
            peer_id: net.local_id(),
            ctx,
            net,
            snapshots,
            gate: BroadcastGate::new(config),
            last_timestamp: 0,
            stats: BroadcastStats::default(),
        }
    }

    /// Offers the current local pose. Never fails.
    pub async fn broadcast(&mut self, pose: Pose) -> BroadcastDecision {
        let now_ms = self.ctx.now().as_millis() as u64;
        let decision = self.gate.evaluate(&pose, now_ms);

        let (send, snapshot) = match decision {
            BroadcastDecision::Throttled => {
                self.stats.throttled += 1;
                return decision;
            }
            BroadcastDecision::Accepted { send, snapshot } => (send, snapshot),
        };

        // Sender timestamps must strictly increase even if the wall clock stalls
        let timestamp = self.ctx.wall_clock_ms().max(self.last_timestamp + 1);
        self.last_timestamp = timestamp;
        let stamped = pose.stamped(timestamp);

        if send {
            self.send(&stamped).await;
        } else {
            self.stats.suppressed += 1;
        }

        if snapshot {
            let record = SnapshotRecord::from_pose(self.peer_id, &stamped, timestamp);
            match self.snapshots.upsert(record) {
                Ok(()) => self.stats.snapshots_written += 1,
                Err(e) => {
                    self.stats.snapshot_failures += 1;
                    tracing::warn!(peer = %self.peer_id, error = %e, "snapshot write failed");
                }
            }
        }

        decision
    }

    async fn send(&mut self, pose: &Pose) {
        let message = TransportMessage::Pose(PoseMessage::from_pose(self.peer_id, pose));
        let envelope = match message.to_envelope(pose.sender_timestamp) {
            Ok(envelope) => envelope,
            Err(e) => {
                self.stats.send_failures += 1;
                tracing::warn!(error = %e, "failed to encode pose");
                return;
            }
        };

        match self.net.broadcast(envelope).await {
            Ok(_) => self.stats.sent += 1,
            Err(e) => {
                self.stats.send_failures += 1;
                tracing::debug!(peer = %self.peer_id, error = %e, "pose send dropped");
            }
        }
    }

    /// Forces the next accepted call to be sent (after a reconnect).
    pub fn reset(&mut self) {
        self.gate.reset();
    }

    pub fn stats(&self) -> BroadcastStats {
        self.stats
    }

    pub fn last_timestamp(&self) -> u64 {
        self.last_timestamp
    }
}
