//! Sync session - one client's view of the shared world.
//!
//! Wires the broadcaster, peer cache and snapshot store to an environment
//! context and transport. Sessions are explicitly constructed and torn down;
//! nothing here is global.
//!
//! # Lifecycle
//!
//! ```text
//!   new() ──► Created ──init()──► Running ──destroy()──► Destroyed
//!                                   │  ▲
//!                     recv() = None │  │ reconnect(): sleep(backoff), connect, join
//!                                   ▼  │
//!                               (disconnected)
//! ```
//!
//! Generic over the context and transport so the same session runs against
//! tokio in production and the virtual clock in simulation.

use crate::broadcaster::{BroadcastDecision, BroadcastStats, PoseBroadcaster};
use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::peer_cache::{IngestOutcome, ParticipantMeta, PeerEventListener, PeerStateCache, SubscriptionId};
use crate::pose::Pose;
use crate::snapshot::SnapshotStore;
use crate::wire::{ActivityState, JoinMessage, TransportMessage};
use serde::{Deserialize, Serialize};
use starfield_env::{Envelope, NetworkTransport, PeerId, WorldContext};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    Running,
    Destroyed,
}

/// What `handle_envelope` did with one inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handled {
    Pose(IngestOutcome),
    Activity,
    Join,
    /// Our own message reflected by the relay
    Echo,
    /// Undecodable payload, dropped
    Malformed,
}

/// Inbound counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStats {
    pub received: u64,
    pub accepted_poses: u64,
    pub stale_poses: u64,
    pub malformed: u64,
    pub echoes: u64,
    pub evictions: u64,
    pub reconnects: u64,
}

/// One participant's synchronization session.
pub struct SyncSession<Ctx, Net>
where
    Ctx: WorldContext,
    Net: NetworkTransport,
{
    peer_id: PeerId,
    room_id: String,
    ctx: Arc<Ctx>,
    net: Arc<Net>,
    snapshots: Arc<dyn SnapshotStore>,
    config: SyncConfig,
    cache: PeerStateCache,
    broadcaster: PoseBroadcaster<Ctx, Net>,
    state: SessionState,
    connected: bool,
    last_sweep_ms: u64,
    stats: SessionStats,
}

impl<Ctx, Net> SyncSession<Ctx, Net>
where
    Ctx: WorldContext,
    Net: NetworkTransport,
{
    pub fn new(
        ctx: Arc<Ctx>,
        net: Arc<Net>,
        snapshots: Arc<dyn SnapshotStore>,
        config: SyncConfig,
        room_id: impl Into<String>,
    ) -> Self {
        let broadcaster = PoseBroadcaster::new(ctx.clone(), net.clone(), snapshots.clone(), config.clone());
        Self {
            peer_id: net.local_id(),
            room_id: room_id.into(),
            cache: PeerStateCache::new(config.staleness_threshold_ms),
            ctx,
            net,
            snapshots,
            config,
            broadcaster,
            state: SessionState::Created,
            connected: false,
            last_sweep_ms: 0,
            stats: SessionStats::default(),
        }
    }

    // ========================================================================
    // LIFECYCLE
    // ========================================================================

    /// Connects, announces presence and bootstraps peers from snapshots.
    ///
    /// `participants` is the externally supplied roster. A failed connect is
    /// not fatal: the session starts disconnected and `run` retries.
    pub async fn init(&mut self, participants: &[PeerId]) -> Result<(), SyncError> {
        match self.state {
            SessionState::Running => return Ok(()),
            SessionState::Destroyed => return Err(SyncError::SessionClosed),
            SessionState::Created => {}
        }

        match self.net.connect().await {
            Ok(()) => {
                self.connected = true;
                self.announce().await;
            }
            Err(e) => {
                tracing::warn!(peer = %self.peer_id, error = %e, "initial connect failed");
            }
        }

        let now = self.ctx.wall_clock_ms();
        let others: Vec<PeerId> = participants
            .iter()
            .copied()
            .filter(|p| *p != self.peer_id)
            .collect();
        let poses = self
            .snapshots
            .load_initial(&others, now, self.config.bootstrap_window_ms);

        let mut bootstrapped: Vec<(PeerId, Pose)> = poses.into_iter().collect();
        bootstrapped.sort_by_key(|(peer, _)| *peer);
        for (peer, pose) in &bootstrapped {
            // Staleness continues from the snapshot's age, never from a writer clock ahead of ours
            self.cache.ingest(*peer, *pose, pose.sender_timestamp.min(now));
        }

        self.last_sweep_ms = self.monotonic_ms();
        self.state = SessionState::Running;

        tracing::info!(
            peer = %self.peer_id,
            room = %self.room_id,
            connected = self.connected,
            bootstrapped = bootstrapped.len(),
            "session started"
        );
        Ok(())
    }

    /// Tears the session down. Every cached peer is reported as departed.
    pub fn destroy(&mut self) -> Vec<PeerId> {
        if self.state == SessionState::Destroyed {
            return Vec::new();
        }
        self.state = SessionState::Destroyed;
        self.connected = false;
        let departed = self.cache.clear();
        tracing::info!(peer = %self.peer_id, departed = departed.len(), "session destroyed");
        departed
    }

    async fn announce(&mut self) {
        let join = TransportMessage::Join(JoinMessage {
            peer_id: self.peer_id,
            room_id: self.room_id.clone(),
        });
        if let Err(e) = self.send(&join).await {
            tracing::debug!(peer = %self.peer_id, error = %e, "join announce dropped");
        }
    }

    /// Retries `connect` with a fixed backoff until it succeeds, then
    /// re-announces. Nothing sent while disconnected is replayed.
    pub async fn reconnect(&mut self) -> Result<(), SyncError> {
        self.connected = false;
        let backoff = Duration::from_millis(self.config.reconnect_backoff_ms);

        loop {
            self.ctx.sleep(backoff).await;
            if self.reconnect_attempt().await? {
                return Ok(());
            }
        }
    }

    /// One connect attempt, for callers that schedule the backoff themselves.
    ///
    /// Returns `Ok(true)` once connected and re-announced.
    pub async fn reconnect_attempt(&mut self) -> Result<bool, SyncError> {
        self.ensure_running()?;

        if let Err(e) = self.net.connect().await {
            tracing::warn!(peer = %self.peer_id, error = %e, "reconnect failed, retrying");
            return Ok(false);
        }

        self.connected = true;
        self.stats.reconnects += 1;
        self.broadcaster.reset();
        self.announce().await;
        tracing::info!(peer = %self.peer_id, reconnects = self.stats.reconnects, "reconnected");
        Ok(true)
    }

    /// Records that the transport dropped. Outbound calls keep being absorbed
    /// until a reconnect succeeds.
    pub fn mark_disconnected(&mut self) {
        if self.connected {
            tracing::warn!(peer = %self.peer_id, "transport closed");
        }
        self.connected = false;
    }

    /// Drives the session until `shutdown` flips to true (or its sender drops).
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<SessionStats, SyncError> {
        if self.state != SessionState::Running {
            return Err(SyncError::SessionClosed);
        }

        let net = self.net.clone();
        let ctx = self.ctx.clone();
        let sweep_every = Duration::from_millis(self.config.sweep_interval_ms);
        let backoff = Duration::from_millis(self.config.reconnect_backoff_ms);

        while !*shutdown.borrow() {
            if !self.connected {
                // One attempt per backoff; cached peers keep aging meanwhile
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = ctx.sleep(backoff) => {}
                }
                self.reconnect_attempt().await?;
                self.tick();
                continue;
            }

            tokio::select! {
                _ = shutdown.changed() => break,
                inbound = net.recv() => match inbound {
                    Some((sender, envelope)) => {
                        self.handle_envelope(sender, &envelope);
                    }
                    None => self.mark_disconnected(),
                },
                _ = ctx.sleep(sweep_every) => {}
            }
            self.tick();
        }

        Ok(self.stats)
    }

    // ========================================================================
    // INBOUND
    // ========================================================================

    /// Decodes and applies one inbound envelope. Never fails.
    pub fn handle_envelope(&mut self, sender: PeerId, envelope: &Envelope) -> Handled {
        self.stats.received += 1;

        let message = match TransportMessage::from_envelope(envelope) {
            Ok(message) => message,
            Err(e) => {
                self.stats.malformed += 1;
                tracing::debug!(sender = %sender, error = %e, "dropping malformed message");
                return Handled::Malformed;
            }
        };

        if sender == self.peer_id || message.peer_id() == self.peer_id {
            self.stats.echoes += 1;
            return Handled::Echo;
        }

        match message {
            TransportMessage::Pose(pose) => {
                let outcome = self.cache.ingest(pose.peer_id, pose.pose(), self.ctx.wall_clock_ms());
                if outcome.is_accepted() {
                    self.stats.accepted_poses += 1;
                } else {
                    self.stats.stale_poses += 1;
                }
                Handled::Pose(outcome)
            }
            TransportMessage::State(state) => {
                self.cache.ingest_activity(state, self.ctx.wall_clock_ms());
                Handled::Activity
            }
            TransportMessage::Join(join) => {
                tracing::debug!(peer = %join.peer_id, room = %join.room_id, "peer joined");
                // Make sure the newcomer sees us even if we are idle
                self.broadcaster.reset();
                Handled::Join
            }
        }
    }

    /// Runs the staleness sweep if its interval elapsed. Returns evicted peers.
    pub fn tick(&mut self) -> Vec<PeerId> {
        let now = self.monotonic_ms();
        if now.saturating_sub(self.last_sweep_ms) < self.config.sweep_interval_ms {
            return Vec::new();
        }
        self.last_sweep_ms = now;

        let evicted = self.cache.sweep(self.ctx.wall_clock_ms());
        self.stats.evictions += evicted.len() as u64;
        evicted
    }

    // ========================================================================
    // OUTBOUND
    // ========================================================================

    /// Offers the local avatar pose to the broadcaster.
    pub async fn publish_pose(&mut self, pose: Pose) -> Result<BroadcastDecision, SyncError> {
        self.ensure_running()?;
        Ok(self.broadcaster.broadcast(pose).await)
    }

    /// Announces whether we are working on `target_id`. Send failures are absorbed.
    pub async fn publish_activity(&mut self, is_active: bool, target_id: Option<Uuid>) -> Result<(), SyncError> {
        self.ensure_running()?;
        let state = TransportMessage::State(ActivityState {
            peer_id: self.peer_id,
            is_active,
            target_id,
        });
        if let Err(e) = self.send(&state).await {
            tracing::debug!(peer = %self.peer_id, error = %e, "activity send dropped");
        }
        Ok(())
    }

    async fn send(&self, message: &TransportMessage) -> Result<(), SyncError> {
        let envelope = message.to_envelope(self.ctx.wall_clock_ms())?;
        self.net.broadcast(envelope).await?;
        Ok(())
    }

    // ========================================================================
    // ACCESSORS
    // ========================================================================

    pub fn subscribe(&mut self, listener: Arc<dyn PeerEventListener>) -> SubscriptionId {
        self.cache.subscribe(listener)
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.cache.unsubscribe(id)
    }

    /// Forwards roster metadata from the presence service.
    pub fn set_metadata(&mut self, peer_id: PeerId, meta: Option<ParticipantMeta>) {
        match meta {
            Some(meta) => self.cache.set_metadata(peer_id, meta),
            None => self.cache.remove_metadata(&peer_id),
        }
    }

    pub fn cache(&self) -> &PeerStateCache {
        &self.cache
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn stats(&self) -> SessionStats {
        self.stats
    }

    pub fn broadcast_stats(&self) -> BroadcastStats {
        self.broadcaster.stats()
    }

    fn ensure_running(&self) -> Result<(), SyncError> {
        if self.state == SessionState::Running {
            Ok(())
        } else {
            Err(SyncError::SessionClosed)
        }
    }

    fn monotonic_ms(&self) -> u64 {
        self.ctx.now().as_millis() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcaster::tests::{ManualContext, RecordingTransport};
    use crate::peer_cache::PeerEvent;
    use crate::snapshot::{MemorySnapshotStore, SnapshotRecord};
    use crate::wire::PoseMessage;
    use starfield_env::TokioContext;
    use std::sync::Mutex;

    const WALL: u64 = 1_700_000_000_000;

    type TestSession = SyncSession<ManualContext, RecordingTransport>;

    fn setup() -> (TestSession, Arc<ManualContext>, Arc<RecordingTransport>, Arc<MemorySnapshotStore>) {
        let ctx = Arc::new(ManualContext::new(WALL));
        let net = Arc::new(RecordingTransport::new(PeerId::from_seed(1)));
        let store = Arc::new(MemorySnapshotStore::new());
        let session = SyncSession::new(ctx.clone(), net.clone(), store.clone(), SyncConfig::default(), "lobby");
        (session, ctx, net, store)
    }

    fn pose_envelope(peer: PeerId, ts: u64) -> Envelope {
        let pose = Pose::at(ts as f64, 0.0).with_velocity(1.0, 0.0).stamped(ts);
        TransportMessage::Pose(PoseMessage::from_pose(peer, &pose))
            .to_envelope(ts)
            .unwrap()
    }

    #[tokio::test]
    async fn test_init_announces_and_bootstraps() {
        let (mut session, _ctx, net, store) = setup();
        let fresh = PeerId::from_seed(2);
        let gone = PeerId::from_seed(3);
        store
            .upsert(SnapshotRecord::from_pose(fresh, &Pose::at(1.0, 1.0), WALL - 4_000))
            .unwrap();
        store
            .upsert(SnapshotRecord::from_pose(gone, &Pose::at(2.0, 2.0), WALL - 60_000))
            .unwrap();

        session.init(&[session.peer_id(), fresh, gone]).await.unwrap();

        assert_eq!(session.state(), SessionState::Running);
        assert!(session.is_connected());
        assert!(session.cache().contains(&fresh));
        assert!(!session.cache().contains(&gone));
        assert!(matches!(
            net.sent_messages().as_slice(),
            [TransportMessage::Join(j)] if j.room_id == "lobby"
        ));
    }

    #[tokio::test]
    async fn test_future_dated_snapshot_still_ages_out() {
        let (mut session, ctx, _net, store) = setup();
        let ghost = PeerId::from_seed(2);
        // Writer's clock ran an hour ahead
        store
            .upsert(SnapshotRecord::from_pose(ghost, &Pose::at(1.0, 1.0), WALL + 3_600_000))
            .unwrap();

        session.init(&[ghost]).await.unwrap();
        assert!(session.cache().contains(&ghost));
        assert_eq!(session.cache().sample(&ghost).unwrap().received_at, WALL);

        for ms in [5_000, 10_000, 15_000] {
            ctx.set_ms(ms);
            session.tick();
        }
        assert!(!session.cache().contains(&ghost));
        assert_eq!(session.stats().evictions, 1);
    }

    #[tokio::test]
    async fn test_bootstrapped_peer_is_superseded_by_live_pose() {
        let (mut session, _ctx, _net, store) = setup();
        let peer = PeerId::from_seed(2);
        store
            .upsert(SnapshotRecord::from_pose(peer, &Pose::at(1.0, 1.0), WALL - 1_000))
            .unwrap();
        session.init(&[peer]).await.unwrap();

        let handled = session.handle_envelope(peer, &pose_envelope(peer, WALL - 500));
        assert_eq!(handled, Handled::Pose(IngestOutcome::Replaced));
        assert_eq!(session.cache().sample(&peer).unwrap().pose.x, (WALL - 500) as f64);
    }

    #[tokio::test]
    async fn test_out_of_order_poses_keep_newest() {
        let (mut session, _ctx, _net, _store) = setup();
        session.init(&[]).await.unwrap();
        let peer = PeerId::from_seed(2);

        for ts in [5, 3, 9, 7] {
            session.handle_envelope(peer, &pose_envelope(peer, ts));
        }

        assert_eq!(session.cache().sample(&peer).unwrap().sender_timestamp, 9);
        assert_eq!(session.stats().accepted_poses, 2);
        assert_eq!(session.stats().stale_poses, 2);
    }

    #[tokio::test]
    async fn test_own_echo_and_garbage_are_ignored() {
        let (mut session, _ctx, _net, _store) = setup();
        session.init(&[]).await.unwrap();
        let me = session.peer_id();

        assert_eq!(session.handle_envelope(me, &pose_envelope(me, 10)), Handled::Echo);
        let relayed_echo = pose_envelope(me, 11);
        assert_eq!(session.handle_envelope(PeerId::from_seed(9), &relayed_echo), Handled::Echo);
        assert_eq!(
            session.handle_envelope(PeerId::from_seed(9), &Envelope::new(b"{".to_vec(), 0)),
            Handled::Malformed
        );
        assert!(session.cache().is_empty());
    }

    #[tokio::test]
    async fn test_activity_is_independent_of_pose_order() {
        let (mut session, _ctx, _net, _store) = setup();
        session.init(&[]).await.unwrap();
        let peer = PeerId::from_seed(2);
        let target = Uuid::from_u128(44);

        session.handle_envelope(peer, &pose_envelope(peer, 100));
        let state = TransportMessage::State(ActivityState {
            peer_id: peer,
            is_active: true,
            target_id: Some(target),
        })
        .to_envelope(1)
        .unwrap();
        assert_eq!(session.handle_envelope(peer, &state), Handled::Activity);

        assert_eq!(session.cache().activity(&peer).unwrap().target_id, Some(target));
        assert_eq!(session.cache().sample(&peer).unwrap().sender_timestamp, 100);
    }

    #[tokio::test]
    async fn test_publish_activity_is_best_effort() {
        let (mut session, _ctx, net, _store) = setup();
        session.init(&[]).await.unwrap();
        let target = Uuid::from_u128(8);

        session.publish_activity(true, Some(target)).await.unwrap();
        net.set_failing(true);
        session.publish_activity(false, None).await.unwrap();

        let states: Vec<ActivityState> = net
            .sent_messages()
            .into_iter()
            .filter_map(|m| match m {
                TransportMessage::State(state) => Some(state),
                _ => None,
            })
            .collect();
        assert_eq!(states.len(), 1);
        assert!(states[0].is_active);
        assert_eq!(states[0].target_id, Some(target));
    }

    #[tokio::test]
    async fn test_tick_sweeps_silent_peers_on_interval() {
        let (mut session, ctx, _net, _store) = setup();
        session.init(&[]).await.unwrap();
        let peer = PeerId::from_seed(2);
        session.set_metadata(
            peer,
            Some(ParticipantMeta {
                name: "ghost".into(),
                color: "#fff".into(),
                online: true,
            }),
        );
        session.handle_envelope(peer, &pose_envelope(peer, 1));

        ctx.set_ms(4_000);
        assert!(session.tick().is_empty());

        ctx.set_ms(10_000);
        assert!(session.tick().is_empty());

        ctx.set_ms(15_000);
        assert_eq!(session.tick(), vec![peer]);
        assert!(session.cache().roster_entry(&peer).is_none());
    }

    #[tokio::test]
    async fn test_idle_pose_within_throttle_not_sent() {
        let (mut session, ctx, net, _store) = setup();
        session.init(&[]).await.unwrap();
        let idle = Pose::at(50.0, 50.0);

        assert!(session.publish_pose(idle).await.unwrap().sends());
        ctx.set_ms(10);
        assert_eq!(session.publish_pose(idle).await.unwrap(), BroadcastDecision::Throttled);

        let poses = net
            .sent_messages()
            .into_iter()
            .filter(|m| matches!(m, TransportMessage::Pose(_)))
            .count();
        assert_eq!(poses, 1);
    }

    #[tokio::test]
    async fn test_join_from_peer_forces_next_send() {
        let (mut session, ctx, net, _store) = setup();
        session.init(&[]).await.unwrap();
        let idle = Pose::at(50.0, 50.0);
        session.publish_pose(idle).await.unwrap();

        ctx.set_ms(100);
        assert!(!session.publish_pose(idle).await.unwrap().sends());

        let newcomer = PeerId::from_seed(5);
        let join = TransportMessage::Join(JoinMessage {
            peer_id: newcomer,
            room_id: "lobby".into(),
        });
        session.handle_envelope(newcomer, &join.to_envelope(0).unwrap());

        ctx.set_ms(200);
        assert!(session.publish_pose(idle).await.unwrap().sends());
        assert_eq!(net.sent_messages().len(), 3);
    }

    #[tokio::test]
    async fn test_reconnect_backs_off_and_reannounces() {
        let (mut session, ctx, net, _store) = setup();
        session.init(&[]).await.unwrap();
        net.fail_next_connects(2);

        session.reconnect().await.unwrap();

        // Three attempts, each after one fixed backoff
        assert_eq!(ctx.now(), Duration::from_millis(6_000));
        assert_eq!(net.connects.load(std::sync::atomic::Ordering::SeqCst), 4);
        assert_eq!(session.stats().reconnects, 1);
        let joins = net
            .sent_messages()
            .into_iter()
            .filter(|m| matches!(m, TransportMessage::Join(_)))
            .count();
        assert_eq!(joins, 2);
    }

    #[tokio::test]
    async fn test_init_survives_failed_connect() {
        let (mut session, _ctx, net, _store) = setup();
        net.fail_next_connects(1);

        session.init(&[]).await.unwrap();
        assert_eq!(session.state(), SessionState::Running);
        assert!(!session.is_connected());
    }

    #[tokio::test]
    async fn test_destroy_publishes_departures_and_closes() {
        let (mut session, _ctx, _net, _store) = setup();
        session.init(&[]).await.unwrap();
        let departed = Arc::new(Mutex::new(Vec::new()));
        let sink = departed.clone();
        session.subscribe(Arc::new(move |event: &PeerEvent| {
            if let PeerEvent::Departed { peer_id } = event {
                sink.lock().unwrap().push(*peer_id);
            }
        }));

        let peer = PeerId::from_seed(2);
        session.handle_envelope(peer, &pose_envelope(peer, 1));
        assert_eq!(session.destroy(), vec![peer]);
        assert_eq!(*departed.lock().unwrap(), vec![peer]);

        assert!(matches!(
            session.publish_pose(Pose::at(0.0, 0.0)).await,
            Err(SyncError::SessionClosed)
        ));
        assert!(matches!(session.init(&[]).await, Err(SyncError::SessionClosed)));
        assert!(matches!(session.reconnect_attempt().await, Err(SyncError::SessionClosed)));
        assert!(session.destroy().is_empty());
    }

    #[tokio::test]
    async fn test_run_loop_sweeps_while_disconnected() {
        let (mut session, ctx, net, _store) = setup();
        session.init(&[]).await.unwrap();
        let peer = PeerId::from_seed(2);
        session.handle_envelope(peer, &pose_envelope(peer, 1));

        let (stop, shutdown) = watch::channel(false);
        session.subscribe(Arc::new(move |event: &PeerEvent| {
            if matches!(event, PeerEvent::Departed { .. }) {
                let _ = stop.send(true);
            }
        }));

        session.mark_disconnected();
        net.fail_next_connects(10);
        let stats = session.run(shutdown).await.unwrap();

        // Swept on the first interval past the threshold, relay still down
        assert_eq!(stats.evictions, 1);
        assert_eq!(stats.reconnects, 0);
        assert!(!session.cache().contains(&peer));
        assert!(!session.is_connected());
        assert_eq!(ctx.now(), Duration::from_millis(12_000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_loop_recovers_from_disconnect() {
        let ctx = TokioContext::shared();
        let net = Arc::new(RecordingTransport::new(PeerId::from_seed(1)));
        let store = Arc::new(MemorySnapshotStore::new());
        let mut session = SyncSession::new(ctx.clone(), net.clone(), store, SyncConfig::default(), "lobby");
        session.init(&[]).await.unwrap();

        net.drop_connection();
        net.fail_next_connects(1);
        let (stop, shutdown) = watch::channel(false);
        let peer = PeerId::from_seed(2);

        let driver = {
            let net = net.clone();
            async move {
                tokio::time::sleep(Duration::from_secs(10)).await;
                net.inject.send((peer, pose_envelope(peer, 42))).unwrap();
                tokio::time::sleep(Duration::from_millis(100)).await;
                stop.send(true).unwrap();
            }
        };

        let (result, ()) = tokio::join!(session.run(shutdown), driver);
        let stats = result.unwrap();

        assert_eq!(stats.reconnects, 1);
        assert_eq!(stats.accepted_poses, 1);
        assert!(session.cache().contains(&peer));
        assert!(session.is_connected());
    }
}
