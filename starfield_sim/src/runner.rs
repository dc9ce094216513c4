//! Scenario runner - executes chaos scenarios against real sessions and
//! placement reconcilers.
//!
//! Every scenario builds a [`Cluster`]: one `SimWorld`, the avatar oracle,
//! a shared snapshot store and object store, and as many simulated clients
//! as it needs. The cluster is stepped on a fixed tick; all randomness is
//! derived from the run seed, so a seed reproduces a run exactly.

use crate::agent::SimulatedClient;
use crate::exporter::{AvatarPosition, ClientFrame, SimEvent, SimExport, SimFrame};
use crate::oracle::Oracle;
use crate::scenarios::ScenarioId;
use crate::world::{LinkProfile, SimConfig, SimWorld};

use nalgebra::Vector2;
use rand::seq::SliceRandom;
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use starfield_core::config::ZoneSpec;
use starfield_core::{
    Coordinate, MemoryObjectStore, MemorySnapshotStore, ObjectStore, ParticipantMeta, PlacementConfig,
    PlacementReconciler, PlacementRequest, SpatialAllocator, SpatialObject, WorldConfig, ZoneKey,
};
use starfield_env::PeerId;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Cached and sent positions must agree to within float round-tripping.
const POSITION_TOLERANCE: f64 = 1e-6;

/// Record an export frame every this many ticks.
const EXPORT_EVERY_TICKS: u64 = 10;

const ROOM: &str = "sim-room";

/// Results from running a scenario.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioResult {
    /// Scenario that was run
    pub scenario: ScenarioId,

    /// Seed used
    pub seed: u64,

    /// Whether scenario passed all assertions
    pub passed: bool,

    /// Total ticks executed
    pub total_ticks: u64,

    /// Final simulation time in seconds
    pub final_time_secs: f64,

    /// Clients still running at the end
    pub final_client_count: usize,

    /// Failure message if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,

    /// Metrics collected during run
    pub metrics: ScenarioMetrics,
}

/// Metrics collected during scenario execution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScenarioMetrics {
    pub envelopes_routed: u64,
    pub envelopes_delivered: u64,
    /// Lost to link loss or partitions
    pub envelopes_dropped: u64,

    pub poses_sent: u64,
    pub poses_accepted: u64,
    /// Out-of-order poses discarded by the ordering rule
    pub stale_poses: u64,
    pub evictions: u64,
    pub reconnects: u64,

    pub objects_placed: u64,
    /// Post-write checks that moved an object
    pub repairs: u64,
    pub objects_moved: u64,
    pub overlaps_before: usize,
    pub overlaps_after: usize,

    /// Largest distance between a cached pose and the pose its owner last sent
    pub max_position_error: f64,
}

/// Runs chaos scenarios.
pub struct ScenarioRunner {
    /// Configuration seed
    seed: u64,

    /// Number of clients
    num_clients: usize,

    /// Tick rate in Hz
    tick_rate_hz: u32,

    /// Duration of the steady-state phase in seconds
    max_duration_secs: f64,

    /// Sync and placement parameters shared by every client
    config: WorldConfig,
}

impl ScenarioRunner {
    /// Creates a new scenario runner.
    pub fn new(seed: u64, num_clients: usize) -> Self {
        Self {
            seed,
            num_clients,
            tick_rate_hz: 30,
            max_duration_secs: 10.0,
            config: WorldConfig::default(),
        }
    }

    /// Sets the tick rate.
    pub fn with_tick_rate(mut self, hz: u32) -> Self {
        self.tick_rate_hz = hz.max(1);
        self
    }

    /// Sets the steady-state duration.
    pub fn with_duration(mut self, secs: f64) -> Self {
        self.max_duration_secs = secs;
        self
    }

    /// Replaces the default sync/placement parameters.
    pub fn with_config(mut self, config: WorldConfig) -> Self {
        self.config = config;
        self
    }

    /// Runs a scenario and returns the result.
    pub fn run(&self, scenario: ScenarioId) -> ScenarioResult {
        self.execute(scenario, None).0
    }

    /// Runs a scenario and writes frame-by-frame data to `export_path`.
    pub fn run_with_export(&self, scenario: ScenarioId, export_path: &str) -> ScenarioResult {
        let export = SimExport::new(scenario.name(), self.seed);
        let (result, export) = self.execute(scenario, Some(export));

        if let Some(export) = export {
            match export.write_to_file(export_path) {
                Ok(()) => info!("Exported {} frames to {}", export.frames.len(), export_path),
                Err(e) => error!("Failed to write export: {:?}", e),
            }
        }
        result
    }

    fn execute(&self, scenario: ScenarioId, export: Option<SimExport>) -> (ScenarioResult, Option<SimExport>) {
        info!("Starting scenario: {} (seed={})", scenario.name(), self.seed);

        // Single-threaded so envelope handling order is reproducible
        let runtime = match tokio::runtime::Builder::new_current_thread().enable_time().build() {
            Ok(runtime) => runtime,
            Err(e) => {
                let mut cluster = self.cluster(scenario, None);
                let result = cluster.result(scenario, Err(format!("failed to build runtime: {}", e)));
                return (result, export);
            }
        };

        runtime.block_on(async {
            let mut cluster = self.cluster(scenario, export);
            let verdict = match scenario {
                ScenarioId::JitterStorm => self.run_jitter_storm(&mut cluster).await,
                ScenarioId::GhostSweep => self.run_ghost_sweep(&mut cluster).await,
                ScenarioId::PlacementRace => self.run_placement_race(&mut cluster).await,
                ScenarioId::Resync => self.run_resync(&mut cluster).await,
                ScenarioId::FlakyLink => self.run_flaky_link(&mut cluster).await,
            };
            let result = cluster.result(scenario, verdict);
            (result, cluster.export.take())
        })
    }

    fn cluster(&self, scenario: ScenarioId, export: Option<SimExport>) -> Cluster {
        let link = match scenario {
            ScenarioId::JitterStorm => LinkProfile {
                base_latency_ms: 30,
                jitter_ms: 400,
                loss_rate: 0.0,
            },
            ScenarioId::GhostSweep => LinkProfile {
                base_latency_ms: 20,
                jitter_ms: 10,
                loss_rate: 0.0,
            },
            ScenarioId::FlakyLink => LinkProfile {
                base_latency_ms: 40,
                jitter_ms: 60,
                loss_rate: 0.15,
            },
            ScenarioId::PlacementRace | ScenarioId::Resync => LinkProfile::default(),
        };

        let sim = SimConfig {
            seed: self.seed,
            tick_rate_hz: self.tick_rate_hz,
            link,
        };
        Cluster::new(sim, self.config.clone(), export)
    }

    // ========================================================================
    // SF-001: JITTER STORM
    // ========================================================================

    /// Heavy reordering and skewed wall clocks. After the network drains,
    /// every client must hold exactly the pose each peer sent last.
    async fn run_jitter_storm(&self, cluster: &mut Cluster) -> Result<(), String> {
        let n = self.num_clients.max(2);
        for i in 0..n {
            // Up to 1.2s of skew; ordering only compares one sender's stamps
            let skew = Duration::from_millis((i as u64 * 173) % 1_200);
            cluster.add_client(skew, false);
        }
        cluster.start_all().await?;

        cluster.run_for(self.max_duration_secs).await;
        cluster.settle().await;

        let missing = cluster.missing_views();
        if !missing.is_empty() {
            return Err(format!("{} peer views missing: {}", missing.len(), missing.join(", ")));
        }

        let error = cluster.convergence_error();
        cluster.metrics.max_position_error = error;
        if error > POSITION_TOLERANCE {
            return Err(format!("views diverged from last sent pose by {:.6}", error));
        }

        debug!(
            stale = cluster.metrics().stale_poses,
            "jitter storm converged"
        );
        Ok(())
    }

    // ========================================================================
    // SF-002: GHOST SWEEP
    // ========================================================================

    /// A client dies silently while presence still lists it as online.
    /// Survivors must evict it on staleness alone, keep an idle-but-present
    /// peer, and a late joiner must bootstrap the live peers but not the ghost.
    async fn run_ghost_sweep(&self, cluster: &mut Cluster) -> Result<(), String> {
        let n = self.num_clients.max(3);
        let ghost = cluster.add_client(Duration::ZERO, false);
        let idle = cluster.add_client(Duration::ZERO, true);
        for _ in 2..n {
            cluster.add_client(Duration::ZERO, false);
        }
        cluster.start_all().await?;
        cluster.run_for(2.0).await;

        let ghost_id = cluster.clients[ghost].peer_id();
        cluster.crash(ghost);

        let presence = ParticipantMeta {
            name: "ghost".to_string(),
            color: "#7f7f7f".to_string(),
            online: true,
        };
        for client in cluster.live_clients_mut() {
            client.session_mut().set_metadata(ghost_id, Some(presence.clone()));
        }

        let sync = &self.config.sync;
        let horizon_ms = sync.staleness_threshold_ms + sync.sweep_interval_ms + 1_000;
        cluster.run_for(horizon_ms as f64 / 1000.0).await;

        for client in cluster.live_clients() {
            if client.session().cache().contains(&ghost_id) {
                return Err(format!("client {} still shows the crashed peer", client.index()));
            }
        }

        let idle_id = cluster.clients[idle].peer_id();
        let missing = cluster.missing_views();
        if !missing.is_empty() {
            return Err(format!(
                "live peers evicted ({} is idle): {}",
                idle_id,
                missing.join(", ")
            ));
        }

        // Late joiner: the roster still names the ghost
        let late = cluster.add_client(Duration::ZERO, false);
        cluster.start_client(late).await?;
        cluster.event(SimEvent::info(format!("client {} joined late", late)));

        let late_cache = cluster.clients[late].session().cache();
        if late_cache.contains(&ghost_id) {
            return Err("late joiner bootstrapped the crashed peer".to_string());
        }
        for client in cluster.live_clients() {
            if client.index() != late && !late_cache.contains(&client.peer_id()) {
                return Err(format!("late joiner did not bootstrap client {}", client.index()));
            }
        }

        cluster.run_for(1.0).await;
        let missing = cluster.missing_views();
        if !missing.is_empty() {
            return Err(format!("views incomplete after late join: {}", missing.join(", ")));
        }
        Ok(())
    }

    // ========================================================================
    // SF-003: PLACEMENT RACE
    // ========================================================================

    /// Independent writers (one reconciler each, one shared store) plan a
    /// batch against the same state, then commit in shuffled order. The
    /// post-write check has to untangle every collision.
    async fn run_placement_race(&self, cluster: &mut Cluster) -> Result<(), String> {
        let writers = self.num_clients.max(2);
        for _ in 0..writers {
            cluster.add_client(Duration::ZERO, false);
        }

        let placement = cluster.placement_config();
        let reconcilers: Vec<PlacementReconciler> = (0..writers)
            .map(|_| cluster.reconciler(&placement))
            .collect();
        let zones = cluster.zone_keys();

        let total = writers * 8;
        let mut placed = 0;
        while placed < total {
            let batch = writers.min(total - placed);

            // Every writer in the batch targets the same zone
            let zone = zones[cluster.rng.gen_range(0..zones.len())];
            let mut planned = Vec::with_capacity(batch);
            for (writer, reconciler) in reconcilers.iter().enumerate().take(batch) {
                let request = cluster.random_request(placed + writer, zone);
                let object = reconciler.plan(request).map_err(|e| e.to_string())?;
                planned.push((writer, object));
            }

            planned.shuffle(&mut cluster.rng);
            for (writer, object) in planned {
                let intended = object.coordinate();
                let committed = reconcilers[writer].commit(object).map_err(|e| e.to_string())?;
                cluster.metrics.objects_placed += 1;
                if committed.coordinate() != intended {
                    cluster.metrics.repairs += 1;
                }
            }
            placed += batch;
        }

        let overlaps = reconcilers[0].overlap_report().map_err(|e| e.to_string())?;
        cluster.metrics.overlaps_after = overlaps.len();
        if let Some(overlap) = overlaps.first() {
            return Err(format!(
                "{} overlaps after race, e.g. {} and {} at {:.1}",
                overlaps.len(),
                overlap.first,
                overlap.second,
                overlap.distance
            ));
        }
        if cluster.metrics.repairs == 0 {
            return Err("no collision was produced, race not exercised".to_string());
        }

        let summary = reconcilers[0].reposition_all().map_err(|e| e.to_string())?;
        cluster.metrics.objects_moved = summary.moved as u64;
        let overlaps = reconcilers[0].overlap_report().map_err(|e| e.to_string())?;
        cluster.metrics.overlaps_after = overlaps.len();
        if !overlaps.is_empty() {
            return Err(format!("{} overlaps after reposition", overlaps.len()));
        }
        Ok(())
    }

    // ========================================================================
    // SF-004: RESYNC
    // ========================================================================

    /// Rows written before placement existed all sit at the origin. A
    /// reposition pass must clear them and a second pass must move nothing,
    /// also after reassignments and deletions.
    async fn run_resync(&self, cluster: &mut Cluster) -> Result<(), String> {
        let owners = self.num_clients.max(2);
        for _ in 0..owners {
            cluster.add_client(Duration::ZERO, false);
        }

        let placement = cluster.placement_config();
        let reconciler = cluster.reconciler(&placement);
        let zones = cluster.zone_keys();

        for i in 0..owners * 6 {
            let zone = zones[i % zones.len()];
            let request = cluster.random_request(i, zone);
            cluster
                .objects
                .insert(SpatialObject {
                    id: request.id,
                    zone_key: request.zone_key,
                    x: 0.0,
                    y: 0.0,
                    occupied_radius: placement.object_radius,
                    completed: request.completed,
                    sort_key: request.sort_key,
                })
                .map_err(|e| e.to_string())?;
        }

        let before = reconciler.overlap_report().map_err(|e| e.to_string())?;
        cluster.metrics.overlaps_before = before.len();
        if before.is_empty() {
            return Err("piled-up objects did not overlap".to_string());
        }

        let first = reconciler.reposition_all().map_err(|e| e.to_string())?;
        cluster.metrics.objects_moved = first.moved as u64;
        expect_clean(&reconciler, "first reposition")?;
        expect_idempotent(&reconciler, "first reposition")?;

        // Churn: a few objects change owner, a few are deleted
        let objects = cluster.objects.all().map_err(|e| e.to_string())?;
        for object in objects.iter().take(3) {
            reconciler
                .reassign(&object.id, ZoneKey::Unassigned)
                .map_err(|e| e.to_string())?;
        }
        for object in objects.iter().rev().take(2) {
            reconciler.remove(&object.id).map_err(|e| e.to_string())?;
        }
        expect_clean(&reconciler, "churn")?;

        let second = reconciler.reposition_all().map_err(|e| e.to_string())?;
        cluster.metrics.objects_moved += second.moved as u64;
        expect_idempotent(&reconciler, "post-churn reposition")?;

        cluster.metrics.overlaps_after = reconciler.overlap_report().map_err(|e| e.to_string())?.len();
        expect_clean(&reconciler, "final state")
    }

    // ========================================================================
    // SF-005: FLAKY LINK
    // ========================================================================

    /// Lossy links all run long, and one client loses the relay from 3s to
    /// 9s. It must reconnect on its own and every roster must be complete
    /// once the network drains.
    async fn run_flaky_link(&self, cluster: &mut Cluster) -> Result<(), String> {
        let n = self.num_clients.max(2);
        for _ in 0..n {
            cluster.add_client(Duration::ZERO, false);
        }
        cluster.start_all().await?;

        let victim = 0;
        let victim_id = cluster.clients[victim].peer_id();
        let end = self.max_duration_secs.max(15.0);

        cluster.run_until(3.0).await;
        cluster.world.controller.disconnect(victim_id);
        cluster.event(SimEvent::warn(format!("client {} lost the relay", victim)));

        cluster.run_until(9.0).await;
        cluster.world.controller.restore(victim_id);
        cluster.event(SimEvent::info(format!("relay reachable again for client {}", victim)));

        cluster.run_until(end).await;
        cluster.settle().await;

        let reconnects = cluster.clients[victim].session().stats().reconnects;
        if reconnects == 0 {
            return Err(format!("client {} never reconnected", victim));
        }

        let missing = cluster.missing_views();
        if !missing.is_empty() {
            return Err(format!("rosters incomplete: {}", missing.join(", ")));
        }
        Ok(())
    }
}

fn expect_clean(reconciler: &PlacementReconciler, stage: &str) -> Result<(), String> {
    let overlaps = reconciler.overlap_report().map_err(|e| e.to_string())?;
    if overlaps.is_empty() {
        Ok(())
    } else {
        Err(format!("{} overlaps after {}", overlaps.len(), stage))
    }
}

fn expect_idempotent(reconciler: &PlacementReconciler, stage: &str) -> Result<(), String> {
    let again = reconciler.reposition_all().map_err(|e| e.to_string())?;
    if again.moved == 0 {
        Ok(())
    } else {
        Err(format!("repeating the {} moved {} objects", stage, again.moved))
    }
}

// ============================================================================
// CLUSTER
// ============================================================================

/// Everything one scenario run steps together.
struct Cluster {
    world: SimWorld,
    oracle: Oracle,
    clients: Vec<SimulatedClient>,
    snapshots: Arc<MemorySnapshotStore>,
    objects: Arc<MemoryObjectStore>,
    config: WorldConfig,
    seed: u64,

    /// Scenario choices (zones, ids, commit order)
    rng: ChaCha8Rng,

    /// Whether clients offer poses this tick
    publishing: bool,

    export: Option<SimExport>,
    pending_events: Vec<SimEvent>,

    /// Counters filled by the scenario itself
    metrics: ScenarioMetrics,
}

impl Cluster {
    fn new(sim: SimConfig, config: WorldConfig, export: Option<SimExport>) -> Self {
        let seed = sim.seed;
        let world = SimWorld::new(sim);
        let rng = world.clock.derive_rng(0x7363_656e);

        Self {
            oracle: Oracle::new(seed.wrapping_mul(0x9e37_79b9_7f4a_7c15)),
            world,
            clients: Vec::new(),
            snapshots: Arc::new(MemorySnapshotStore::new()),
            objects: Arc::new(MemoryObjectStore::new()),
            config,
            seed,
            rng,
            publishing: true,
            export,
            pending_events: Vec::new(),
            metrics: ScenarioMetrics::default(),
        }
    }

    /// Adds a client and its avatar. The client is not started.
    fn add_client(&mut self, skew: Duration, idle: bool) -> usize {
        let index = self.clients.len();
        let peer = PeerId::from_seed(self.seed.wrapping_add(index as u64 + 1));
        let (ctx, net) = self.world.attach(peer, skew);

        let position = Vector2::new(self.rng.gen_range(-800.0..800.0), self.rng.gen_range(-800.0..800.0));
        if idle {
            self.oracle.spawn_idle(peer, position);
        } else {
            let velocity = Vector2::new(self.rng.gen_range(-80.0..80.0), self.rng.gen_range(-80.0..80.0));
            self.oracle.spawn_avatar(peer, position, velocity);
        }

        self.clients.push(SimulatedClient::new(
            ctx,
            net,
            self.snapshots.clone(),
            self.config.sync.clone(),
            ROOM,
            index,
        ));
        index
    }

    fn roster(&self) -> Vec<PeerId> {
        self.clients.iter().map(SimulatedClient::peer_id).collect()
    }

    async fn start_all(&mut self) -> Result<(), String> {
        let roster = self.roster();
        for client in &mut self.clients {
            client
                .start(&roster)
                .await
                .map_err(|e| format!("client {} failed to start: {}", client.index(), e))?;
        }
        Ok(())
    }

    async fn start_client(&mut self, index: usize) -> Result<(), String> {
        let roster = self.roster();
        self.clients[index]
            .start(&roster)
            .await
            .map_err(|e| format!("client {} failed to start: {}", index, e))
    }

    fn crash(&mut self, index: usize) {
        let peer = self.clients[index].peer_id();
        self.clients[index].crash();
        self.world.controller.disconnect(peer);
        self.oracle.remove_avatar(&peer);
        self.event(SimEvent::warn(format!("client {} crashed", index)));
    }

    fn live_clients(&self) -> impl Iterator<Item = &SimulatedClient> {
        self.clients.iter().filter(|c| !c.is_crashed())
    }

    fn live_clients_mut(&mut self) -> impl Iterator<Item = &mut SimulatedClient> {
        self.clients.iter_mut().filter(|c| !c.is_crashed())
    }

    fn event(&mut self, event: SimEvent) {
        match event.level.as_deref() {
            Some("warn") => warn!("t={:.2}s {}", self.world.time(), event.message),
            _ => info!("t={:.2}s {}", self.world.time(), event.message),
        }
        if self.export.is_some() {
            self.pending_events.push(event);
        }
    }

    // ------------------------------------------------------------------------
    // Stepping
    // ------------------------------------------------------------------------

    /// One tick: physics, clocks, deliveries, inbox handling, then publishing.
    async fn step(&mut self) {
        self.oracle.step(self.world.dt().as_secs_f64());
        self.world.advance();
        self.world.deliver();

        for client in &mut self.clients {
            let evicted = client.drain().await;
            if !evicted.is_empty() {
                debug!(client = client.index(), evicted = evicted.len(), "peers evicted");
            }
        }

        if self.publishing {
            for client in &mut self.clients {
                let Some(pose) = self.oracle.pose(&client.peer_id()) else {
                    continue;
                };
                if let Err(e) = client.publish(pose).await {
                    warn!(client = client.index(), error = %e, "publish rejected");
                }
            }
        }

        self.world.route();

        if self.export.is_some() && self.world.tick_count() % EXPORT_EVERY_TICKS == 0 {
            self.record_frame();
        }
    }

    async fn run_for(&mut self, secs: f64) {
        let ticks = (secs * self.world.config.tick_rate_hz as f64).round() as u64;
        for _ in 0..ticks {
            self.step().await;
        }
    }

    async fn run_until(&mut self, t_secs: f64) {
        while self.world.time() + 1e-9 < t_secs {
            self.step().await;
        }
    }

    /// Stops publishing and steps until nothing is left in flight.
    async fn settle(&mut self) {
        self.publishing = false;
        let limit = 5 * self.world.config.tick_rate_hz as u64;
        for _ in 0..limit {
            self.step().await;
            if self.world.in_flight() == 0 {
                break;
            }
        }
        self.publishing = true;
    }

    // ------------------------------------------------------------------------
    // Checks
    // ------------------------------------------------------------------------

    /// `a->b` for every live pair where `a` has no sample of `b`.
    fn missing_views(&self) -> Vec<String> {
        let mut missing = Vec::new();
        for viewer in self.live_clients() {
            for peer in self.live_clients() {
                if viewer.index() != peer.index() && !viewer.session().cache().contains(&peer.peer_id()) {
                    missing.push(format!("{}->{}", viewer.index(), peer.index()));
                }
            }
        }
        missing
    }

    /// Largest gap between a cached pose and the pose its owner last sent.
    fn convergence_error(&self) -> f64 {
        let mut worst: f64 = 0.0;
        for viewer in self.live_clients() {
            for peer in self.live_clients() {
                if viewer.index() == peer.index() {
                    continue;
                }
                let cached = viewer.session().cache().sample(&peer.peer_id());
                if let (Some(sample), Some(sent)) = (cached, peer.last_sent()) {
                    worst = worst.max(sample.pose.position_delta(sent));
                }
            }
        }
        worst
    }

    // ------------------------------------------------------------------------
    // Placement helpers
    // ------------------------------------------------------------------------

    /// Placement config with a ring zone for every client, anchors 3000 apart.
    fn placement_config(&self) -> PlacementConfig {
        let mut placement = self.config.placement.clone();
        for (i, client) in self.clients.iter().enumerate() {
            let key = ZoneKey::Participant(client.peer_id());
            if placement.zones.iter().any(|zone| zone.key == key) {
                continue;
            }
            placement.zones.push(ZoneSpec {
                key,
                anchor: Coordinate::new(5_000.0 + 3_000.0 * i as f64, 5_000.0),
                layout: None,
            });
        }
        placement
    }

    fn reconciler(&self, placement: &PlacementConfig) -> PlacementReconciler {
        PlacementReconciler::new(
            SpatialAllocator::from_config(placement),
            self.objects.clone(),
            placement.object_radius,
        )
    }

    fn zone_keys(&self) -> Vec<ZoneKey> {
        std::iter::once(ZoneKey::Unassigned)
            .chain(self.clients.iter().map(|c| ZoneKey::Participant(c.peer_id())))
            .collect()
    }

    fn random_request(&mut self, n: usize, zone: ZoneKey) -> PlacementRequest {
        let id = Uuid::from_u128(self.rng.gen());
        let completed = self.rng.gen_bool(0.25);
        PlacementRequest::new(id, zone, format!("item-{:04}", n)).completed(completed)
    }

    // ------------------------------------------------------------------------
    // Reporting
    // ------------------------------------------------------------------------

    fn record_frame(&mut self) {
        let ground_truth: Vec<AvatarPosition> = self
            .oracle
            .avatars()
            .map(|avatar| AvatarPosition::new(avatar.peer_id, &avatar.pose()))
            .collect();

        let clients: Vec<ClientFrame> = self
            .live_clients()
            .map(|client| {
                let mut peers = Vec::new();
                let mut error_sum = 0.0;
                let mut compared = 0usize;
                for entry in client.session().cache().roster() {
                    peers.push(AvatarPosition::new(entry.peer_id, &entry.pose));
                    if let Some(truth) = self.oracle.pose(&entry.peer_id) {
                        error_sum += entry.pose.position_delta(&truth);
                        compared += 1;
                    }
                }
                ClientFrame {
                    peer_id: client.peer_id().to_string(),
                    connected: client.session().is_connected(),
                    peers,
                    mean_error: (compared > 0).then(|| error_sum / compared as f64),
                }
            })
            .collect();

        let events = std::mem::take(&mut self.pending_events);
        if let Some(export) = self.export.as_mut() {
            export.add_frame(SimFrame {
                time_sec: self.world.time(),
                ground_truth,
                clients,
                events,
            });
        }
    }

    fn metrics(&self) -> ScenarioMetrics {
        let mut metrics = self.metrics.clone();
        let router = self.world.stats();
        metrics.envelopes_routed = router.routed;
        metrics.envelopes_delivered = router.delivered;
        metrics.envelopes_dropped = router.dropped_loss + router.dropped_partition;

        for client in &self.clients {
            let session = client.session().stats();
            metrics.poses_sent += client.session().broadcast_stats().sent;
            metrics.poses_accepted += session.accepted_poses;
            metrics.stale_poses += session.stale_poses;
            metrics.evictions += session.evictions;
            metrics.reconnects += session.reconnects;
        }
        metrics
    }

    fn result(&mut self, scenario: ScenarioId, verdict: Result<(), String>) -> ScenarioResult {
        let failure_reason = verdict.err();
        let passed = failure_reason.is_none();

        if self.export.is_some() {
            self.record_frame();
        }
        let objects = self.objects.all().unwrap_or_default();
        if let Some(export) = self.export.as_mut() {
            export.finalize(passed, failure_reason.clone(), &objects);
        }

        ScenarioResult {
            scenario,
            seed: self.seed,
            passed,
            total_ticks: self.world.tick_count(),
            final_time_secs: self.world.time(),
            final_client_count: self.live_clients().count(),
            failure_reason,
            metrics: self.metrics(),
        }
    }
}
