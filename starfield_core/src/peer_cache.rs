//! The "PEER" cache - latest kinematic sample per remote participant.
//!
//! Two independent inputs feed the rendered roster:
//! - **Transport** (`ingest`, `ingest_activity`, `sweep`): drives motion and
//!   is the only path that may add or remove a moving peer.
//! - **Roster metadata** (`set_metadata`, `remove_metadata`): name/colour
//!   supplied by an external presence service; it decorates entries but never
//!   evicts them, so a flapping "online" flag cannot make avatars jitter.
//!
//! Accepted samples are pushed synchronously to [`PeerEventListener`]s so a
//! renderer can bypass any higher-level state layer.

use crate::pose::{PeerSample, Pose};
use crate::wire::ActivityState;
use serde::{Deserialize, Serialize};
use starfield_env::PeerId;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

// ============================================================================
// EVENTS & SUBSCRIPTIONS
// ============================================================================

/// Notification published by the cache.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    /// A newer pose was accepted for `peer_id`
    Pose { peer_id: PeerId, pose: Pose },
    /// A peer's activity flag changed
    Activity(ActivityState),
    /// A peer was evicted (staleness sweep or session teardown)
    Departed { peer_id: PeerId },
}

/// Low-latency subscriber to [`PeerEvent`]s.
///
/// Called inline from `ingest`/`sweep`; implementations must not block.
pub trait PeerEventListener: Send + Sync {
    fn on_event(&self, event: &PeerEvent);
}

impl<F> PeerEventListener for F
where
    F: Fn(&PeerEvent) + Send + Sync,
{
    fn on_event(&self, event: &PeerEvent) {
        self(event)
    }
}

/// Handle returned by `subscribe`, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Ordered list of listeners.
#[derive(Default)]
pub struct EventBus {
    listeners: Vec<(SubscriptionId, Arc<dyn PeerEventListener>)>,
    next_id: u64,
}

impl EventBus {
    pub fn subscribe(&mut self, listener: Arc<dyn PeerEventListener>) -> SubscriptionId {
        let id = SubscriptionId(self.next_id);
        self.next_id += 1;
        self.listeners.push((id, listener));
        id
    }

    /// Returns false if the subscription was already gone.
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|(sid, _)| *sid != id);
        self.listeners.len() != before
    }

    pub fn publish(&self, event: &PeerEvent) {
        for (_, listener) in &self.listeners {
            listener.on_event(event);
        }
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }
}

// ============================================================================
// ROSTER
// ============================================================================

/// Display metadata owned by the external presence service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantMeta {
    pub name: String,
    pub color: String,
    pub online: bool,
}

/// One rendered avatar.
#[derive(Debug, Clone, PartialEq)]
pub struct RosterEntry {
    pub peer_id: PeerId,
    pub pose: Pose,
    pub meta: Option<ParticipantMeta>,
    pub activity: Option<ActivityState>,
}

/// What `ingest` did with a sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// First sample from this peer
    Inserted,
    /// Newer than the cached sample
    Replaced,
    /// Not newer; dropped
    Stale,
}

impl IngestOutcome {
    pub fn is_accepted(&self) -> bool {
        !matches!(self, IngestOutcome::Stale)
    }
}

// ============================================================================
// CACHE
// ============================================================================

/// Per-client cache of remote peers' latest poses.
pub struct PeerStateCache {
    samples: HashMap<PeerId, PeerSample>,
    /// Activity flag plus its local receipt time
    activity: HashMap<PeerId, (ActivityState, u64)>,
    metadata: HashMap<PeerId, ParticipantMeta>,
    roster: BTreeMap<PeerId, RosterEntry>,
    bus: EventBus,
    staleness_threshold_ms: u64,
}

impl PeerStateCache {
    pub fn new(staleness_threshold_ms: u64) -> Self {
        Self {
            samples: HashMap::new(),
            activity: HashMap::new(),
            metadata: HashMap::new(),
            roster: BTreeMap::new(),
            bus: EventBus::default(),
            staleness_threshold_ms,
        }
    }

    pub fn subscribe(&mut self, listener: Arc<dyn PeerEventListener>) -> SubscriptionId {
        self.bus.subscribe(listener)
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.bus.unsubscribe(id)
    }

    /// Applies the compare-and-replace rule for one incoming pose.
    ///
    /// `received_at` is the local wall clock and only matters for `sweep`.
    pub fn ingest(&mut self, peer_id: PeerId, pose: Pose, received_at: u64) -> IngestOutcome {
        let outcome = match self.samples.get(&peer_id) {
            Some(cached) if !cached.superseded_by(pose.sender_timestamp) => return IngestOutcome::Stale,
            Some(_) => IngestOutcome::Replaced,
            None => IngestOutcome::Inserted,
        };

        self.samples.insert(peer_id, PeerSample::new(peer_id, pose, received_at));
        self.bus.publish(&PeerEvent::Pose { peer_id, pose });

        let meta = self.metadata.get(&peer_id).cloned();
        let activity = self.activity.get(&peer_id).map(|(state, _)| *state);
        self.roster
            .entry(peer_id)
            .and_modify(|entry| entry.pose = pose)
            .or_insert(RosterEntry {
                peer_id,
                pose,
                meta,
                activity,
            });

        if outcome == IngestOutcome::Inserted {
            tracing::debug!(peer = %peer_id, "peer appeared");
        }
        outcome
    }

    /// Records an activity flag. Last arrival wins; poses are unaffected.
    ///
    /// A flag from a peer without a pose ages out on the same threshold.
    pub fn ingest_activity(&mut self, state: ActivityState, received_at: u64) {
        self.activity.insert(state.peer_id, (state, received_at));
        if let Some(entry) = self.roster.get_mut(&state.peer_id) {
            entry.activity = Some(state);
        }
        self.bus.publish(&PeerEvent::Activity(state));
    }

    /// Updates display metadata. Never adds or removes a rendered avatar.
    pub fn set_metadata(&mut self, peer_id: PeerId, meta: ParticipantMeta) {
        if let Some(entry) = self.roster.get_mut(&peer_id) {
            entry.meta = Some(meta.clone());
        }
        self.metadata.insert(peer_id, meta);
    }

    /// Drops display metadata. The avatar stays until the sweep evicts it.
    pub fn remove_metadata(&mut self, peer_id: &PeerId) {
        self.metadata.remove(peer_id);
        if let Some(entry) = self.roster.get_mut(peer_id) {
            entry.meta = None;
        }
    }

    /// Evicts peers silent for longer than the staleness threshold.
    pub fn sweep(&mut self, now_ms: u64) -> Vec<PeerId> {
        let threshold = self.staleness_threshold_ms;
        let mut stale: Vec<PeerId> = self
            .samples
            .values()
            .filter(|sample| sample.age_ms(now_ms) > threshold)
            .map(|sample| sample.peer_id)
            .collect();
        stale.sort();

        for peer_id in &stale {
            self.evict(peer_id);
            tracing::debug!(peer = %peer_id, "evicted stale peer");
        }

        let samples = &self.samples;
        self.activity.retain(|peer_id, (_, received_at)| {
            samples.contains_key(peer_id) || now_ms.saturating_sub(*received_at) <= threshold
        });
        stale
    }

    /// Evicts every peer, publishing departures. Used on teardown.
    pub fn clear(&mut self) -> Vec<PeerId> {
        let peers: Vec<PeerId> = self.roster.keys().copied().collect();
        for peer_id in &peers {
            self.evict(peer_id);
        }
        self.samples.clear();
        self.activity.clear();
        peers
    }

    fn evict(&mut self, peer_id: &PeerId) {
        self.samples.remove(peer_id);
        self.activity.remove(peer_id);
        if self.roster.remove(peer_id).is_some() {
            self.bus.publish(&PeerEvent::Departed { peer_id: *peer_id });
        }
    }

    pub fn sample(&self, peer_id: &PeerId) -> Option<&PeerSample> {
        self.samples.get(peer_id)
    }

    pub fn activity(&self, peer_id: &PeerId) -> Option<&ActivityState> {
        self.activity.get(peer_id).map(|(state, _)| state)
    }

    pub fn roster_entry(&self, peer_id: &PeerId) -> Option<&RosterEntry> {
        self.roster.get(peer_id)
    }

    /// Rendered roster in peer-id order.
    pub fn roster(&self) -> impl Iterator<Item = &RosterEntry> {
        self.roster.values()
    }

    pub fn contains(&self, peer_id: &PeerId) -> bool {
        self.samples.contains_key(peer_id)
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn staleness_threshold_ms(&self) -> u64 {
        self.staleness_threshold_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Mutex;

    fn pose_at(ts: u64) -> Pose {
        Pose::at(ts as f64, 0.0).stamped(ts)
    }

    fn recording_listener() -> (Arc<Mutex<Vec<PeerEvent>>>, Arc<dyn PeerEventListener>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&log);
        let listener: Arc<dyn PeerEventListener> =
            Arc::new(move |event: &PeerEvent| sink.lock().unwrap().push(event.clone()));
        (log, listener)
    }

    #[test]
    fn test_out_of_order_samples_keep_newest() {
        let mut cache = PeerStateCache::new(10_000);
        let peer = PeerId::from_seed(1);

        for ts in [5, 3, 9, 7] {
            cache.ingest(peer, pose_at(ts), 100);
        }

        assert_eq!(cache.sample(&peer).unwrap().sender_timestamp, 9);
        assert_eq!(cache.roster_entry(&peer).unwrap().pose.sender_timestamp, 9);
    }

    #[test]
    fn test_equal_timestamp_is_stale() {
        let mut cache = PeerStateCache::new(10_000);
        let peer = PeerId::from_seed(1);

        assert_eq!(cache.ingest(peer, pose_at(5), 0), IngestOutcome::Inserted);
        assert_eq!(cache.ingest(peer, Pose::at(99.0, 99.0).stamped(5), 0), IngestOutcome::Stale);
        assert_eq!(cache.sample(&peer).unwrap().pose.x, 5.0);
    }

    #[test]
    fn test_receipt_time_does_not_order() {
        let mut cache = PeerStateCache::new(10_000);
        let peer = PeerId::from_seed(1);

        // Later receipt but older sender stamp loses
        cache.ingest(peer, pose_at(20), 1_000);
        assert_eq!(cache.ingest(peer, pose_at(10), 5_000), IngestOutcome::Stale);
        assert_eq!(cache.sample(&peer).unwrap().received_at, 1_000);
    }

    #[test]
    fn test_listeners_see_only_accepted_poses() {
        let mut cache = PeerStateCache::new(10_000);
        let (log, listener) = recording_listener();
        cache.subscribe(listener);
        let peer = PeerId::from_seed(2);

        for ts in [5, 3, 9, 7] {
            cache.ingest(peer, pose_at(ts), 0);
        }

        let stamps: Vec<u64> = log
            .lock()
            .unwrap()
            .iter()
            .filter_map(|e| match e {
                PeerEvent::Pose { pose, .. } => Some(pose.sender_timestamp),
                _ => None,
            })
            .collect();
        assert_eq!(stamps, vec![5, 9]);
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let mut cache = PeerStateCache::new(10_000);
        let (log, listener) = recording_listener();
        let id = cache.subscribe(listener);

        assert!(cache.unsubscribe(id));
        assert!(!cache.unsubscribe(id));
        cache.ingest(PeerId::from_seed(1), pose_at(1), 0);
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn test_sweep_evicts_despite_online_metadata() {
        let mut cache = PeerStateCache::new(10_000);
        let (log, listener) = recording_listener();
        cache.subscribe(listener);
        let ghost = PeerId::from_seed(3);
        let live = PeerId::from_seed(4);

        cache.set_metadata(ghost, ParticipantMeta {
            name: "ghost".into(),
            color: "#fff".into(),
            online: true,
        });
        cache.ingest(ghost, pose_at(1), 1_000);
        cache.ingest(live, pose_at(1), 9_000);

        let evicted = cache.sweep(11_001);

        assert_eq!(evicted, vec![ghost]);
        assert!(cache.roster_entry(&ghost).is_none());
        assert!(cache.roster_entry(&live).is_some());
        assert!(log
            .lock()
            .unwrap()
            .contains(&PeerEvent::Departed { peer_id: ghost }));
    }

    #[test]
    fn test_sweep_keeps_peer_at_exact_threshold() {
        let mut cache = PeerStateCache::new(10_000);
        let peer = PeerId::from_seed(5);
        cache.ingest(peer, pose_at(1), 1_000);

        assert!(cache.sweep(11_000).is_empty());
        assert!(cache.contains(&peer));
    }

    #[test]
    fn test_metadata_removal_keeps_avatar() {
        let mut cache = PeerStateCache::new(10_000);
        let peer = PeerId::from_seed(6);
        let meta = ParticipantMeta {
            name: "ada".into(),
            color: "#0af".into(),
            online: true,
        };

        cache.set_metadata(peer, meta.clone());
        cache.ingest(peer, pose_at(1), 0);
        assert_eq!(cache.roster_entry(&peer).unwrap().meta, Some(meta));

        cache.remove_metadata(&peer);
        let entry = cache.roster_entry(&peer).unwrap();
        assert!(entry.meta.is_none());
        assert_eq!(entry.pose.sender_timestamp, 1);
    }

    #[test]
    fn test_metadata_alone_does_not_render() {
        let mut cache = PeerStateCache::new(10_000);
        let peer = PeerId::from_seed(7);
        cache.set_metadata(peer, ParticipantMeta {
            name: "lurker".into(),
            color: "#000".into(),
            online: true,
        });
        assert_eq!(cache.roster().count(), 0);
    }

    #[test]
    fn test_activity_is_independent_of_pose_order() {
        let mut cache = PeerStateCache::new(10_000);
        let peer = PeerId::from_seed(8);
        let target = uuid::Uuid::new_v4();

        cache.ingest(peer, pose_at(10), 0);
        cache.ingest_activity(
            ActivityState {
                peer_id: peer,
                is_active: true,
                target_id: Some(target),
            },
            0,
        );
        // A stale pose after the activity flag changes nothing
        cache.ingest(peer, pose_at(3), 0);

        let entry = cache.roster_entry(&peer).unwrap();
        assert_eq!(entry.pose.sender_timestamp, 10);
        assert_eq!(entry.activity.unwrap().target_id, Some(target));
    }

    #[test]
    fn test_sweep_drops_activity_without_pose() {
        let mut cache = PeerStateCache::new(10_000);
        let fresh = PeerId::from_seed(20);
        for seed in 100..200 {
            cache.ingest_activity(
                ActivityState {
                    peer_id: PeerId::from_seed(seed),
                    is_active: true,
                    target_id: None,
                },
                1_000,
            );
        }
        cache.ingest_activity(
            ActivityState {
                peer_id: fresh,
                is_active: false,
                target_id: None,
            },
            20_000,
        );

        assert!(cache.sweep(25_000).is_empty());
        assert!(cache.activity(&PeerId::from_seed(100)).is_none());
        assert!(cache.activity(&fresh).is_some());

        cache.sweep(1_000_000_000);
        assert!(cache.activity(&fresh).is_none());
    }

    #[test]
    fn test_activity_follows_pose_lifetime() {
        let mut cache = PeerStateCache::new(10_000);
        let peer = PeerId::from_seed(21);
        cache.ingest(peer, pose_at(1), 9_000);
        cache.ingest_activity(
            ActivityState {
                peer_id: peer,
                is_active: true,
                target_id: None,
            },
            1_000,
        );

        // Old flag survives while the pose is fresh
        cache.sweep(15_000);
        assert!(cache.activity(&peer).is_some());

        assert_eq!(cache.sweep(20_000), vec![peer]);
        assert!(cache.activity(&peer).is_none());
    }

    #[test]
    fn test_clear_publishes_departures() {
        let mut cache = PeerStateCache::new(10_000);
        let (log, listener) = recording_listener();
        cache.subscribe(listener);
        cache.ingest(PeerId::from_seed(1), pose_at(1), 0);
        cache.ingest(PeerId::from_seed(2), pose_at(1), 0);

        let cleared = cache.clear();
        assert_eq!(cleared.len(), 2);
        assert!(cache.is_empty());
        let departures = log
            .lock()
            .unwrap()
            .iter()
            .filter(|e| matches!(e, PeerEvent::Departed { .. }))
            .count();
        assert_eq!(departures, 2);
    }

    proptest! {
        #[test]
        fn prop_any_arrival_order_keeps_max(stamps in prop::collection::vec(1u64..1_000, 1..50)) {
            let mut cache = PeerStateCache::new(10_000);
            let peer = PeerId::from_seed(9);
            for ts in &stamps {
                cache.ingest(peer, pose_at(*ts), 0);
            }
            let max = *stamps.iter().max().unwrap();
            prop_assert_eq!(cache.sample(&peer).unwrap().sender_timestamp, max);
        }
    }
}
