//! Optimistic placement with best-effort repair.
//!
//! There is no cross-process lock around allocation. Two writers that read
//! the same occupied set compute the same slot; whichever verifies second
//! sees the overlap and moves. Anything the post-write check misses is
//! erased by [`PlacementReconciler::reposition_all`].

use crate::allocator::SpatialAllocator;
use crate::error::SyncError;
use crate::object_store::{ObjectStore, SpatialObject};
use crate::zone::{Coordinate, ZoneKey};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

/// A work item that needs a coordinate.
#[derive(Debug, Clone, PartialEq)]
pub struct PlacementRequest {
    pub id: Uuid,
    pub zone_key: ZoneKey,
    pub completed: bool,
    pub sort_key: String,
}

impl PlacementRequest {
    pub fn new(id: Uuid, zone_key: ZoneKey, sort_key: impl Into<String>) -> Self {
        Self {
            id,
            zone_key,
            completed: false,
            sort_key: sort_key.into(),
        }
    }

    pub fn completed(mut self, completed: bool) -> Self {
        self.completed = completed;
        self
    }
}

/// Outcome of a post-write check.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PlacementCheck {
    /// No overlap with nearby objects
    Clear,
    /// Overlap found; the object was moved here
    Repaired(Coordinate),
    /// The check itself failed and was abandoned
    Skipped,
}

/// Two objects closer than `MIN_DISTANCE`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Overlap {
    pub first: Uuid,
    pub second: Uuid,
    pub distance: f64,
}

/// Summary of one reposition pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepositionSummary {
    pub zones: usize,
    pub objects: usize,
    pub moved: usize,
}

/// Places, moves and audits spatial objects against a shared store.
pub struct PlacementReconciler {
    allocator: SpatialAllocator,
    store: Arc<dyn ObjectStore>,
    object_radius: f64,
}

impl PlacementReconciler {
    pub fn new(allocator: SpatialAllocator, store: Arc<dyn ObjectStore>, object_radius: f64) -> Self {
        Self {
            allocator,
            store,
            object_radius,
        }
    }

    pub fn allocator(&self) -> &SpatialAllocator {
        &self.allocator
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    /// Allocates and durably writes a new object, then verifies it.
    pub fn place(&self, request: PlacementRequest) -> Result<SpatialObject, SyncError> {
        let planned = self.plan(request)?;
        self.commit(planned)
    }

    /// Reads the occupied set and computes a coordinate without writing.
    pub fn plan(&self, request: PlacementRequest) -> Result<SpatialObject, SyncError> {
        let occupied = self.occupied(&request.zone_key, None)?;
        let coordinate = self.allocator.allocate(&request.zone_key, &occupied);

        Ok(SpatialObject {
            id: request.id,
            zone_key: request.zone_key,
            x: coordinate.x,
            y: coordinate.y,
            occupied_radius: self.object_radius,
            completed: request.completed,
            sort_key: request.sort_key,
        })
    }

    /// Writes a planned object and runs the post-write check.
    ///
    /// Write failures are returned; check failures are only logged.
    pub fn commit(&self, mut object: SpatialObject) -> Result<SpatialObject, SyncError> {
        self.store.insert(object.clone())?;

        if let PlacementCheck::Repaired(coordinate) = self.verify_placement(&object.id) {
            object.set_coordinate(coordinate);
        }
        Ok(object)
    }

    /// Moves an object into a new zone.
    pub fn reassign(&self, id: &Uuid, zone_key: ZoneKey) -> Result<SpatialObject, SyncError> {
        let mut object = self.store.get(id)?.ok_or(SyncError::UnknownObject(*id))?;

        let occupied = self.occupied(&zone_key, Some(id))?;
        object.zone_key = zone_key;
        object.set_coordinate(self.allocator.allocate(&zone_key, &occupied));
        self.store.insert(object.clone())?;

        tracing::debug!(object = %id, zone = %zone_key, x = object.x, y = object.y, "object reassigned");

        if let PlacementCheck::Repaired(coordinate) = self.verify_placement(id) {
            object.set_coordinate(coordinate);
        }
        Ok(object)
    }

    /// Deletes an object whose work item was removed.
    pub fn remove(&self, id: &Uuid) -> Result<Option<SpatialObject>, SyncError> {
        self.store.remove(id)
    }

    /// Post-write check. Never fails; errors are logged and reported as
    /// [`PlacementCheck::Skipped`].
    pub fn verify_placement(&self, id: &Uuid) -> PlacementCheck {
        match self.try_verify(id) {
            Ok(check) => check,
            Err(e) => {
                tracing::warn!(object = %id, error = %e, "post-write placement check failed");
                PlacementCheck::Skipped
            }
        }
    }

    fn try_verify(&self, id: &Uuid) -> Result<PlacementCheck, SyncError> {
        let object = self.store.get(id)?.ok_or(SyncError::UnknownObject(*id))?;
        let min_distance = self.allocator.min_distance();
        let center = object.coordinate();

        let nearby = self.store.query_box(center, min_distance)?;
        let conflict = nearby
            .iter()
            .any(|other| other.id != *id && other.coordinate().distance(&center) < min_distance);
        if !conflict {
            return Ok(PlacementCheck::Clear);
        }

        // Fresh obstacle set: everything now in the zone plus any neighbour
        // from another zone that crowds this spot.
        let mut obstacles = self.occupied(&object.zone_key, Some(id))?;
        obstacles.extend(
            nearby
                .iter()
                .filter(|other| other.id != *id)
                .map(SpatialObject::coordinate),
        );

        let repaired = self.allocator.allocate(&object.zone_key, &obstacles);
        self.store.update_position(id, repaired)?;

        tracing::info!(
            object = %id,
            from_x = center.x,
            from_y = center.y,
            to_x = repaired.x,
            to_y = repaired.y,
            "repaired concurrent placement overlap"
        );
        Ok(PlacementCheck::Repaired(repaired))
    }

    /// Re-lays-out every zone from scratch.
    ///
    /// Zones are processed in key order and objects within a zone by
    /// (completed, sort key, id). Each coordinate depends only on the ones
    /// assigned before it in the pass, so a second run on unchanged input
    /// writes nothing.
    pub fn reposition_all(&self) -> Result<RepositionSummary, SyncError> {
        let mut groups: BTreeMap<ZoneKey, Vec<SpatialObject>> = BTreeMap::new();
        for object in self.store.all()? {
            let zone_key = self.allocator.registry().resolve(&object.zone_key).key;
            groups.entry(zone_key).or_default().push(object);
        }

        let mut summary = RepositionSummary {
            zones: groups.len(),
            ..RepositionSummary::default()
        };
        let mut assigned: Vec<Coordinate> = Vec::new();

        for (zone_key, mut objects) in groups {
            objects.sort_by(|a, b| {
                a.completed
                    .cmp(&b.completed)
                    .then_with(|| a.sort_key.cmp(&b.sort_key))
                    .then_with(|| a.id.cmp(&b.id))
            });

            for object in objects {
                let coordinate = self.allocator.allocate(&zone_key, &assigned);
                assigned.push(coordinate);
                summary.objects += 1;

                if object.coordinate() != coordinate {
                    self.store.update_position(&object.id, coordinate)?;
                    summary.moved += 1;
                }
            }
        }

        tracing::info!(
            zones = summary.zones,
            objects = summary.objects,
            moved = summary.moved,
            "reposition pass complete"
        );
        Ok(summary)
    }

    /// Every pair of stored objects closer than `MIN_DISTANCE`.
    pub fn overlap_report(&self) -> Result<Vec<Overlap>, SyncError> {
        let objects = self.store.all()?;
        let min_distance = self.allocator.min_distance();

        let mut overlaps = Vec::new();
        for (i, a) in objects.iter().enumerate() {
            for b in &objects[i + 1..] {
                let distance = a.coordinate().distance(&b.coordinate());
                if distance < min_distance {
                    overlaps.push(Overlap {
                        first: a.id,
                        second: b.id,
                        distance,
                    });
                }
            }
        }
        Ok(overlaps)
    }

    /// Coordinates of objects that live in the same resolved zone as `zone_key`.
    fn occupied(&self, zone_key: &ZoneKey, exclude: Option<&Uuid>) -> Result<Vec<Coordinate>, SyncError> {
        let registry = self.allocator.registry();
        let target = registry.resolve(zone_key).key;

        Ok(self
            .store
            .all()?
            .into_iter()
            .filter(|o| Some(&o.id) != exclude)
            .filter(|o| registry.resolve(&o.zone_key).key == target)
            .map(|o| o.coordinate())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PlacementConfig;
    use crate::object_store::MemoryObjectStore;
    use crate::zone::{RingLayout, Zone};
    use starfield_env::PeerId;

    fn setup() -> (PlacementReconciler, Arc<MemoryObjectStore>, ZoneKey) {
        let config = PlacementConfig::default();
        let owner = ZoneKey::Participant(PeerId::from_seed(1));
        let mut registry = config.registry();
        registry.register(Zone::ring(owner, Coordinate::new(5000.0, 5000.0), RingLayout::default()));

        let store = Arc::new(MemoryObjectStore::new());
        let reconciler = PlacementReconciler::new(
            SpatialAllocator::new(registry, &config),
            store.clone(),
            config.object_radius,
        );
        (reconciler, store, owner)
    }

    fn request(n: u128, key: ZoneKey) -> PlacementRequest {
        PlacementRequest::new(Uuid::from_u128(n), key, format!("{:03}", n))
    }

    #[test]
    fn test_sequential_placement_is_clear() {
        let (reconciler, _, owner) = setup();
        for n in 1..=30 {
            reconciler.place(request(n, owner)).unwrap();
        }
        assert!(reconciler.overlap_report().unwrap().is_empty());
    }

    #[test]
    fn test_first_placement_uses_first_ring_slot() {
        let (reconciler, _, owner) = setup();
        let placed = reconciler.place(request(1, owner)).unwrap();
        assert_eq!(placed.coordinate(), Coordinate::new(5380.0, 5000.0));
        assert_eq!(placed.occupied_radius, 40.0);
    }

    #[test]
    fn test_concurrent_writers_are_repaired() {
        let (reconciler, store, owner) = setup();

        // Both writers read the same (empty) occupied set
        let a = reconciler.plan(request(1, owner)).unwrap();
        let b = reconciler.plan(request(2, owner)).unwrap();
        assert_eq!(a.coordinate(), b.coordinate());

        let a = reconciler.commit(a).unwrap();
        let b = reconciler.commit(b).unwrap();

        assert_ne!(a.coordinate(), b.coordinate());
        assert!(a.coordinate().distance(&b.coordinate()) >= reconciler.allocator().min_distance());
        assert_eq!(store.get(&b.id).unwrap().unwrap().coordinate(), b.coordinate());
        assert!(reconciler.overlap_report().unwrap().is_empty());
    }

    #[test]
    fn test_reposition_is_idempotent() {
        let (reconciler, store, owner) = setup();

        // Pile everything onto one point
        for n in 1..=12 {
            let key = if n % 3 == 0 { ZoneKey::Unassigned } else { owner };
            let mut obj = reconciler.plan(request(n, key).completed(n % 4 == 0)).unwrap();
            obj.set_coordinate(Coordinate::new(0.0, 0.0));
            store.insert(obj).unwrap();
        }
        assert!(!reconciler.overlap_report().unwrap().is_empty());

        let first = reconciler.reposition_all().unwrap();
        assert_eq!(first.objects, 12);
        assert_eq!(first.zones, 2);
        let after_first = store.all().unwrap();
        assert!(reconciler.overlap_report().unwrap().is_empty());

        let second = reconciler.reposition_all().unwrap();
        assert_eq!(second.moved, 0);
        assert_eq!(store.all().unwrap(), after_first);
    }

    #[test]
    fn test_reposition_orders_open_items_first() {
        let (reconciler, store, owner) = setup();
        store.insert(reconciler.plan(request(1, owner).completed(true)).unwrap()).unwrap();
        store.insert(reconciler.plan(request(2, owner)).unwrap()).unwrap();

        reconciler.reposition_all().unwrap();

        let open = store.get(&Uuid::from_u128(2)).unwrap().unwrap();
        assert_eq!(open.coordinate(), Coordinate::new(5380.0, 5000.0));
    }

    #[test]
    fn test_reassign_moves_into_new_zone() {
        let (reconciler, _, owner) = setup();
        let placed = reconciler.place(request(1, ZoneKey::Unassigned)).unwrap();
        assert!(placed.coordinate().distance(&Coordinate::new(5000.0, 5000.0)) > 1000.0);

        let moved = reconciler.reassign(&placed.id, owner).unwrap();
        assert_eq!(moved.zone_key, owner);
        assert_eq!(moved.coordinate(), Coordinate::new(5380.0, 5000.0));
    }

    #[test]
    fn test_reassign_unknown_object() {
        let (reconciler, _, owner) = setup();
        let err = reconciler.reassign(&Uuid::from_u128(77), owner).unwrap_err();
        assert!(matches!(err, SyncError::UnknownObject(_)));
    }

    #[test]
    fn test_remove_only_deletes_on_request() {
        let (reconciler, store, owner) = setup();
        let placed = reconciler.place(request(1, owner)).unwrap();
        reconciler.reposition_all().unwrap();
        assert_eq!(store.len(), 1);

        assert!(reconciler.remove(&placed.id).unwrap().is_some());
        assert!(store.is_empty());
    }

    /// Store whose reads fail after `healthy_reads` successful ones.
    struct FlakyStore {
        inner: MemoryObjectStore,
        healthy_reads: std::sync::atomic::AtomicUsize,
        fail_inserts: bool,
    }

    impl FlakyStore {
        fn new(healthy_reads: usize, fail_inserts: bool) -> Self {
            Self {
                inner: MemoryObjectStore::new(),
                healthy_reads: std::sync::atomic::AtomicUsize::new(healthy_reads),
                fail_inserts,
            }
        }
    }

    impl ObjectStore for FlakyStore {
        fn insert(&self, object: SpatialObject) -> Result<(), SyncError> {
            if self.fail_inserts {
                return Err(SyncError::Storage("disk full".into()));
            }
            self.inner.insert(object)
        }

        fn get(&self, id: &Uuid) -> Result<Option<SpatialObject>, SyncError> {
            self.inner.get(id)
        }

        fn remove(&self, id: &Uuid) -> Result<Option<SpatialObject>, SyncError> {
            self.inner.remove(id)
        }

        fn all(&self) -> Result<Vec<SpatialObject>, SyncError> {
            use std::sync::atomic::Ordering;
            let left = self.healthy_reads.load(Ordering::SeqCst);
            if left == 0 {
                return Err(SyncError::Storage("replica unavailable".into()));
            }
            self.healthy_reads.store(left - 1, Ordering::SeqCst);
            self.inner.all()
        }
    }

    #[test]
    fn test_check_failure_is_swallowed() {
        let config = PlacementConfig::default();
        // One read for the occupied set, then the check's box query fails
        let store = Arc::new(FlakyStore::new(1, false));
        let reconciler = PlacementReconciler::new(
            SpatialAllocator::from_config(&config),
            store.clone(),
            config.object_radius,
        );

        let placed = reconciler.place(request(1, ZoneKey::Unassigned)).unwrap();
        assert!(store.inner.get(&placed.id).unwrap().is_some());
        assert_eq!(reconciler.verify_placement(&placed.id), PlacementCheck::Skipped);
    }

    #[test]
    fn test_write_failure_is_surfaced() {
        let config = PlacementConfig::default();
        let reconciler = PlacementReconciler::new(
            SpatialAllocator::from_config(&config),
            Arc::new(FlakyStore::new(usize::MAX, true)),
            config.object_radius,
        );

        let err = reconciler.place(request(1, ZoneKey::Unassigned)).unwrap_err();
        assert!(matches!(err, SyncError::Storage(_)));
    }
}
