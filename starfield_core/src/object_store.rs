//! Persisted spatial objects ("planets").
//!
//! The core never creates or deletes objects on its own initiative: the
//! external workflow does, through [`crate::reconciler::PlacementReconciler`].
//! Stores only have to make an insert visible to the next query from any
//! caller, which the sled store guarantees by flushing on every write.

use crate::error::SyncError;
use crate::zone::{Coordinate, ZoneKey};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::RwLock;
use uuid::Uuid;

/// One placed work item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpatialObject {
    pub id: Uuid,
    pub zone_key: ZoneKey,
    pub x: f64,
    pub y: f64,
    pub occupied_radius: f64,
    pub completed: bool,
    /// Stable ordering key supplied by the external workflow (e.g. creation time)
    pub sort_key: String,
}

impl SpatialObject {
    pub fn coordinate(&self) -> Coordinate {
        Coordinate::new(self.x, self.y)
    }

    pub fn set_coordinate(&mut self, coordinate: Coordinate) {
        self.x = coordinate.x;
        self.y = coordinate.y;
    }

    /// True when the object's centre lies in the axis-aligned box.
    pub fn within_box(&self, center: &Coordinate, half_extent: f64) -> bool {
        (self.x - center.x).abs() <= half_extent && (self.y - center.y).abs() <= half_extent
    }
}

/// Durable storage for spatial objects.
///
/// Listing methods return objects ordered by id.
pub trait ObjectStore: Send + Sync {
    /// Inserts or replaces the object with the same id.
    fn insert(&self, object: SpatialObject) -> Result<(), SyncError>;

    fn get(&self, id: &Uuid) -> Result<Option<SpatialObject>, SyncError>;

    /// Removes the object, returning it if it existed.
    fn remove(&self, id: &Uuid) -> Result<Option<SpatialObject>, SyncError>;

    fn all(&self) -> Result<Vec<SpatialObject>, SyncError>;

    /// Overwrites only the coordinate of an existing object.
    fn update_position(&self, id: &Uuid, coordinate: Coordinate) -> Result<(), SyncError> {
        let mut object = self.get(id)?.ok_or(SyncError::UnknownObject(*id))?;
        object.set_coordinate(coordinate);
        self.insert(object)
    }

    /// Objects whose centre lies within `half_extent` of `center` on both axes.
    fn query_box(&self, center: Coordinate, half_extent: f64) -> Result<Vec<SpatialObject>, SyncError> {
        Ok(self
            .all()?
            .into_iter()
            .filter(|o| o.within_box(&center, half_extent))
            .collect())
    }

    /// Objects stored under exactly `key` (no default-zone resolution).
    fn in_zone(&self, key: &ZoneKey) -> Result<Vec<SpatialObject>, SyncError> {
        Ok(self.all()?.into_iter().filter(|o| o.zone_key == *key).collect())
    }
}

// ============================================================================
// IN-MEMORY STORE
// ============================================================================

#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    objects: RwLock<BTreeMap<Uuid, SpatialObject>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.objects.read().map(|o| o.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ObjectStore for MemoryObjectStore {
    fn insert(&self, object: SpatialObject) -> Result<(), SyncError> {
        let mut objects = self
            .objects
            .write()
            .map_err(|e| SyncError::storage("object lock poisoned", e))?;
        objects.insert(object.id, object);
        Ok(())
    }

    fn get(&self, id: &Uuid) -> Result<Option<SpatialObject>, SyncError> {
        let objects = self
            .objects
            .read()
            .map_err(|e| SyncError::storage("object lock poisoned", e))?;
        Ok(objects.get(id).cloned())
    }

    fn remove(&self, id: &Uuid) -> Result<Option<SpatialObject>, SyncError> {
        let mut objects = self
            .objects
            .write()
            .map_err(|e| SyncError::storage("object lock poisoned", e))?;
        Ok(objects.remove(id))
    }

    fn all(&self) -> Result<Vec<SpatialObject>, SyncError> {
        let objects = self
            .objects
            .read()
            .map_err(|e| SyncError::storage("object lock poisoned", e))?;
        Ok(objects.values().cloned().collect())
    }
}

// ============================================================================
// SLED STORE
// ============================================================================

/// Sled-backed object store. Keys are the 16 UUID bytes, so iteration
/// order matches `Uuid` ordering.
pub struct SledObjectStore {
    tree: sled::Tree,
}

impl SledObjectStore {
    const TREE: &'static str = "objects";

    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, SyncError> {
        let db = sled::open(path).map_err(|e| SyncError::storage("Failed to open sled DB", e))?;
        Self::with_db(&db)
    }

    pub fn with_db(db: &sled::Db) -> Result<Self, SyncError> {
        let tree = db
            .open_tree(Self::TREE)
            .map_err(|e| SyncError::storage("Failed to open object tree", e))?;
        Ok(Self { tree })
    }

    #[cfg(test)]
    pub fn open_temp() -> Result<Self, SyncError> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .map_err(|e| SyncError::storage("Failed to open temp DB", e))?;
        Self::with_db(&db)
    }

    fn decode(bytes: &[u8]) -> Result<SpatialObject, SyncError> {
        serde_json::from_slice(bytes).map_err(SyncError::serialization)
    }
}

impl ObjectStore for SledObjectStore {
    fn insert(&self, object: SpatialObject) -> Result<(), SyncError> {
        let value = serde_json::to_vec(&object).map_err(SyncError::serialization)?;
        self.tree
            .insert(object.id.as_bytes(), value)
            .map_err(|e| SyncError::storage("Insert failed", e))?;
        // The post-write check must observe this insert
        self.tree
            .flush()
            .map_err(|e| SyncError::storage("Flush failed", e))?;
        Ok(())
    }

    fn get(&self, id: &Uuid) -> Result<Option<SpatialObject>, SyncError> {
        let raw = self
            .tree
            .get(id.as_bytes())
            .map_err(|e| SyncError::storage("Read failed", e))?;
        raw.map(|bytes| Self::decode(&bytes)).transpose()
    }

    fn remove(&self, id: &Uuid) -> Result<Option<SpatialObject>, SyncError> {
        let raw = self
            .tree
            .remove(id.as_bytes())
            .map_err(|e| SyncError::storage("Remove failed", e))?;
        self.tree
            .flush()
            .map_err(|e| SyncError::storage("Flush failed", e))?;
        raw.map(|bytes| Self::decode(&bytes)).transpose()
    }

    fn all(&self) -> Result<Vec<SpatialObject>, SyncError> {
        self.tree
            .iter()
            .values()
            .map(|value| {
                let bytes = value.map_err(|e| SyncError::storage("Scan failed", e))?;
                Self::decode(&bytes)
            })
            .collect()
    }
}
