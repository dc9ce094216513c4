//! The "SNAPSHOT" store - durable, low-frequency last-known poses.
//!
//! The broadcast channel is lossy and keeps no history. Snapshots let a late
//! joiner render everyone who is actually present, and survive relay restarts.
//! Snapshots older than the bootstrap window are treated as absent so that a
//! reconnecting client never renders ghosts of participants who left.

use crate::error::SyncError;
use crate::pose::Pose;
use serde::{Deserialize, Serialize};
use starfield_env::PeerId;
use std::collections::HashMap;
use std::path::Path;
use std::sync::RwLock;

/// One persisted row per participant.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotRecord {
    pub participant_id: PeerId,
    pub x: f64,
    pub y: f64,
    pub vx: f64,
    pub vy: f64,
    pub rotation: f64,
    pub thrusting: bool,
    /// Writer's wall clock (Unix ms)
    pub updated_at: u64,
}

impl SnapshotRecord {
    pub fn from_pose(participant_id: PeerId, pose: &Pose, updated_at: u64) -> Self {
        Self {
            participant_id,
            x: pose.x,
            y: pose.y,
            vx: pose.vx,
            vy: pose.vy,
            rotation: pose.rotation,
            thrusting: pose.thrusting,
            updated_at,
        }
    }

    /// The stored pose, stamped with `updated_at` so any live sample the
    /// owner sends afterwards supersedes it.
    pub fn pose(&self) -> Pose {
        Pose {
            x: self.x,
            y: self.y,
            vx: self.vx,
            vy: self.vy,
            rotation: self.rotation,
            thrusting: self.thrusting,
            boosting: false,
            sender_timestamp: self.updated_at,
        }
    }
}

/// Durable last-known pose storage.
///
/// Implementations must be thread-safe; several clients may share one store.
pub trait SnapshotStore: Send + Sync {
    /// Inserts or replaces the participant's row.
    fn upsert(&self, record: SnapshotRecord) -> Result<(), SyncError>;

    fn get(&self, participant_id: &PeerId) -> Result<Option<SnapshotRecord>, SyncError>;

    /// Last poses of `participants` written within `window_ms` of `now_ms`.
    ///
    /// Read failures for individual participants are logged and treated as
    /// absent; bootstrap is best-effort.
    fn load_initial(
        &self,
        participants: &[PeerId],
        now_ms: u64,
        window_ms: u64,
    ) -> HashMap<PeerId, Pose> {
        let mut poses = HashMap::new();
        for participant in participants {
            match self.get(participant) {
                Ok(Some(record)) if now_ms.saturating_sub(record.updated_at) <= window_ms => {
                    poses.insert(*participant, record.pose());
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(peer = %participant, error = %e, "snapshot read failed during bootstrap");
                }
            }
        }
        poses
    }
}

// ============================================================================
// IN-MEMORY STORE
// ============================================================================

/// Process-local store for tests and simulation.
#[derive(Debug, Default)]
pub struct MemorySnapshotStore {
    records: RwLock<HashMap<PeerId, SnapshotRecord>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.read().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SnapshotStore for MemorySnapshotStore {
    fn upsert(&self, record: SnapshotRecord) -> Result<(), SyncError> {
        let mut records = self
            .records
            .write()
            .map_err(|e| SyncError::storage("snapshot lock poisoned", e))?;
        records.insert(record.participant_id, record);
        Ok(())
    }

    fn get(&self, participant_id: &PeerId) -> Result<Option<SnapshotRecord>, SyncError> {
        let records = self
            .records
            .read()
            .map_err(|e| SyncError::storage("snapshot lock poisoned", e))?;
        Ok(records.get(participant_id).copied())
    }
}

// ============================================================================
// SLED STORE
// ============================================================================

/// Sled-backed snapshot store.
///
/// Uses an embedded key-value database for durability; rows are JSON
/// keyed by the participant UUID bytes.
pub struct SledSnapshotStore {
    tree: sled::Tree,
}

impl SledSnapshotStore {
    const TREE: &'static str = "snapshots";

    /// Open a persistent store at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, SyncError> {
        let db = sled::open(path).map_err(|e| SyncError::storage("Failed to open sled DB", e))?;
        Self::with_db(&db)
    }

    /// Use the `snapshots` tree of an already open database.
    pub fn with_db(db: &sled::Db) -> Result<Self, SyncError> {
        let tree = db
            .open_tree(Self::TREE)
            .map_err(|e| SyncError::storage("Failed to open snapshot tree", e))?;
        Ok(Self { tree })
    }

    /// Create a temporary store (for testing)
    #[cfg(test)]
    pub fn open_temp() -> Result<Self, SyncError> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .map_err(|e| SyncError::storage("Failed to open temp DB", e))?;
        Self::with_db(&db)
    }
}

impl SnapshotStore for SledSnapshotStore {
    fn upsert(&self, record: SnapshotRecord) -> Result<(), SyncError> {
        let value = serde_json::to_vec(&record).map_err(SyncError::serialization)?;
        self.tree
            .insert(record.participant_id.as_uuid().as_bytes(), value)
            .map_err(|e| SyncError::storage("Insert failed", e))?;
        self.tree
            .flush()
            .map_err(|e| SyncError::storage("Flush failed", e))?;
        Ok(())
    }

    fn get(&self, participant_id: &PeerId) -> Result<Option<SnapshotRecord>, SyncError> {
        let raw = self
            .tree
            .get(participant_id.as_uuid().as_bytes())
            .map_err(|e| SyncError::storage("Read failed", e))?;
        raw.map(|bytes| serde_json::from_slice(&bytes).map_err(SyncError::serialization))
            .transpose()
    }
}
