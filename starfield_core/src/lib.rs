//! Starfield Core - world-state synchronization for a shared 2D space
//!
//! This library keeps two kinds of shared state consistent without a central
//! simulation authority:
//! 1. **Avatars**: every client broadcasts its own pose; peers keep only the
//!    sample with the highest sender timestamp, so delivery order never matters.
//! 2. **Objects**: work items are placed by a pure, configuration-driven
//!    allocator; optimistic writers repair collisions after the fact.
//!
//! The environment (clock, transport) is injected through `starfield_env`,
//! so the same code runs under tokio and under the deterministic simulator.

pub mod allocator;
pub mod broadcaster;
pub mod config;
pub mod error;
pub mod object_store;
pub mod peer_cache;
pub mod pose;
pub mod reconciler;
pub mod session;
pub mod snapshot;
pub mod wire;
pub mod zone;

// Re-export key types for convenience
pub use allocator::{Allocation, SlotSource, SpatialAllocator};
pub use broadcaster::{BroadcastDecision, BroadcastGate, BroadcastStats, PoseBroadcaster};
pub use config::{PlacementConfig, SyncConfig, WorldConfig};
pub use error::SyncError;
pub use object_store::{MemoryObjectStore, ObjectStore, SledObjectStore, SpatialObject};
pub use peer_cache::{
    IngestOutcome, ParticipantMeta, PeerEvent, PeerEventListener, PeerStateCache, RosterEntry,
    SubscriptionId,
};
pub use pose::{PeerSample, Pose};
pub use reconciler::{Overlap, PlacementCheck, PlacementReconciler, PlacementRequest, RepositionSummary};
pub use session::{Handled, SessionState, SessionStats, SyncSession};
pub use snapshot::{MemorySnapshotStore, SledSnapshotStore, SnapshotRecord, SnapshotStore};
pub use wire::{ActivityState, JoinMessage, PoseMessage, TransportMessage};
pub use zone::{ArcLayout, Coordinate, Layering, RingLayout, Zone, ZoneKey, ZoneRegistry};
