//! Configuration for the sync core.
//!
//! The placement half of this configuration must be identical on every
//! caller of the allocator (task creation, updates, bulk sync, webhooks),
//! otherwise two callers compute different layouts for the same zone. Load
//! it from one shared JSON file rather than building it in code.

use crate::error::SyncError;
use crate::zone::{ArcLayout, Coordinate, Layering, RingLayout, Zone, ZoneKey, ZoneRegistry};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Timing parameters for pose broadcast and peer tracking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SyncConfig {
    /// Minimum gap between accepted broadcasts (default: 16ms ~ 60 Hz)
    pub broadcast_interval_ms: u64,

    /// Speed at or below which the avatar counts as idle
    pub speed_epsilon: f64,

    /// Heading change (radians) at or below which rotation is ignored
    pub rotation_epsilon: f64,

    /// Position change at or below which movement is ignored
    pub position_epsilon: f64,

    /// Re-send an unchanged idle pose this often so peers keep us (default: 3s)
    pub idle_keepalive_ms: u64,

    /// Snapshot writeback cadence (default: 3s)
    pub snapshot_interval_ms: u64,

    /// Staleness sweep cadence (default: 5s)
    pub sweep_interval_ms: u64,

    /// Age after which a silent peer is evicted (default: 10s)
    pub staleness_threshold_ms: u64,

    /// Max snapshot age accepted when bootstrapping (default: 10s)
    pub bootstrap_window_ms: u64,

    /// Fixed delay between reconnect attempts (default: 2s)
    pub reconnect_backoff_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            broadcast_interval_ms: 16,
            speed_epsilon: 0.05,
            rotation_epsilon: 0.001,
            position_epsilon: 0.01,
            idle_keepalive_ms: 3_000,
            snapshot_interval_ms: 3_000,
            sweep_interval_ms: 5_000,
            staleness_threshold_ms: 10_000,
            bootstrap_window_ms: 10_000,
            reconnect_backoff_ms: 2_000,
        }
    }
}

/// Participant zone entry as it appears in the config file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ZoneSpec {
    pub key: ZoneKey,
    pub anchor: Coordinate,
    #[serde(default)]
    pub layout: Option<RingLayout>,
}

/// The shared zone for unassigned objects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DefaultZoneSpec {
    pub anchor: Coordinate,
    pub layout: ArcLayout,
    pub obstacles: Vec<Coordinate>,
}

impl Default for DefaultZoneSpec {
    fn default() -> Self {
        Self {
            anchor: Coordinate::new(0.0, 0.0),
            layout: ArcLayout::default(),
            // The central landmark sits on the first arc
            obstacles: vec![Coordinate::new(0.0, 640.0)],
        }
    }
}

/// Allocator and zone parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PlacementConfig {
    /// Visual radius of one placed object
    pub object_radius: f64,

    /// Minimum centre distance as a multiple of `object_radius` (default: 3)
    pub min_distance_factor: f64,

    /// Candidate slots tried before the extended search (default: 200)
    pub max_attempts: usize,

    /// Extra rings/arcs tried after `max_attempts` (default: 20)
    pub extended_layers: usize,

    /// Last-resort coordinate, far outside every zone
    pub fallback: Coordinate,

    /// Ring layout used for participant zones without their own
    pub default_ring: RingLayout,

    pub zones: Vec<ZoneSpec>,

    pub default_zone: DefaultZoneSpec,
}

impl Default for PlacementConfig {
    fn default() -> Self {
        Self {
            object_radius: 40.0,
            min_distance_factor: 3.0,
            max_attempts: 200,
            extended_layers: 20,
            fallback: Coordinate::new(100_000.0, 100_000.0),
            default_ring: RingLayout::default(),
            zones: Vec::new(),
            default_zone: DefaultZoneSpec::default(),
        }
    }
}

impl PlacementConfig {
    /// `MIN_DISTANCE`: required centre-to-centre gap.
    pub fn min_distance(&self) -> f64 {
        self.object_radius * self.min_distance_factor
    }

    /// Builds the zone registry described by this config.
    pub fn registry(&self) -> ZoneRegistry {
        let default = &self.default_zone;
        let mut registry = ZoneRegistry::new(Zone::unassigned(
            default.anchor,
            default.layout.clone(),
            default.obstacles.clone(),
        ));

        for spec in &self.zones {
            let layout = spec.layout.clone().unwrap_or_else(|| self.default_ring.clone());
            registry.register(Zone::ring(spec.key, spec.anchor, layout));
        }

        registry
    }

    fn validate(&self) -> Result<(), SyncError> {
        if !(self.object_radius > 0.0) || !(self.min_distance_factor > 0.0) {
            return Err(SyncError::Config("object radius and min distance factor must be positive".into()));
        }
        if self.max_attempts == 0 {
            return Err(SyncError::Config("maxAttempts must be at least 1".into()));
        }

        let rings = std::iter::once(&self.default_ring)
            .chain(self.zones.iter().filter_map(|z| z.layout.as_ref()));
        for ring in rings {
            validate_layering(&Layering::Ring(ring.clone()))?;
        }
        validate_layering(&Layering::Arc(self.default_zone.layout.clone()))?;

        Ok(())
    }
}

fn validate_layering(layering: &Layering) -> Result<(), SyncError> {
    match layering {
        Layering::Ring(ring) => {
            if ring.slots_per_ring == 0 || !(ring.base_radius > 0.0) || ring.ring_spacing < 0.0 {
                return Err(SyncError::Config(format!("invalid ring layout: {:?}", ring)));
            }
        }
        Layering::Arc(arc) => {
            if arc.slots_per_arc == 0 || !(arc.base_distance > 0.0) || arc.arc_spacing < 0.0 {
                return Err(SyncError::Config(format!("invalid arc layout: {:?}", arc)));
            }
        }
    }
    Ok(())
}

/// Complete configuration for a Starfield deployment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct WorldConfig {
    pub sync: SyncConfig,
    pub placement: PlacementConfig,
}

impl WorldConfig {
    /// Parses and validates a JSON config. Missing fields take defaults.
    pub fn from_json_str(json: &str) -> Result<Self, SyncError> {
        let config: WorldConfig = serde_json::from_str(json)
            .map_err(|e| SyncError::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a JSON config file.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self, SyncError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| SyncError::Config(format!("Failed to read {}: {}", path.display(), e)))?;
        Self::from_json_str(&raw)
    }

    pub fn validate(&self) -> Result<(), SyncError> {
        if self.sync.broadcast_interval_ms == 0 || self.sync.sweep_interval_ms == 0 {
            return Err(SyncError::Config("broadcast and sweep intervals must be non-zero".into()));
        }
        if self.sync.idle_keepalive_ms >= self.sync.staleness_threshold_ms {
            return Err(SyncError::Config(
                "idleKeepaliveMs must be shorter than stalenessThresholdMs".into(),
            ));
        }
        self.placement.validate()
    }
}
