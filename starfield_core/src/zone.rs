//! The "ZONE" registry - assignment keys, anchors and layering policies.
//!
//! Every participant owns a zone laid out in concentric rings around their
//! anchor. Unassigned objects share one default zone laid out in staggered
//! arcs, which also carries fixed landmark obstacles.

use nalgebra::Vector2;
use serde::{Deserialize, Serialize};
use starfield_env::PeerId;
use std::collections::HashMap;
use std::f64::consts::PI;

// ============================================================================
// COORDINATES & KEYS
// ============================================================================

/// A world-space point.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub x: f64,
    pub y: f64,
}

impl Coordinate {
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    #[inline]
    pub fn to_vector(self) -> Vector2<f64> {
        Vector2::new(self.x, self.y)
    }

    #[inline]
    pub fn distance(&self, other: &Coordinate) -> f64 {
        (self.to_vector() - other.to_vector()).norm()
    }

    /// Point at `radius` and `angle` (radians) from `self`.
    #[inline]
    pub fn polar_offset(&self, radius: f64, angle: f64) -> Coordinate {
        Coordinate::new(self.x + radius * angle.cos(), self.y + radius * angle.sin())
    }
}

/// Assignment key selecting a zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind", content = "peer")]
pub enum ZoneKey {
    /// Objects owned by one participant
    Participant(PeerId),
    /// Objects nobody has picked up yet
    Unassigned,
}

impl std::fmt::Display for ZoneKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ZoneKey::Participant(peer) => write!(f, "participant:{}", peer),
            ZoneKey::Unassigned => write!(f, "unassigned"),
        }
    }
}

// ============================================================================
// LAYERING POLICIES
// ============================================================================

/// Concentric rings around the anchor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RingLayout {
    pub base_radius: f64,
    pub ring_spacing: f64,
    pub slots_per_ring: usize,
    /// Angle between neighbouring slots of one ring (radians)
    pub angle_step: f64,
    /// Extra rotation applied per ring so slots don't line up radially
    pub ring_offset: f64,
}

impl Default for RingLayout {
    fn default() -> Self {
        Self {
            base_radius: 380.0,
            ring_spacing: 100.0,
            slots_per_ring: 9,
            angle_step: 0.7,
            ring_offset: 0.35,
        }
    }
}

/// Staggered arcs fanning out from the anchor along a heading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArcLayout {
    pub base_distance: f64,
    pub arc_spacing: f64,
    pub slots_per_arc: usize,
    /// Total angle covered by one arc (radians)
    pub angular_span: f64,
    /// Direction the arcs are centred on (radians)
    pub base_heading: f64,
    /// Max radial perturbation either side (world units)
    pub radius_jitter: f64,
    /// Max angular perturbation either side (radians)
    pub angle_jitter: f64,
}

impl Default for ArcLayout {
    fn default() -> Self {
        Self {
            base_distance: 600.0,
            arc_spacing: 140.0,
            slots_per_arc: 7,
            angular_span: 2.0,
            base_heading: PI / 2.0,
            radius_jitter: 15.0,
            angle_jitter: 0.03,
        }
    }
}

/// How candidate slots are enumerated inside a zone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "policy")]
pub enum Layering {
    Ring(RingLayout),
    Arc(ArcLayout),
}

impl Layering {
    /// Slots per ring or arc.
    pub fn slots_per_layer(&self) -> usize {
        match self {
            Layering::Ring(ring) => ring.slots_per_ring,
            Layering::Arc(arc) => arc.slots_per_arc,
        }
    }
}

// ============================================================================
// ZONES
// ============================================================================

/// A named anchor plus layering policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Zone {
    pub key: ZoneKey,
    pub anchor: Coordinate,
    pub layering: Layering,
    /// Always-excluded coordinates (landmarks); only the default zone has any
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub obstacles: Vec<Coordinate>,
}

impl Zone {
    pub fn ring(key: ZoneKey, anchor: Coordinate, layout: RingLayout) -> Self {
        Self {
            key,
            anchor,
            layering: Layering::Ring(layout),
            obstacles: Vec::new(),
        }
    }

    /// The shared zone for unassigned objects.
    pub fn unassigned(anchor: Coordinate, layout: ArcLayout, obstacles: Vec<Coordinate>) -> Self {
        Self {
            key: ZoneKey::Unassigned,
            anchor,
            layering: Layering::Arc(layout),
            obstacles,
        }
    }
}

/// Static mapping from assignment keys to zones, with one default zone.
#[derive(Debug, Clone)]
pub struct ZoneRegistry {
    zones: HashMap<ZoneKey, Zone>,
    default_zone: Zone,
}

impl ZoneRegistry {
    /// Builds a registry around the given default zone.
    pub fn new(default_zone: Zone) -> Self {
        Self {
            zones: HashMap::new(),
            default_zone,
        }
    }

    /// Registers (or replaces) a participant zone.
    ///
    /// A zone keyed `Unassigned` replaces the default zone.
    pub fn register(&mut self, zone: Zone) {
        match zone.key {
            ZoneKey::Unassigned => self.default_zone = zone,
            key => {
                self.zones.insert(key, zone);
            }
        }
    }

    /// Resolves a key, falling back to the default zone for unknown keys.
    pub fn resolve(&self, key: &ZoneKey) -> &Zone {
        self.zones.get(key).unwrap_or(&self.default_zone)
    }

    pub fn is_known(&self, key: &ZoneKey) -> bool {
        matches!(key, ZoneKey::Unassigned) || self.zones.contains_key(key)
    }

    pub fn default_zone(&self) -> &Zone {
        &self.default_zone
    }

    /// All zones including the default, in key order.
    pub fn zones(&self) -> Vec<&Zone> {
        let mut all: Vec<&Zone> = self.zones.values().collect();
        all.push(&self.default_zone);
        all.sort_by_key(|z| z.key);
        all
    }

    /// Registered zones, counting the default zone.
    pub fn zone_count(&self) -> usize {
        self.zones.len() + 1
    }
}

impl Default for ZoneRegistry {
    fn default() -> Self {
        Self::new(Zone::unassigned(
            Coordinate::new(0.0, 0.0),
            ArcLayout::default(),
            Vec::new(),
        ))
    }
}
