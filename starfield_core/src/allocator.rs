//! The "SPACE" allocator - deterministic, collision-free object placement.
//!
//! Given a zone and the coordinates already occupied, [`SpatialAllocator`]
//! walks the zone's candidate slots in a fixed order and returns the first
//! one that keeps `MIN_DISTANCE` to every obstacle. It is a pure function of
//! its inputs: no clock, no randomness, no I/O. Concurrent callers that see
//! the same occupied set compute the same answer, which is exactly why the
//! [`crate::reconciler`] post-write check exists.
//!
//! Search order:
//! 1. `max_attempts` slots of the zone's layering policy
//! 2. `extended_layers` further rings/arcs of the same enumeration
//! 3. the configured fallback coordinate (never fails, never loops)

use crate::config::PlacementConfig;
use crate::zone::{ArcLayout, Coordinate, Layering, RingLayout, Zone, ZoneKey, ZoneRegistry};

/// Weyl increments of the R2 low-discrepancy sequence (1/g and 1/g^2 for the
/// plastic number g).
const R2_ALPHA_1: f64 = 0.754_877_666_246_692_7;
const R2_ALPHA_2: f64 = 0.569_840_290_998_053_2;

/// Where an allocated coordinate came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotSource {
    /// Candidate slot index within the zone's enumeration
    Slot(usize),
    /// Every candidate was blocked
    Fallback,
}

/// Result of an allocation, with provenance for logging and tests.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Allocation {
    pub coordinate: Coordinate,
    pub source: SlotSource,
}

/// Configuration-driven placement allocator shared by every caller.
#[derive(Debug, Clone)]
pub struct SpatialAllocator {
    registry: ZoneRegistry,
    min_distance: f64,
    max_attempts: usize,
    extended_layers: usize,
    fallback: Coordinate,
}

impl SpatialAllocator {
    /// Creates an allocator over an explicit registry.
    pub fn new(registry: ZoneRegistry, config: &PlacementConfig) -> Self {
        Self {
            registry,
            min_distance: config.min_distance(),
            max_attempts: config.max_attempts,
            extended_layers: config.extended_layers,
            fallback: config.fallback,
        }
    }

    /// Creates an allocator whose registry comes from the same config.
    pub fn from_config(config: &PlacementConfig) -> Self {
        Self::new(config.registry(), config)
    }

    pub fn registry(&self) -> &ZoneRegistry {
        &self.registry
    }

    /// `MIN_DISTANCE` in world units.
    pub fn min_distance(&self) -> f64 {
        self.min_distance
    }

    /// Returns a coordinate in `zone_key`'s zone clear of `occupied`.
    pub fn allocate(&self, zone_key: &ZoneKey, occupied: &[Coordinate]) -> Coordinate {
        self.allocate_detailed(zone_key, occupied).coordinate
    }

    /// Like [`allocate`](Self::allocate) but reports which slot won.
    pub fn allocate_detailed(&self, zone_key: &ZoneKey, occupied: &[Coordinate]) -> Allocation {
        let zone = self.registry.resolve(zone_key);

        let obstacles: Vec<Coordinate> = occupied
            .iter()
            .copied()
            .chain(std::iter::once(zone.anchor))
            .chain(zone.obstacles.iter().copied())
            .collect();

        let limit = self.max_attempts + self.extended_layers * zone.layering.slots_per_layer();

        for index in 0..limit {
            let candidate = slot_coordinate(zone, index);
            if self.is_clear(&candidate, &obstacles) {
                return Allocation {
                    coordinate: candidate,
                    source: SlotSource::Slot(index),
                };
            }
        }

        tracing::warn!(
            zone = %zone.key,
            occupied = occupied.len(),
            "placement search exhausted, using fallback coordinate"
        );

        Allocation {
            coordinate: self.fallback,
            source: SlotSource::Fallback,
        }
    }

    /// True when `candidate` keeps `MIN_DISTANCE` to every obstacle.
    pub fn is_clear(&self, candidate: &Coordinate, obstacles: &[Coordinate]) -> bool {
        obstacles
            .iter()
            .all(|obstacle| candidate.distance(obstacle) >= self.min_distance)
    }
}

// ============================================================================
// SLOT ENUMERATION
// ============================================================================

/// Coordinate of candidate slot `index` in `zone`.
pub fn slot_coordinate(zone: &Zone, index: usize) -> Coordinate {
    match &zone.layering {
        Layering::Ring(ring) => ring_slot(zone.anchor, ring, index),
        Layering::Arc(arc) => arc_slot(zone.anchor, arc, index),
    }
}

fn ring_slot(anchor: Coordinate, ring: &RingLayout, index: usize) -> Coordinate {
    let layer = index / ring.slots_per_ring;
    let slot_in_ring = index % ring.slots_per_ring;

    let radius = ring.base_radius + layer as f64 * ring.ring_spacing;
    let angle = slot_in_ring as f64 * ring.angle_step + layer as f64 * ring.ring_offset;

    anchor.polar_offset(radius, angle)
}

fn arc_slot(anchor: Coordinate, arc: &ArcLayout, index: usize) -> Coordinate {
    let layer = index / arc.slots_per_arc;
    let slot_in_arc = index % arc.slots_per_arc;

    let step = if arc.slots_per_arc > 1 {
        arc.angular_span / (arc.slots_per_arc - 1) as f64
    } else {
        0.0
    };
    let stagger = if layer % 2 == 1 { 0.5 } else { 0.0 };
    let start = arc.base_heading - arc.angular_span / 2.0;

    let (u, v) = low_discrepancy(index);
    let radius = arc.base_distance
        + layer as f64 * arc.arc_spacing
        + (2.0 * u - 1.0) * arc.radius_jitter;
    let angle = start + (slot_in_arc as f64 + stagger) * step + (2.0 * v - 1.0) * arc.angle_jitter;

    anchor.polar_offset(radius, angle)
}

/// Point `index` of the R2 sequence, both components in `[0, 1)`.
///
/// Same index, same pair: this is the only "randomness" in the layout.
fn low_discrepancy(index: usize) -> (f64, f64) {
    let n = (index + 1) as f64;
    ((0.5 + n * R2_ALPHA_1).fract(), (0.5 + n * R2_ALPHA_2).fract())
}
