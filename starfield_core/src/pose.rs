//! The "POSE" model - kinematic samples and their ordering rule.
//!
//! A [`Pose`] is always produced by the avatar's own client and stamped with
//! that client's clock. A [`PeerSample`] is the receiving side's cached copy,
//! which additionally records the *local* receipt time.
//!
//! # Ordering invariant
//!
//! For a fixed peer, a sample replaces the cached one **iff** its
//! `sender_timestamp` is strictly greater. Receipt order is irrelevant, and
//! `received_at` is never compared across peers: it only feeds staleness.
//! Two machines' wall clocks are never compared against each other.

use nalgebra::Vector2;
use serde::{Deserialize, Serialize};
use starfield_env::PeerId;
use std::f64::consts::PI;

/// Kinematic state of one avatar at one instant.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pose {
    pub x: f64,
    pub y: f64,
    pub vx: f64,
    pub vy: f64,
    /// Heading in radians
    pub rotation: f64,
    pub thrusting: bool,
    pub boosting: bool,
    /// Sender's wall clock (Unix ms) when the pose was produced
    pub sender_timestamp: u64,
}

impl Pose {
    /// A motionless pose at the given position.
    pub fn at(x: f64, y: f64) -> Self {
        Self {
            x,
            y,
            vx: 0.0,
            vy: 0.0,
            rotation: 0.0,
            thrusting: false,
            boosting: false,
            sender_timestamp: 0,
        }
    }

    pub fn with_velocity(mut self, vx: f64, vy: f64) -> Self {
        self.vx = vx;
        self.vy = vy;
        self
    }

    pub fn with_rotation(mut self, rotation: f64) -> Self {
        self.rotation = rotation;
        self
    }

    pub fn with_thrust(mut self, thrusting: bool, boosting: bool) -> Self {
        self.thrusting = thrusting;
        self.boosting = boosting;
        self
    }

    pub fn stamped(mut self, sender_timestamp: u64) -> Self {
        self.sender_timestamp = sender_timestamp;
        self
    }

    #[inline]
    pub fn position(&self) -> Vector2<f64> {
        Vector2::new(self.x, self.y)
    }

    #[inline]
    pub fn velocity(&self) -> Vector2<f64> {
        Vector2::new(self.vx, self.vy)
    }

    /// Magnitude of the velocity vector.
    #[inline]
    pub fn speed(&self) -> f64 {
        self.velocity().norm()
    }

    /// Euclidean distance between two poses' positions.
    pub fn position_delta(&self, other: &Pose) -> f64 {
        (self.position() - other.position()).norm()
    }

    /// Smallest absolute angle between two headings, in `[0, PI]`.
    pub fn rotation_delta(&self, other: &Pose) -> f64 {
        let mut delta = (self.rotation - other.rotation) % (2.0 * PI);
        if delta > PI {
            delta -= 2.0 * PI;
        } else if delta < -PI {
            delta += 2.0 * PI;
        }
        delta.abs()
    }
}

/// A cached kinematic sample for one remote peer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerSample {
    pub peer_id: PeerId,
    pub pose: Pose,
    /// Local wall clock (Unix ms) at receipt. Staleness only.
    pub received_at: u64,
    /// Copied from `pose.sender_timestamp`. Ordering only.
    pub sender_timestamp: u64,
}

impl PeerSample {
    pub fn new(peer_id: PeerId, pose: Pose, received_at: u64) -> Self {
        Self {
            peer_id,
            pose,
            received_at,
            sender_timestamp: pose.sender_timestamp,
        }
    }

    /// True when `candidate` should replace this sample.
    #[inline]
    pub fn superseded_by(&self, candidate_timestamp: u64) -> bool {
        candidate_timestamp > self.sender_timestamp
    }

    /// Milliseconds since receipt, saturating at zero under clock steps.
    #[inline]
    pub fn age_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.received_at)
    }
}
