//! Ground truth oracle for simulation.
//!
//! The Oracle flies every simulated avatar:
//! - True positions and velocities
//! - Steering with seeded Gaussian noise
//! - Idle avatars that hold still (to exercise suppression and keepalive)

use nalgebra::Vector2;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use starfield_core::Pose;
use starfield_env::PeerId;
use std::collections::BTreeMap;

/// Speed cap in world units per second.
const MAX_SPEED: f64 = 220.0;

/// One avatar's true kinematic state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroundTruthAvatar {
    pub peer_id: PeerId,

    /// Position in world units
    pub position: Vector2<f64>,

    /// Velocity in units per second
    pub velocity: Vector2<f64>,

    /// Heading in radians
    pub rotation: f64,

    /// Idle avatars never steer
    pub idle: bool,
}

impl GroundTruthAvatar {
    /// Pose as the owning client would read it from its input loop.
    pub fn pose(&self) -> Pose {
        let thrusting = !self.idle && self.velocity.norm() > 1.0;
        Pose::at(self.position.x, self.position.y)
            .with_velocity(self.velocity.x, self.velocity.y)
            .with_rotation(self.rotation)
            .with_thrust(thrusting, false)
    }
}

/// The Oracle - maintains avatar ground truth.
pub struct Oracle {
    /// RNG for steering (separate from the network RNG)
    physics_rng: ChaCha8Rng,

    /// Avatars in peer id order
    avatars: BTreeMap<PeerId, GroundTruthAvatar>,

    /// Current simulation time (seconds)
    current_time: f64,

    /// Steering acceleration standard deviation (units/s²)
    steering_std: f64,
}

impl Oracle {
    /// Creates a new Oracle with the given physics seed.
    ///
    /// Derive the physics seed separately from the network seed so that
    /// changing link behaviour does not change trajectories.
    pub fn new(physics_seed: u64) -> Self {
        Self {
            physics_rng: ChaCha8Rng::seed_from_u64(physics_seed),
            avatars: BTreeMap::new(),
            current_time: 0.0,
            steering_std: 60.0,
        }
    }

    pub fn set_steering_noise(&mut self, std_dev: f64) {
        self.steering_std = std_dev;
    }

    /// Adds a moving avatar.
    pub fn spawn_avatar(&mut self, peer_id: PeerId, position: Vector2<f64>, velocity: Vector2<f64>) {
        let rotation = velocity.y.atan2(velocity.x);
        self.avatars.insert(
            peer_id,
            GroundTruthAvatar {
                peer_id,
                position,
                velocity,
                rotation,
                idle: false,
            },
        );
    }

    /// Adds an avatar that stays parked at `position`.
    pub fn spawn_idle(&mut self, peer_id: PeerId, position: Vector2<f64>) {
        self.avatars.insert(
            peer_id,
            GroundTruthAvatar {
                peer_id,
                position,
                velocity: Vector2::zeros(),
                rotation: 0.0,
                idle: true,
            },
        );
    }

    pub fn remove_avatar(&mut self, peer_id: &PeerId) -> Option<GroundTruthAvatar> {
        self.avatars.remove(peer_id)
    }

    /// Advances every avatar by `dt` seconds.
    pub fn step(&mut self, dt: f64) {
        self.current_time += dt;

        let Ok(noise) = Normal::new(0.0, self.steering_std) else {
            return;
        };

        for avatar in self.avatars.values_mut() {
            if avatar.idle {
                continue;
            }

            let accel = Vector2::new(
                noise.sample(&mut self.physics_rng),
                noise.sample(&mut self.physics_rng),
            );
            avatar.velocity += accel * dt;
            let speed = avatar.velocity.norm();
            if speed > MAX_SPEED {
                avatar.velocity *= MAX_SPEED / speed;
            }

            avatar.position += avatar.velocity * dt;
            if avatar.velocity.norm() > 1e-9 {
                avatar.rotation = avatar.velocity.y.atan2(avatar.velocity.x);
            }
        }
    }

    /// Returns the current simulation time.
    pub fn time(&self) -> f64 {
        self.current_time
    }

    pub fn avatar(&self, peer_id: &PeerId) -> Option<&GroundTruthAvatar> {
        self.avatars.get(peer_id)
    }

    /// Current pose of `peer_id`'s avatar.
    pub fn pose(&self, peer_id: &PeerId) -> Option<Pose> {
        self.avatars.get(peer_id).map(GroundTruthAvatar::pose)
    }

    pub fn avatars(&self) -> impl Iterator<Item = &GroundTruthAvatar> {
        self.avatars.values()
    }

    pub fn len(&self) -> usize {
        self.avatars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.avatars.is_empty()
    }
}
