//! Network transport abstraction for Starfield clients.

use async_trait::async_trait;
use crate::error::EnvError;
use crate::types::{PeerId, Envelope};

/// Abstraction for the best-effort, low-latency broadcast channel.
///
/// # Implementations
///
/// - **Production**: Wraps a websocket/UDP relay
/// - **Simulation**: Channel-based with configurable latency/jitter/loss
///
/// # Message Flow
///
/// ```text
/// Client A                   Relay                     Client B
///   |                           |                          |
///   |-- broadcast(envelope) --->|                          |
///   |                           |-- [latency/jitter] ----->|
///   |                           |                          |-- recv() -> envelope
/// ```
///
/// Delivery is unordered and lossy. Receivers must not assume that
/// envelopes arrive in send order.
#[async_trait]
pub trait NetworkTransport: Send + Sync + 'static {
    /// Sends an envelope to a single peer.
    ///
    /// # Returns
    /// * `Ok(())` - Envelope queued for delivery
    /// * `Err(EnvError)` - Immediate send failure (e.g., disconnected)
    async fn send(&self, target: PeerId, envelope: Envelope) -> Result<(), EnvError>;

    /// Broadcasts an envelope to every other member of the room.
    ///
    /// # Returns
    /// Number of peers the envelope was handed to.
    async fn broadcast(&self, envelope: Envelope) -> Result<usize, EnvError>;

    /// Receives the next envelope addressed to this peer.
    ///
    /// # Returns
    /// * `Some((sender, envelope))` - An envelope was received
    /// * `None` - The channel was closed (disconnect or shutdown)
    async fn recv(&self) -> Option<(PeerId, Envelope)>;

    /// (Re-)establishes the connection to the relay.
    async fn connect(&self) -> Result<(), EnvError>;

    /// Returns this peer's ID.
    fn local_id(&self) -> PeerId;
}

/// Marker trait for network controllers in simulation.
///
/// Allows injecting faults like partitions, latency and jitter.
pub trait NetworkController: Send + Sync {
    /// Creates a network partition between two peer sets.
    fn partition(&self, group_a: &[PeerId], group_b: &[PeerId]);

    /// Heals all partitions.
    fn heal_all(&self);

    /// Sets base latency for a specific link.
    fn set_link_latency(&self, from: PeerId, to: PeerId, latency_ms: u64);

    /// Sets packet loss probability for a link (0.0 - 1.0).
    fn set_link_loss(&self, from: PeerId, to: PeerId, loss_rate: f64);
}
