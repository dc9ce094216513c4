//! Simulated relay transport with fault injection.

use async_trait::async_trait;
use starfield_env::{EnvError, Envelope, NetworkController, NetworkTransport, PeerId};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// Internal message to the network router.
#[derive(Debug)]
pub struct NetworkMessage {
    pub from: PeerId,
    /// `None` fans out to every other registered peer
    pub to: Option<PeerId>,
    pub envelope: Envelope,
}

/// Result of a non-blocking receive.
#[derive(Debug)]
pub enum RecvState {
    Message(PeerId, Envelope),
    Empty,
    /// The relay dropped us since the last receive
    Closed,
}

/// Simulated network interface for one client.
pub struct SimNetwork {
    /// This peer's ID
    local_id: PeerId,

    /// Sender to central router
    tx: mpsc::UnboundedSender<NetworkMessage>,

    /// Receiver for incoming envelopes (behind tokio mutex for async)
    rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<(PeerId, Envelope)>>>,

    /// Shared fault state
    controller: Arc<SimNetworkController>,

    /// Whether the client currently believes it is connected
    connected: AtomicBool,
}

impl SimNetwork {
    /// Creates a new simulated network interface.
    pub fn new(
        local_id: PeerId,
        tx: mpsc::UnboundedSender<NetworkMessage>,
        rx: mpsc::UnboundedReceiver<(PeerId, Envelope)>,
        controller: Arc<SimNetworkController>,
    ) -> Self {
        controller.register(local_id);
        Self {
            local_id,
            tx,
            rx: Arc::new(tokio::sync::Mutex::new(rx)),
            controller,
            connected: AtomicBool::new(false),
        }
    }

    /// Non-blocking receive used by the step-driven simulation loop.
    pub fn try_recv(&self) -> RecvState {
        if !self.controller.is_online(self.local_id) {
            if self.connected.swap(false, Ordering::SeqCst) {
                return RecvState::Closed;
            }
            return RecvState::Empty;
        }

        let Ok(mut rx) = self.rx.try_lock() else {
            return RecvState::Empty;
        };
        match rx.try_recv() {
            Ok((from, envelope)) => RecvState::Message(from, envelope),
            Err(_) => RecvState::Empty,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn route(&self, to: Option<PeerId>, envelope: Envelope) -> Result<(), EnvError> {
        if !self.controller.is_online(self.local_id) {
            return Err(EnvError::disconnected(format!("{} is offline", self.local_id)));
        }

        let msg = NetworkMessage {
            from: self.local_id,
            to,
            envelope,
        };
        self.tx.send(msg).map_err(|_| EnvError::network("Channel closed"))
    }
}

#[async_trait]
impl NetworkTransport for SimNetwork {
    async fn send(&self, target: PeerId, envelope: Envelope) -> Result<(), EnvError> {
        self.route(Some(target), envelope)
    }

    async fn broadcast(&self, envelope: Envelope) -> Result<usize, EnvError> {
        self.route(None, envelope)?;
        Ok(self.controller.peer_count().saturating_sub(1))
    }

    async fn recv(&self) -> Option<(PeerId, Envelope)> {
        if !self.controller.is_online(self.local_id) {
            self.connected.store(false, Ordering::SeqCst);
            return None;
        }
        let mut rx = self.rx.lock().await;
        rx.recv().await
    }

    async fn connect(&self) -> Result<(), EnvError> {
        if self.controller.is_online(self.local_id) {
            self.connected.store(true, Ordering::SeqCst);
            Ok(())
        } else {
            Err(EnvError::network("relay unreachable"))
        }
    }

    fn local_id(&self) -> PeerId {
        self.local_id
    }
}

/// Network controller for fault injection.
pub struct SimNetworkController {
    /// Registered peers in id order
    peers: Mutex<BTreeSet<PeerId>>,

    /// Per-link latency in milliseconds
    link_latency: Mutex<HashMap<(PeerId, PeerId), u64>>,

    /// Per-link packet loss rate (0.0 - 1.0)
    link_loss: Mutex<HashMap<(PeerId, PeerId), f64>>,

    /// Active partitions (peers that cannot communicate)
    partitions: Mutex<Vec<(Vec<PeerId>, Vec<PeerId>)>>,

    /// Peers cut off from the relay
    offline: Mutex<BTreeSet<PeerId>>,
}

impl SimNetworkController {
    /// Creates a new network controller.
    pub fn new() -> Self {
        Self {
            peers: Mutex::new(BTreeSet::new()),
            link_latency: Mutex::new(HashMap::new()),
            link_loss: Mutex::new(HashMap::new()),
            partitions: Mutex::new(Vec::new()),
            offline: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn register(&self, peer: PeerId) {
        if let Ok(mut peers) = self.peers.lock() {
            peers.insert(peer);
        }
    }

    /// Registered peers in id order.
    pub fn peers(&self) -> Vec<PeerId> {
        self.peers
            .lock()
            .map(|p| p.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.lock().map(|p| p.len()).unwrap_or(0)
    }

    /// Drops `peer` from the relay until [`restore`](Self::restore).
    pub fn disconnect(&self, peer: PeerId) {
        if let Ok(mut offline) = self.offline.lock() {
            offline.insert(peer);
        }
    }

    pub fn restore(&self, peer: PeerId) {
        if let Ok(mut offline) = self.offline.lock() {
            offline.remove(&peer);
        }
    }

    pub fn is_online(&self, peer: PeerId) -> bool {
        self.offline
            .lock()
            .map(|o| !o.contains(&peer))
            .unwrap_or(true)
    }

    /// Checks if two peers can communicate (not partitioned, both online).
    pub fn can_communicate(&self, from: PeerId, to: PeerId) -> bool {
        if !self.is_online(from) || !self.is_online(to) {
            return false;
        }

        let Ok(partitions) = self.partitions.lock() else {
            return true;
        };
        for (group_a, group_b) in partitions.iter() {
            let from_in_a = group_a.contains(&from);
            let from_in_b = group_b.contains(&from);
            let to_in_a = group_a.contains(&to);
            let to_in_b = group_b.contains(&to);

            // Partitioned if one is in A and other in B (or vice versa)
            if (from_in_a && to_in_b) || (from_in_b && to_in_a) {
                return false;
            }
        }

        true
    }

    /// Gets the latency for a link (default 0).
    pub fn latency(&self, from: PeerId, to: PeerId) -> u64 {
        self.link_latency
            .lock()
            .ok()
            .and_then(|l| l.get(&(from, to)).copied())
            .unwrap_or(0)
    }

    /// Gets the loss rate for a link (default 0.0).
    pub fn loss(&self, from: PeerId, to: PeerId) -> f64 {
        self.link_loss
            .lock()
            .ok()
            .and_then(|l| l.get(&(from, to)).copied())
            .unwrap_or(0.0)
    }
}

impl NetworkController for SimNetworkController {
    fn partition(&self, group_a: &[PeerId], group_b: &[PeerId]) {
        if let Ok(mut partitions) = self.partitions.lock() {
            partitions.push((group_a.to_vec(), group_b.to_vec()));
        }
    }

    fn heal_all(&self) {
        if let Ok(mut partitions) = self.partitions.lock() {
            partitions.clear();
        }
    }

    fn set_link_latency(&self, from: PeerId, to: PeerId, latency_ms: u64) {
        if let Ok(mut latencies) = self.link_latency.lock() {
            latencies.insert((from, to), latency_ms);
        }
    }

    fn set_link_loss(&self, from: PeerId, to: PeerId, loss_rate: f64) {
        if let Ok(mut losses) = self.link_loss.lock() {
            losses.insert((from, to), loss_rate.clamp(0.0, 1.0));
        }
    }
}

impl Default for SimNetworkController {
    fn default() -> Self {
        Self::new()
    }
}
