//! SimWorld - the relay, the clocks and the in-flight envelopes.

use crate::context::SimContext;
use crate::network::{NetworkMessage, SimNetwork, SimNetworkController};

use rand::Rng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use starfield_env::{Envelope, PeerId, WorldContext};
use std::cmp::{Ordering, Reverse};
use std::collections::{BTreeMap, BinaryHeap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Delivery characteristics applied to every link.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LinkProfile {
    /// Fixed one-way latency
    pub base_latency_ms: u64,

    /// Extra uniformly distributed delay; reorders envelopes
    pub jitter_ms: u64,

    /// Probability an envelope is dropped
    pub loss_rate: f64,
}

impl Default for LinkProfile {
    fn default() -> Self {
        Self {
            base_latency_ms: 20,
            jitter_ms: 0,
            loss_rate: 0.0,
        }
    }
}

/// Configuration for a simulation run.
#[derive(Debug, Clone)]
pub struct SimConfig {
    /// Master seed for determinism
    pub seed: u64,

    /// Tick rate in Hz
    pub tick_rate_hz: u32,

    /// Link behaviour
    pub link: LinkProfile,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            tick_rate_hz: 30,
            link: LinkProfile::default(),
        }
    }
}

/// Router counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouterStats {
    pub routed: u64,
    pub delivered: u64,
    pub dropped_loss: u64,
    pub dropped_partition: u64,
}

/// An envelope waiting for its delivery time.
struct InFlight {
    deliver_at_ms: u64,
    seq: u64,
    from: PeerId,
    to: PeerId,
    envelope: Envelope,
}

impl PartialEq for InFlight {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for InFlight {}

impl PartialOrd for InFlight {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for InFlight {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.deliver_at_ms, self.seq).cmp(&(other.deliver_at_ms, other.seq))
    }
}

/// The SimWorld - container for the relay and every client's clock.
pub struct SimWorld {
    /// Configuration
    pub config: SimConfig,

    /// Relay clock; delivery times are measured on it
    pub clock: Arc<SimContext>,

    /// Network controller for fault injection
    pub controller: Arc<SimNetworkController>,

    /// Per-client clocks, advanced in lockstep with `clock`
    client_clocks: Vec<Arc<SimContext>>,

    /// Inbox senders by peer
    inboxes: BTreeMap<PeerId, mpsc::UnboundedSender<(PeerId, Envelope)>>,

    /// Central router sender (cloned into every SimNetwork)
    router_tx: mpsc::UnboundedSender<NetworkMessage>,

    /// Central router receiver
    router_rx: mpsc::UnboundedReceiver<NetworkMessage>,

    in_flight: BinaryHeap<Reverse<InFlight>>,
    next_seq: u64,
    rng: ChaCha8Rng,
    stats: RouterStats,
    tick_count: u64,
}

impl SimWorld {
    /// Creates a new SimWorld with the given configuration.
    pub fn new(config: SimConfig) -> Self {
        let clock = SimContext::shared(config.seed);
        let rng = clock.derive_rng(0x6e65_7477);
        let (router_tx, router_rx) = mpsc::unbounded_channel();

        Self {
            config,
            clock,
            controller: Arc::new(SimNetworkController::new()),
            client_clocks: Vec::new(),
            inboxes: BTreeMap::new(),
            router_tx,
            router_rx,
            in_flight: BinaryHeap::new(),
            next_seq: 0,
            rng,
            stats: RouterStats::default(),
            tick_count: 0,
        }
    }

    /// Attaches a client: a clock synchronised with the relay (plus `skew`
    /// on its wall clock) and a network interface.
    pub fn attach(&mut self, peer: PeerId, skew: Duration) -> (Arc<SimContext>, Arc<SimNetwork>) {
        let ctx = Arc::new(SimContext::with_skew(self.config.seed, skew));
        ctx.advance_time(self.clock.now());
        self.client_clocks.push(ctx.clone());

        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        self.inboxes.insert(peer, inbox_tx);
        let network = Arc::new(SimNetwork::new(
            peer,
            self.router_tx.clone(),
            inbox_rx,
            self.controller.clone(),
        ));
        (ctx, network)
    }

    /// Duration of one tick.
    pub fn dt(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.config.tick_rate_hz as f64)
    }

    /// Advances the relay and every client clock by one tick.
    pub fn advance(&mut self) {
        let dt = self.dt();
        self.clock.advance_time(dt);
        for ctx in &self.client_clocks {
            ctx.advance_time(dt);
        }
        self.tick_count += 1;
    }

    /// Moves every envelope sent since the last call into flight.
    pub fn route(&mut self) {
        let now = self.now_ms();

        while let Ok(msg) = self.router_rx.try_recv() {
            let targets: Vec<PeerId> = match msg.to {
                Some(to) => vec![to],
                None => self
                    .inboxes
                    .keys()
                    .copied()
                    .filter(|p| *p != msg.from)
                    .collect(),
            };

            for to in targets {
                self.stats.routed += 1;
                if !self.controller.can_communicate(msg.from, to) {
                    self.stats.dropped_partition += 1;
                    continue;
                }

                let loss = self.config.link.loss_rate.max(self.controller.loss(msg.from, to));
                if loss > 0.0 && self.rng.gen_bool(loss.min(1.0)) {
                    self.stats.dropped_loss += 1;
                    continue;
                }

                let jitter = if self.config.link.jitter_ms > 0 {
                    self.rng.gen_range(0..=self.config.link.jitter_ms)
                } else {
                    0
                };
                let latency = self.config.link.base_latency_ms + self.controller.latency(msg.from, to) + jitter;

                self.in_flight.push(Reverse(InFlight {
                    deliver_at_ms: now + latency,
                    seq: self.next_seq,
                    from: msg.from,
                    to,
                    envelope: msg.envelope.clone(),
                }));
                self.next_seq += 1;
            }
        }
    }

    /// Hands due envelopes to their recipients' inboxes.
    pub fn deliver(&mut self) {
        let now = self.now_ms();

        while let Some(Reverse(next)) = self.in_flight.peek() {
            if next.deliver_at_ms > now {
                break;
            }
            let Some(Reverse(item)) = self.in_flight.pop() else {
                break;
            };

            // Lost if the recipient dropped while the envelope was in flight
            if !self.controller.is_online(item.to) {
                self.stats.dropped_partition += 1;
                continue;
            }
            if let Some(inbox) = self.inboxes.get(&item.to) {
                if inbox.send((item.from, item.envelope)).is_ok() {
                    self.stats.delivered += 1;
                }
            }
        }
    }

    /// Relay time in milliseconds.
    pub fn now_ms(&self) -> u64 {
        self.clock.now().as_millis() as u64
    }

    /// Returns the current simulation time in seconds.
    pub fn time(&self) -> f64 {
        self.clock.now().as_secs_f64()
    }

    pub fn tick_count(&self) -> u64 {
        self.tick_count
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn stats(&self) -> RouterStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::RecvState;
    use starfield_env::NetworkTransport;

    fn drain(net: &SimNetwork) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        while let RecvState::Message(_, envelope) = net.try_recv() {
            out.push(envelope.payload);
        }
        out
    }

    #[test]
    fn test_sim_world_tick() {
        let mut world = SimWorld::new(SimConfig::default());
        let (ctx, _net) = world.attach(PeerId::from_seed(1), Duration::ZERO);

        assert_eq!(world.tick_count(), 0);
        world.advance();

        assert_eq!(world.tick_count(), 1);
        assert!((world.time() - 1.0 / 30.0).abs() < 0.0001);
        assert_eq!(ctx.now(), world.clock.now());
    }

    #[tokio::test]
    async fn test_broadcast_fans_out_after_latency() {
        let mut world = SimWorld::new(SimConfig::default());
        let a = PeerId::from_seed(1);
        let b = PeerId::from_seed(2);
        let c = PeerId::from_seed(3);
        let (_, net_a) = world.attach(a, Duration::ZERO);
        let (_, net_b) = world.attach(b, Duration::ZERO);
        let (_, net_c) = world.attach(c, Duration::ZERO);

        net_a.broadcast(Envelope::new(vec![7], 0)).await.unwrap();
        world.route();
        world.deliver();
        assert!(drain(&net_b).is_empty());

        world.advance();
        world.deliver();
        assert_eq!(drain(&net_b), vec![vec![7]]);
        assert_eq!(drain(&net_c), vec![vec![7]]);
        assert!(drain(&net_a).is_empty());
        assert_eq!(world.stats().delivered, 2);
    }

    #[tokio::test]
    async fn test_jitter_reorders_deterministically() {
        async fn arrival_order(seed: u64) -> Vec<Vec<u8>> {
            let mut world = SimWorld::new(SimConfig {
                seed,
                link: LinkProfile {
                    base_latency_ms: 0,
                    jitter_ms: 300,
                    loss_rate: 0.0,
                },
                ..SimConfig::default()
            });
            let (_, sender) = world.attach(PeerId::from_seed(1), Duration::ZERO);
            let (_, receiver) = world.attach(PeerId::from_seed(2), Duration::ZERO);

            let mut received = Vec::new();
            for i in 0..30u8 {
                sender.broadcast(Envelope::new(vec![i], 0)).await.unwrap();
                world.route();
                world.advance();
                world.deliver();
                received.extend(drain(&receiver));
            }
            for _ in 0..20 {
                world.advance();
                world.deliver();
                received.extend(drain(&receiver));
            }
            received
        }

        let first = arrival_order(9).await;
        assert_eq!(first, arrival_order(9).await);
        assert_eq!(first.len(), 30);

        let sent_order: Vec<Vec<u8>> = (0..30u8).map(|i| vec![i]).collect();
        assert_ne!(first, sent_order);
    }

    #[tokio::test]
    async fn test_full_loss_and_partition_drop() {
        let mut world = SimWorld::new(SimConfig::default());
        let a = PeerId::from_seed(1);
        let b = PeerId::from_seed(2);
        let (_, net_a) = world.attach(a, Duration::ZERO);
        let (_, _net_b) = world.attach(b, Duration::ZERO);

        use starfield_env::NetworkController;
        world.controller.partition(&[a], &[b]);
        net_a.broadcast(Envelope::new(vec![1], 0)).await.unwrap();
        world.route();
        assert_eq!(world.stats().dropped_partition, 1);

        world.controller.heal_all();
        world.controller.set_link_loss(a, b, 1.0);
        net_a.broadcast(Envelope::new(vec![2], 0)).await.unwrap();
        world.route();
        assert_eq!(world.stats().dropped_loss, 1);
        assert_eq!(world.in_flight(), 0);
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn every_envelope_arrives_once_and_not_early(
                seed in any::<u64>(),
                base in 0u64..200,
                jitter in 0u64..500,
                count in 1usize..40,
            ) {
                let mut world = SimWorld::new(SimConfig {
                    seed,
                    link: LinkProfile { base_latency_ms: base, jitter_ms: jitter, loss_rate: 0.0 },
                    ..SimConfig::default()
                });
                let sender = PeerId::from_seed(1);
                let (_, _tx_net) = world.attach(sender, Duration::ZERO);
                let (_, receiver) = world.attach(PeerId::from_seed(2), Duration::ZERO);

                for i in 0..count {
                    let envelope = Envelope::new((i as u32).to_le_bytes().to_vec(), world.now_ms());
                    world.router_tx.send(NetworkMessage { from: sender, to: None, envelope }).unwrap();
                }
                world.route();

                let mut seen = Vec::new();
                for _ in 0..30 {
                    world.advance();
                    world.deliver();
                    while let RecvState::Message(_, envelope) = receiver.try_recv() {
                        prop_assert!(world.now_ms() >= base + envelope.timestamp_ms);
                        seen.push(envelope.payload);
                    }
                }

                prop_assert_eq!(seen.len(), count);
                seen.sort();
                seen.dedup();
                prop_assert_eq!(seen.len(), count);
            }
        }
    }
}
