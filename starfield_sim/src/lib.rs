//! Starfield Deterministic Simulation Testing (DST) Harness
//!
//! Runs real `SyncSession`s and `PlacementReconciler`s inside a controlled
//! world where every source of non-determinism is owned by the harness:
//! - **Time**: each client has a virtual clock (optionally skewed) that the
//!   world advances tick by tick
//! - **Network**: a relay with per-link latency, jitter, loss, partitions
//!   and outages
//! - **Randomness**: all entropy derived from a single 64-bit seed
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         SimWorld                            │
//! │  ┌──────────────────────────────────────────────────────┐   │
//! │  │ Relay: in-flight heap ordered by (deliver_at, seq)   │   │
//! │  └──────────────────────────────────────────────────────┘   │
//! │       │                        │                            │
//! │  ┌────▼────┐              ┌────▼────┐                       │
//! │  │ Client  │◄────────────►│ Client  │     ...               │
//! │  │   #0    │  envelopes   │   #1    │                       │
//! │  └─────────┘              └─────────┘                       │
//! │       ▲                        ▲                            │
//! │  ┌────┴────────────────────────┴────┐   ┌────────────────┐  │
//! │  │            Oracle                │   │ Snapshot/Object│  │
//! │  │   (avatar ground truth)          │   │ stores (shared)│  │
//! │  └──────────────────────────────────┘   └────────────────┘  │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use starfield_sim::{ScenarioRunner, scenarios::ScenarioId};
//!
//! let result = ScenarioRunner::new(42, 6).run(ScenarioId::JitterStorm);
//! assert!(result.passed);
//! ```

mod agent;
mod context;
mod exporter;
mod network;
mod oracle;
mod runner;
pub mod scenarios;
mod world;

pub use agent::SimulatedClient;
pub use context::SimContext;
pub use exporter::{AvatarPosition, ClientFrame, ObjectPosition, SimEvent, SimExport, SimFrame};
pub use network::{NetworkMessage, RecvState, SimNetwork, SimNetworkController};
pub use oracle::{GroundTruthAvatar, Oracle};
pub use runner::{ScenarioMetrics, ScenarioResult, ScenarioRunner};
pub use world::{LinkProfile, RouterStats, SimConfig, SimWorld};
