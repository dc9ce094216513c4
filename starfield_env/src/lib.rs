//! Starfield Environment Abstraction Layer
//!
//! This crate provides the "Sans-IO" seam that lets the Starfield sync core
//! run in both **Production** (tokio) and **Simulation** (virtual clock)
//! environments.
//!
//! # Core Concept
//!
//! Everything the sync core would otherwise reach for globally is injected:
//! - Time (`now()`, `wall_clock_ms()`, `sleep()`)
//! - Network (`send()`, `broadcast()`, `recv()`, `connect()`)
//!
//! Staleness sweeps, throttles and snapshot windows all read the clock
//! through [`WorldContext`], so a simulation can replay any run from its seed.
//!
//! # Example
//!
//! ```ignore
//! use starfield_env::{WorldContext, NetworkTransport};
//!
//! async fn client_loop<Ctx: WorldContext, Net: NetworkTransport>(
//!     ctx: &Ctx,
//!     net: &Net,
//! ) {
//!     loop {
//!         tokio::select! {
//!             msg = net.recv() => handle_envelope(msg),
//!             _ = ctx.sleep(Duration::from_secs(5)) => sweep(),
//!         }
//!     }
//! }
//! ```

mod context;
mod network;
mod types;
mod error;
mod tokio_impl;

pub use context::WorldContext;
pub use network::{NetworkTransport, NetworkController};
pub use types::{PeerId, Envelope};
pub use error::EnvError;
pub use tokio_impl::TokioContext;
