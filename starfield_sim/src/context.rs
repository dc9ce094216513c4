//! Simulation context implementing WorldContext for deterministic testing.

use async_trait::async_trait;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use starfield_env::WorldContext;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Simulation context backed by a manually advanced virtual clock.
///
/// Each simulated client owns one, so a client that sleeps through a
/// reconnect backoff drifts ahead of the others exactly like a real
/// machine's clock would. `wall_offset` models clock skew between hosts.
pub struct SimContext {
    /// Master seed for this simulation
    seed: u64,

    /// Current virtual time (nanoseconds since simulation start)
    virtual_time_ns: Arc<Mutex<u64>>,

    /// Epoch offset (virtual time 0 maps to this wall-clock time)
    epoch: SystemTime,
}

impl SimContext {
    /// 2024-01-01 00:00:00 UTC
    const EPOCH_SECS: u64 = 1_704_067_200;

    /// Creates a new SimContext with the given seed.
    pub fn new(seed: u64) -> Self {
        Self::with_skew(seed, Duration::ZERO)
    }

    /// Creates a context whose wall clock runs `skew` ahead of the epoch.
    pub fn with_skew(seed: u64, skew: Duration) -> Self {
        Self {
            seed,
            virtual_time_ns: Arc::new(Mutex::new(0)),
            epoch: UNIX_EPOCH + Duration::from_secs(Self::EPOCH_SECS) + skew,
        }
    }

    /// Creates an Arc-wrapped context for sharing.
    pub fn shared(seed: u64) -> Arc<Self> {
        Arc::new(Self::new(seed))
    }

    /// Advances virtual time by the given duration.
    pub fn advance_time(&self, duration: Duration) {
        if let Ok(mut time) = self.virtual_time_ns.lock() {
            *time += duration.as_nanos() as u64;
        }
    }

    /// Returns the current virtual time in nanoseconds.
    pub fn time_ns(&self) -> u64 {
        self.virtual_time_ns.lock().map(|t| *t).unwrap_or(0)
    }

    /// Deterministic RNG for one subsystem, derived from the master seed.
    pub fn derive_rng(&self, stream: u64) -> ChaCha8Rng {
        let combined_seed = self.seed.wrapping_mul(0x517c_c1b7_2722_0a95) ^ stream;
        ChaCha8Rng::seed_from_u64(combined_seed)
    }
}

impl Clone for SimContext {
    fn clone(&self) -> Self {
        Self {
            seed: self.seed,
            virtual_time_ns: Arc::clone(&self.virtual_time_ns),
            epoch: self.epoch,
        }
    }
}

#[async_trait]
impl WorldContext for SimContext {
    fn now(&self) -> Duration {
        Duration::from_nanos(self.time_ns())
    }

    fn system_time(&self) -> SystemTime {
        self.epoch + self.now()
    }

    async fn sleep(&self, duration: Duration) {
        // Sleeping only moves this context's clock
        self.advance_time(duration);
    }

    fn spawn<F>(&self, _name: &str, future: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        tokio::spawn(future);
    }

    fn seed(&self) -> u64 {
        self.seed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    #[test]
    fn test_sim_context_time() {
        let ctx = SimContext::new(42);
        assert_eq!(ctx.now(), Duration::ZERO);

        ctx.advance_time(Duration::from_secs(1));
        assert_eq!(ctx.now(), Duration::from_secs(1));

        ctx.advance_time(Duration::from_millis(500));
        assert_eq!(ctx.now(), Duration::from_millis(1500));
    }

    #[test]
    fn test_wall_clock_follows_virtual_time() {
        let ctx = SimContext::new(1);
        let start = ctx.wall_clock_ms();
        assert_eq!(start, SimContext::EPOCH_SECS * 1000);

        ctx.advance_time(Duration::from_millis(250));
        assert_eq!(ctx.wall_clock_ms(), start + 250);
    }

    #[test]
    fn test_skewed_clock() {
        let a = SimContext::new(1);
        let b = SimContext::with_skew(1, Duration::from_millis(900));
        assert_eq!(b.wall_clock_ms() - a.wall_clock_ms(), 900);
        assert_eq!(a.now(), b.now());
    }

    #[test]
    fn test_derived_rng_is_deterministic() {
        let ctx1 = SimContext::new(42);
        let ctx2 = SimContext::new(42);

        let a: u64 = ctx1.derive_rng(7).gen();
        let b: u64 = ctx2.derive_rng(7).gen();
        let c: u64 = ctx1.derive_rng(8).gen();

        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[tokio::test]
    async fn test_sleep_advances_only_own_clock() {
        let ctx1 = SimContext::new(42);
        let ctx2 = SimContext::new(42);
        let shared = ctx1.clone();

        ctx1.sleep(Duration::from_secs(2)).await;

        assert_eq!(shared.now(), Duration::from_secs(2));
        assert_eq!(ctx2.now(), Duration::ZERO);
    }
}
