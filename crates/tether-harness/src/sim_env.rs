//! Deterministic environment for simulation.
//!
//! Time only moves when a test calls [`SimEnv::advance`] (or awaits
//! [`Environment::sleep`]), and randomness comes from a seeded ChaCha
//! stream, so a run is fully reproducible from its seed.

use std::{
    fmt,
    ops::{Add, Sub},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tether_core::env::Environment;

/// Point on the virtual clock, as an offset from the start of the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct SimInstant(Duration);

impl SimInstant {
    /// Start of the run.
    pub const ZERO: Self = Self(Duration::ZERO);

    /// Offset from the start of the run.
    pub fn since_start(self) -> Duration {
        self.0
    }
}

impl Sub for SimInstant {
    type Output = Duration;

    fn sub(self, rhs: Self) -> Duration {
        self.0.saturating_sub(rhs.0)
    }
}

impl Add<Duration> for SimInstant {
    type Output = Self;

    fn add(self, rhs: Duration) -> Self {
        Self(self.0 + rhs)
    }
}

/// Simulated environment: virtual clock and seeded RNG.
///
/// Clones share the clock and the RNG stream.
#[derive(Clone)]
pub struct SimEnv {
    seed: u64,
    clock: Arc<Mutex<Duration>>,
    rng: Arc<Mutex<ChaCha8Rng>>,
}

impl SimEnv {
    /// Environment seeded with 0.
    pub fn new() -> Self {
        Self::with_seed(0)
    }

    /// Environment with the given RNG seed.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            seed,
            clock: Arc::new(Mutex::new(Duration::ZERO)),
            rng: Arc::new(Mutex::new(ChaCha8Rng::seed_from_u64(seed))),
        }
    }

    /// Seed this environment was created with.
    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Move the virtual clock forward.
    pub fn advance(&self, duration: Duration) {
        *lock(&self.clock) += duration;
    }

    /// Virtual time since the start of the run.
    pub fn elapsed(&self) -> Duration {
        *lock(&self.clock)
    }
}

impl Default for SimEnv {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SimEnv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimEnv").field("seed", &self.seed).field("elapsed", &self.elapsed()).finish()
    }
}

impl Environment for SimEnv {
    type Instant = SimInstant;

    fn now(&self) -> SimInstant {
        SimInstant(*lock(&self.clock))
    }

    /// Advances the virtual clock and completes immediately.
    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send {
        self.advance(duration);
        std::future::ready(())
    }

    fn random_bytes(&self, buffer: &mut [u8]) {
        lock(&self.rng).fill_bytes(buffer);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use tether_core::SessionId;

    use super::*;

    #[test]
    fn clock_moves_only_when_advanced() {
        let env = SimEnv::new();
        let start = env.now();
        assert_eq!(env.now(), start);

        env.advance(Duration::from_millis(250));
        assert_eq!(env.now() - start, Duration::from_millis(250));
        assert_eq!(start - env.now(), Duration::ZERO);
    }

    #[test]
    fn same_seed_same_ids() {
        let a = SimEnv::with_seed(42);
        let b = SimEnv::with_seed(42);
        assert_eq!(SessionId::generate(&a), SessionId::generate(&b));
        assert_ne!(SessionId::generate(&a), SessionId::generate(&SimEnv::with_seed(43)));
    }

    #[test]
    fn clones_share_the_clock() {
        let env = SimEnv::new();
        let clone = env.clone();
        clone.advance(Duration::from_secs(3));
        assert_eq!(env.elapsed(), Duration::from_secs(3));
    }
}
