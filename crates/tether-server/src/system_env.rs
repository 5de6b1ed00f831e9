//! Production Environment implementation using system time and RNG.
//!
//! Real monotonic time, OS entropy and tokio sleeps. Session ids are drawn
//! from this RNG, so it must be cryptographically secure.

use std::time::Duration;

use tether_core::env::Environment;

/// Production environment using system time and cryptographic RNG.
///
/// # Panics
///
/// Panics if the OS RNG fails. Session ids are bearer tokens; a server that
/// cannot generate them unpredictably must not keep running.
#[derive(Clone, Default)]
pub struct SystemEnv;

impl SystemEnv {
    /// Create a new system environment.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Environment for SystemEnv {
    type Instant = std::time::Instant;

    #[allow(clippy::disallowed_methods)]
    fn now(&self) -> Self::Instant {
        std::time::Instant::now()
    }

    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send {
        tokio::time::sleep(duration)
    }

    #[allow(clippy::expect_used)]
    fn random_bytes(&self, buffer: &mut [u8]) {
        getrandom::fill(buffer).expect("invariant: OS RNG failure is unrecoverable");
    }
}

#[cfg(test)]
mod tests {
    use tether_core::SessionId;

    use super::*;

    #[test]
    fn generated_session_ids_differ() {
        let env = SystemEnv::new();
        let a = SessionId::generate(&env);
        let b = SessionId::generate(&env);
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), tether_core::session::SESSION_ID_LEN);
    }

    #[tokio::test]
    async fn sleep_waits() {
        let env = SystemEnv::new();

        let start = env.now();
        env.sleep(Duration::from_millis(20)).await;
        assert!(env.now() - start >= Duration::from_millis(20));
    }
}
