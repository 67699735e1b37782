//! Environment abstraction for deterministic testing.
//!
//! Waits, deadlines and the sync retransmission loop never touch the system
//! clock or entropy directly. They go through [`Environment`], which is
//! implemented twice:
//!
//! 1. [`SystemEnv`]: tokio clock and OS entropy, for runs against real hosts
//! 2. `SimEnv` (tandem-harness): virtual time and a seeded RNG, so a failing
//!    scenario replays identically
//!
//! # Invariants
//!
//! - Monotonicity: `env.now()` must never go backwards
//! - Determinism: Given the same seed, `random_bytes()` produces the same
//!   sequence
//! - Isolation: Implementations must not share global state

use std::time::Duration;

use rand::{RngCore, rngs::OsRng};

/// Abstract environment providing time, randomness, and async sleeping.
///
/// # Type Parameters
///
/// - `Instant`: Represents a point in time. In simulation, this is the
///   virtual clock. Against real hosts it is the tokio clock.
pub trait Environment: Clone + Send + Sync + 'static {
    /// Type representing a point in time.
    ///
    /// Must support:
    /// - `Copy` - Lightweight to pass around
    /// - `Ord` - Can be compared (for timeout logic)
    /// - `Sub<Output = Duration>` - Can compute elapsed time
    type Instant: Copy + Ord + Send + Sync + std::ops::Sub<Output = Duration>;

    /// Returns the current time. Never decreases.
    fn now(&self) -> Self::Instant;

    /// Sleeps for the specified duration.
    ///
    /// Under simulation this advances virtual time without wall-clock delay.
    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send;

    /// Fills the provided buffer with random bytes.
    fn random_bytes(&self, buffer: &mut [u8]);

    /// Generates a random `u64`.
    ///
    /// Used for sync datagram sequence numbers, initial sequence numbers and
    /// similar identifiers.
    fn random_u64(&self) -> u64 {
        let mut bytes = [0u8; 8];
        self.random_bytes(&mut bytes);
        u64::from_be_bytes(bytes)
    }

    /// Generates a random integer of exactly `bits` significant bits.
    ///
    /// `bits` is clamped to 64. Zero yields zero.
    fn random_bits(&self, bits: u32) -> u64 {
        match bits.min(64) {
            0 => 0,
            64 => self.random_u64(),
            n => self.random_u64() >> (64 - n),
        }
    }
}

/// Environment backed by the tokio clock and OS entropy.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemEnv;

impl Environment for SystemEnv {
    type Instant = std::time::Instant;

    fn now(&self) -> Self::Instant {
        // tokio's clock so paused-time tests see consistent instants
        tokio::time::Instant::now().into_std()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }

    fn random_bytes(&self, buffer: &mut [u8]) {
        OsRng.fill_bytes(buffer);
    }
}
