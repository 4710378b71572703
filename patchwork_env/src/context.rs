//! Core environment context trait for Patchwork nodes.

use async_trait::async_trait;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::time::Duration;

/// The central interface for environment interaction.
///
/// Abstracts the clock and the entropy source so that a node runtime behaves
/// identically under any runtime and under the simulation harness
/// (`SimContext`: virtual clock, fixed master seed).
#[async_trait]
pub trait PatchworkContext: Send + Sync + 'static {
    /// Returns the monotonic time since context creation.
    ///
    /// In simulation, this is the virtual clock time.
    fn now(&self) -> Duration;

    /// Suspends execution for the given duration.
    ///
    /// In simulation this advances the virtual clock.
    async fn sleep(&self, duration: Duration);

    /// Returns the context's master seed.
    fn seed(&self) -> u64;

    /// Derives an independent RNG stream from the master seed.
    ///
    /// Separate streams keep, for example, initial velocities stable when the
    /// node layout changes.
    fn derive_rng(&self, stream: u64) -> ChaCha8Rng {
        ChaCha8Rng::seed_from_u64(self.seed().wrapping_mul(0x517cc1b727220a95) ^ stream)
    }
}
