//! Fault injection at the transport boundary.
//!
//! A [`FaultPolicy`] sees every encoded frame body on its way out of, or
//! into, a [`FrameTransport`](crate::FrameTransport) and decides whether it
//! passes, is dropped, is corrupted in place or is delayed. Sessions never
//! consult the policy, so recovery code runs identically with and without
//! injected faults.

use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::trace;

use crate::config::FaultConfig;

/// Which way a frame is travelling relative to the local session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outbound,
    Inbound,
}

/// What the transport should do with a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultAction {
    Pass,
    Drop,
    /// The policy has already altered the bytes; deliver them as they are.
    Corrupt,
    /// Deliver unchanged after waiting.
    Delay(Duration),
}

/// Strategy deciding the fate of each frame.
pub trait FaultPolicy: Send {
    fn apply(&mut self, direction: Direction, frame: &mut [u8]) -> FaultAction;
}

/// Identity policy used when fault injection is disabled.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoFaults;

impl FaultPolicy for NoFaults {
    fn apply(&mut self, _direction: Direction, _frame: &mut [u8]) -> FaultAction {
        FaultAction::Pass
    }
}

/// Probabilistic drop / corrupt / delay, applied in both directions.
pub struct RandomFaults {
    rng: StdRng,
    drop_probability: f64,
    corrupt_probability: f64,
    max_delay: Duration,
}

impl RandomFaults {
    pub fn new(
        drop_probability: f64,
        corrupt_probability: f64,
        max_delay: Duration,
        seed: u64,
    ) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            drop_probability: drop_probability.clamp(0.0, 1.0),
            corrupt_probability: corrupt_probability.clamp(0.0, 1.0),
            max_delay,
        }
    }

    /// Builds the policy for the `connection`-th connection of a process.
    ///
    /// A configured seed is mixed with `connection` so that every connection
    /// gets its own reproducible fault sequence. Connection 0 uses the seed
    /// unchanged.
    pub fn from_config(config: &FaultConfig, connection: u64) -> Self {
        let seed = match config.seed {
            Some(seed) => seed ^ connection.wrapping_mul(0x9E37_79B9_7F4A_7C15),
            None => rand::random(),
        };
        Self::new(
            config.drop_probability,
            config.corrupt_probability,
            config.max_delay,
            seed,
        )
    }
}

impl FaultPolicy for RandomFaults {
    fn apply(&mut self, direction: Direction, frame: &mut [u8]) -> FaultAction {
        if self.rng.gen_bool(self.drop_probability) {
            trace!(?direction, len = frame.len(), "fault: dropping frame");
            return FaultAction::Drop;
        }
        if self.rng.gen_bool(self.corrupt_probability) && corrupt_frame(&mut self.rng, frame) {
            trace!(?direction, len = frame.len(), "fault: corrupting frame");
            return FaultAction::Corrupt;
        }
        if self.max_delay.is_zero() {
            return FaultAction::Pass;
        }
        let delay = self.rng.gen_range(Duration::ZERO..=self.max_delay);
        FaultAction::Delay(delay)
    }
}

/// Flips 1 to 3 random bytes of the frame, leaving the frame-type tag intact.
///
/// Returns `false` when the frame has no bytes past the tag.
pub fn corrupt_frame<R: Rng + ?Sized>(rng: &mut R, frame: &mut [u8]) -> bool {
    if frame.len() < 2 {
        return false;
    }
    let flips = rng.gen_range(1..=3usize.min(frame.len() - 1));
    for _ in 0..flips {
        let pos = rng.gen_range(1..frame.len());
        frame[pos] ^= rng.gen_range(1..=255u8);
    }
    true
}
