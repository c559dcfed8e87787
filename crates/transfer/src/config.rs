//! Transfer configuration.

use std::path::PathBuf;
use std::time::Duration;

use crate::fault::{FaultPolicy, NoFaults, RandomFaults};
use crate::{DEFAULT_CHUNK_SIZE, MAX_CHUNK_SIZE, TransferError};

/// How the ack timeout grows across retries of the same frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Backoff {
    /// Every attempt waits `ack_timeout`.
    #[default]
    Fixed,
    /// Attempt `n` waits `ack_timeout * 2^n`, capped at `max`.
    Exponential { max: Duration },
}

impl Backoff {
    /// Ack timeout for an attempt that follows `retries` failed ones.
    pub fn timeout_for(&self, base: Duration, retries: u32) -> Duration {
        match self {
            Self::Fixed => base,
            Self::Exponential { max } => {
                let factor = 1u32.checked_shl(retries).unwrap_or(u32::MAX);
                base.saturating_mul(factor).min(*max)
            }
        }
    }
}

/// Fault-injection settings.
#[derive(Debug, Clone, PartialEq)]
pub struct FaultConfig {
    pub enabled: bool,
    /// Probability that a frame is silently discarded.
    pub drop_probability: f64,
    /// Probability that a surviving frame has bytes flipped.
    pub corrupt_probability: f64,
    /// Upper bound of the random delay applied to frames that pass.
    pub max_delay: Duration,
    /// RNG seed; `None` draws one from the OS.
    pub seed: Option<u64>,
}

impl Default for FaultConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            drop_probability: 0.25,
            corrupt_probability: 0.25,
            max_delay: Duration::from_millis(10),
            seed: None,
        }
    }
}

/// Settings shared by sender and receiver sessions.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferConfig {
    pub chunk_size: usize,
    pub ack_timeout: Duration,
    /// Retransmissions allowed per frame before the transfer fails.
    pub max_retries: u32,
    pub backoff: Backoff,
    /// Directory the receiver writes `received_*` files into.
    pub output_dir: PathBuf,
    pub faults: FaultConfig,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            ack_timeout: Duration::from_secs(2),
            max_retries: 3,
            backoff: Backoff::Fixed,
            output_dir: PathBuf::from("."),
            faults: FaultConfig::default(),
        }
    }
}

impl TransferConfig {
    /// Checks value ranges.
    pub fn validate(&self) -> Result<(), TransferError> {
        if self.chunk_size == 0 || self.chunk_size > MAX_CHUNK_SIZE {
            return Err(TransferError::InvalidConfig(format!(
                "chunk size must be between 1 and {MAX_CHUNK_SIZE} bytes, got {}",
                self.chunk_size
            )));
        }
        if self.ack_timeout.is_zero() {
            return Err(TransferError::InvalidConfig(
                "ack timeout must be greater than zero".into(),
            ));
        }
        for (name, p) in [
            ("drop probability", self.faults.drop_probability),
            ("corrupt probability", self.faults.corrupt_probability),
        ] {
            if !(0.0..=1.0).contains(&p) {
                return Err(TransferError::InvalidConfig(format!(
                    "{name} must be within 0.0..=1.0, got {p}"
                )));
            }
        }
        Ok(())
    }

    /// Largest frame body either side accepts.
    pub fn max_frame_len(&self) -> usize {
        chunkferry_protocol::max_frame_len(self.chunk_size)
    }

    /// Worst-case time a sender keeps retrying a single frame.
    ///
    /// Senders announce it in their offer. The receiver waits for the
    /// longer of its own window and the announced one before treating a
    /// silent peer as gone.
    pub fn retry_window(&self) -> Duration {
        (0..=self.max_retries)
            .map(|r| self.backoff.timeout_for(self.ack_timeout, r))
            .fold(self.ack_timeout, Duration::saturating_add)
    }

    /// Builds the fault policy for the `connection`-th connection.
    pub fn fault_policy(&self, connection: u64) -> Box<dyn FaultPolicy> {
        if self.faults.enabled {
            Box::new(RandomFaults::from_config(&self.faults, connection))
        } else {
            Box::new(NoFaults)
        }
    }
}
