//! CLI configuration.
//!
//! Loaded from the file given with `--config`, or `./chunkferry.toml` when
//! present. Every field is optional; command line flags override file
//! values.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use chunkferry_transfer::{Backoff, DEFAULT_CHUNK_SIZE, DEFAULT_PORT, FaultConfig, TransferConfig};

/// File looked up in the working directory when `--config` is absent.
pub const DEFAULT_CONFIG_FILE: &str = "chunkferry.toml";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    #[default]
    Fixed,
    Exponential,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Address `serve` listens on.
    #[serde(default = "default_addr")]
    pub listen: String,

    /// Address `send` connects to.
    #[serde(default = "default_addr")]
    pub server: String,

    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    #[serde(default = "default_ack_timeout_ms")]
    pub ack_timeout_ms: u64,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default)]
    pub backoff: BackoffKind,

    /// Cap for exponential backoff.
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,

    #[serde(default)]
    pub faults: FaultSettings,
}

/// `[faults]` table. Injection itself is switched on with `--simulate-errors`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FaultSettings {
    #[serde(default = "default_fault_probability")]
    pub drop_probability: f64,

    #[serde(default = "default_fault_probability")]
    pub corrupt_probability: f64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
}

fn default_addr() -> String {
    format!("127.0.0.1:{DEFAULT_PORT}")
}

fn default_output_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

fn default_ack_timeout_ms() -> u64 {
    2000
}

fn default_max_retries() -> u32 {
    3
}

fn default_backoff_max_ms() -> u64 {
    16_000
}

fn default_fault_probability() -> f64 {
    0.25
}

fn default_max_delay_ms() -> u64 {
    10
}

impl Default for FaultSettings {
    fn default() -> Self {
        Self {
            drop_probability: default_fault_probability(),
            corrupt_probability: default_fault_probability(),
            max_delay_ms: default_max_delay_ms(),
            seed: None,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: default_addr(),
            server: default_addr(),
            output_dir: default_output_dir(),
            chunk_size: default_chunk_size(),
            ack_timeout_ms: default_ack_timeout_ms(),
            max_retries: default_max_retries(),
            backoff: BackoffKind::default(),
            backoff_max_ms: default_backoff_max_ms(),
            faults: FaultSettings::default(),
        }
    }
}

impl Config {
    /// Loads `path`, or the default file if it exists, or built-in defaults.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(path) => Self::from_file(path),
            None => {
                let path = Path::new(DEFAULT_CONFIG_FILE);
                if path.exists() {
                    Self::from_file(path)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config: Config =
            toml::from_str(&content).with_context(|| format!("parsing config {}", path.display()))?;
        tracing::debug!(path = %path.display(), "configuration loaded");
        Ok(config)
    }

    /// Builds the library configuration, with fault injection on or off.
    pub fn transfer_config(&self, simulate_errors: bool) -> TransferConfig {
        let backoff = match self.backoff {
            BackoffKind::Fixed => Backoff::Fixed,
            BackoffKind::Exponential => Backoff::Exponential {
                max: Duration::from_millis(self.backoff_max_ms),
            },
        };
        TransferConfig {
            chunk_size: self.chunk_size,
            ack_timeout: Duration::from_millis(self.ack_timeout_ms),
            max_retries: self.max_retries,
            backoff,
            output_dir: self.output_dir.clone(),
            faults: FaultConfig {
                enabled: simulate_errors,
                drop_probability: self.faults.drop_probability,
                corrupt_probability: self.faults.corrupt_probability,
                max_delay: Duration::from_millis(self.faults.max_delay_ms),
                seed: self.faults.seed,
            },
        }
    }
}
