//! Lockstep chunked file transfer with acknowledgments and retries.
//!
//! A [`SenderSession`] reads a file forward in fixed-size chunks and keeps
//! exactly one chunk in flight until the [`ReceiverSession`] on the other
//! end of the connection acknowledges it. Damaged, lost or duplicated
//! frames are recovered by sender-driven retransmission; the receiver is
//! purely reactive and idempotent under duplicates.
//!
//! Frames travel through a [`FrameTransport`], which is also where an
//! optional [`FaultPolicy`] can drop, corrupt or delay them to exercise the
//! recovery paths.

mod chunked;
pub mod config;
pub mod fault;
pub mod receiver;
pub mod sender;
pub mod server;
pub mod transport;
mod validation;

pub use chunked::{ChunkReader, DestinationWriter, calculate_file_digest};
pub use config::{Backoff, FaultConfig, TransferConfig};
pub use fault::{Direction, FaultAction, FaultPolicy, NoFaults, RandomFaults};
pub use receiver::{ReceiveReport, ReceiverSession, ReceiverState};
pub use sender::{SenderSession, SenderState, TransferProgress, TransferReport, send_file};
pub use server::{SessionOutcome, TransferServer};
pub use transport::FrameTransport;
pub use validation::destination_file_name;

use std::time::Duration;

use chunkferry_protocol::{DecodeError, EncodeError, FrameType};

/// Default chunk size: 4 KiB.
pub const DEFAULT_CHUNK_SIZE: usize = 4096;

/// Largest accepted chunk size: 16 MiB.
pub const MAX_CHUNK_SIZE: usize = 16 * 1024 * 1024;

/// Prefix prepended to the declared file name on the receiving side.
pub const DESTINATION_PREFIX: &str = "received_";

/// Default TCP port for `serve` and `send`.
pub const DEFAULT_PORT: u16 = 8888;

/// Timeout for the TCP connection attempt.
pub const TCP_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors produced by transfer sessions.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Unparsable bytes on the connection. Fatal for the session.
    #[error("malformed frame: {0}")]
    Malformed(String),

    #[error("checksum mismatch in {frame_type} frame (sequence {sequence:?})")]
    ChecksumMismatch {
        frame_type: FrameType,
        sequence: Option<u64>,
    },

    #[error("chunk {sequence} out of order, receiver expects {expected}")]
    OutOfOrder { sequence: u64, expected: u64 },

    #[error("timed out")]
    Timeout,

    #[error("transfer failed at chunk {sequence}: max retries exceeded ({retries})")]
    MaxRetriesExceeded { sequence: u64, retries: u32 },

    #[error("transfer offer not accepted after {retries} retries")]
    HandshakeFailed { retries: u32 },

    #[error("destination write error: {0}")]
    DestinationWrite(String),

    #[error("file digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("connection closed by peer")]
    ConnectionClosed,

    #[error("cancelled")]
    Cancelled,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error(transparent)]
    Encode(#[from] EncodeError),
}

impl TransferError {
    /// Returns `true` for errors a sender recovers from by retransmitting.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::ChecksumMismatch { .. } | Self::OutOfOrder { .. } | Self::Timeout
        )
    }
}

impl From<DecodeError> for TransferError {
    fn from(err: DecodeError) -> Self {
        match err {
            DecodeError::MalformedFrame(reason) => Self::Malformed(reason),
            DecodeError::ChecksumMismatch {
                frame_type,
                sequence,
                ..
            } => Self::ChecksumMismatch {
                frame_type,
                sequence,
            },
        }
    }
}
