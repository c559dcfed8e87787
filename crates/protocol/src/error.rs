//! Error types for frame encoding and decoding.

use crate::frame::FrameType;

/// Errors produced while decoding a frame body.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    /// The bytes do not form a frame of any known shape.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// The CRC-32 carried by the frame disagrees with its contents.
    ///
    /// `sequence` is read from the damaged bytes and may itself be corrupt.
    #[error(
        "checksum mismatch in {frame_type} frame (sequence {sequence:?}): \
         expected {expected:#010x}, got {actual:#010x}"
    )]
    ChecksumMismatch {
        frame_type: FrameType,
        sequence: Option<u64>,
        expected: u32,
        actual: u32,
    },
}

/// Errors produced while encoding a frame.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EncodeError {
    #[error("file name too long: {0} bytes (max {max})", max = crate::MAX_FILE_NAME_LEN)]
    FileNameTooLong(usize),
}
