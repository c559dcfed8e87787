//! Frame types exchanged between sender and receiver.

use std::fmt;
use std::time::Duration;

use uuid::Uuid;

use crate::codec::frame_checksum;

/// One-byte tag identifying the frame variant on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameType {
    Chunk = 0x01,
    Ack = 0x02,
    Offer = 0x03,
    Accept = 0x04,
}

impl TryFrom<u8> for FrameType {
    type Error = u8;

    fn try_from(tag: u8) -> Result<Self, Self::Error> {
        match tag {
            0x01 => Ok(Self::Chunk),
            0x02 => Ok(Self::Ack),
            0x03 => Ok(Self::Offer),
            0x04 => Ok(Self::Accept),
            other => Err(other),
        }
    }
}

impl fmt::Display for FrameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Chunk => "CHUNK",
            Self::Ack => "ACK",
            Self::Offer => "OFFER",
            Self::Accept => "ACCEPT",
        };
        f.write_str(name)
    }
}

/// A bounded slice of the source file plus ordering and integrity metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// Position in the transfer, starting at 0.
    pub sequence: u64,
    /// Raw file bytes (at most the configured chunk size).
    pub payload: Vec<u8>,
    /// CRC-32 over the sequence number, flags and payload.
    pub checksum: u32,
    /// Set only on the last chunk of a transfer.
    pub is_final: bool,
}

impl Chunk {
    /// Builds a chunk and computes its checksum.
    pub fn new(sequence: u64, payload: Vec<u8>, is_final: bool) -> Self {
        let checksum = chunk_checksum(sequence, is_final, &payload);
        Self {
            sequence,
            payload,
            checksum,
            is_final,
        }
    }

    /// Recomputes the checksum and compares it with the stored one.
    pub fn verify(&self) -> bool {
        chunk_checksum(self.sequence, self.is_final, &self.payload) == self.checksum
    }

    pub(crate) fn flags(&self) -> u8 {
        u8::from(self.is_final)
    }
}

fn chunk_checksum(sequence: u64, is_final: bool, payload: &[u8]) -> u32 {
    let mut fields = [0u8; crate::CHUNK_FIELDS_LEN];
    fields[..8].copy_from_slice(&sequence.to_be_bytes());
    fields[8] = u8::from(is_final);
    frame_checksum(&[&fields[..], payload])
}

/// Receiver verdict on a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum AckStatus {
    Ok = 0,
    ChecksumMismatch = 1,
    OutOfOrder = 2,
}

impl TryFrom<u8> for AckStatus {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Ok),
            1 => Ok(Self::ChecksumMismatch),
            2 => Ok(Self::OutOfOrder),
            other => Err(other),
        }
    }
}

impl fmt::Display for AckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Ok => "OK",
            Self::ChecksumMismatch => "CHECKSUM_MISMATCH",
            Self::OutOfOrder => "OUT_OF_ORDER",
        };
        f.write_str(name)
    }
}

/// Acknowledgment for a chunk.
///
/// For [`AckStatus::OutOfOrder`] the sequence is the receiver's next
/// expected sequence rather than the one it was sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack {
    pub sequence: u64,
    pub status: AckStatus,
}

impl Ack {
    pub fn ok(sequence: u64) -> Self {
        Self {
            sequence,
            status: AckStatus::Ok,
        }
    }
}

/// Announces a transfer. Always the first frame the sender writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Offer {
    pub transfer_id: Uuid,
    /// Base name of the source file.
    pub file_name: String,
    pub file_size: u64,
    /// SHA-256 of the whole source file.
    pub file_digest: [u8; crate::FILE_DIGEST_LEN],
    /// Longest time the sender may stay silent while retrying one frame.
    /// Travels as whole milliseconds.
    pub retry_window: Duration,
}

/// A complete protocol frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Chunk(Chunk),
    Ack(Ack),
    Offer(Offer),
    /// Receiver has created the destination and is ready for chunk 0.
    Accept { transfer_id: Uuid },
}

impl Frame {
    pub fn frame_type(&self) -> FrameType {
        match self {
            Self::Chunk(_) => FrameType::Chunk,
            Self::Ack(_) => FrameType::Ack,
            Self::Offer(_) => FrameType::Offer,
            Self::Accept { .. } => FrameType::Accept,
        }
    }
}

/// Lifecycle of a transfer session, as seen by either side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferState {
    Establishing,
    InProgress,
    Completed,
    Failed,
}

impl fmt::Display for TransferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Establishing => "establishing",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_type_tags_are_stable() {
        assert_eq!(FrameType::Chunk as u8, 0x01);
        assert_eq!(FrameType::Ack as u8, 0x02);
        assert_eq!(FrameType::Offer as u8, 0x03);
        assert_eq!(FrameType::Accept as u8, 0x04);
        assert_eq!(FrameType::try_from(0x7f), Err(0x7f));
    }

    #[test]
    fn ack_status_rejects_unknown_values() {
        assert_eq!(AckStatus::try_from(2), Ok(AckStatus::OutOfOrder));
        assert!(AckStatus::try_from(3).is_err());
    }

    #[test]
    fn chunk_checksum_covers_final_flag() {
        let a = Chunk::new(7, b"data".to_vec(), false);
        let b = Chunk::new(7, b"data".to_vec(), true);
        assert_ne!(a.checksum, b.checksum);
    }

    #[test]
    fn chunk_checksum_covers_sequence() {
        let a = Chunk::new(1, b"data".to_vec(), false);
        let b = Chunk::new(2, b"data".to_vec(), false);
        assert_ne!(a.checksum, b.checksum);
    }

    #[test]
    fn verify_detects_payload_damage() {
        let mut chunk = Chunk::new(0, b"ABCD".to_vec(), false);
        assert!(chunk.verify());
        chunk.payload[2] ^= 0x40;
        assert!(!chunk.verify());
    }

    #[test]
    fn empty_final_chunk_is_valid() {
        let chunk = Chunk::new(0, Vec::new(), true);
        assert!(chunk.verify());
        assert!(chunk.payload.is_empty());
    }
}
