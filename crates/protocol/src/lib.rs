//! Wire protocol for chunkferry transfers.
//!
//! A transfer is a lockstep exchange of frames over one TCP connection:
//! the sender offers a file, then sends one chunk at a time and waits for
//! the receiver to acknowledge it before sending the next.
//!
//! # Wire format
//!
//! See the [`codec`] module for the byte layout of each frame.

pub mod codec;
pub mod error;
pub mod frame;

pub use codec::{decode, encode, frame_checksum};
pub use error::{DecodeError, EncodeError};
pub use frame::{Ack, AckStatus, Chunk, Frame, FrameType, Offer, TransferState};

/// Size of the transport length prefix (u32 big-endian).
pub const LENGTH_PREFIX_LEN: usize = 4;

/// Common frame header: 1 byte frame type + 4 byte CRC-32.
pub const FRAME_HEADER_LEN: usize = 5;

/// CHUNK fields preceding the payload: 8 byte sequence + 1 byte flags.
pub const CHUNK_FIELDS_LEN: usize = 9;

/// Longest file name an OFFER may carry, in bytes.
pub const MAX_FILE_NAME_LEN: usize = 255;

/// Length of the whole-file SHA-256 digest carried in an OFFER.
pub const FILE_DIGEST_LEN: usize = 32;

/// Size of the largest OFFER body.
pub const MAX_OFFER_LEN: usize =
    FRAME_HEADER_LEN + 16 + 8 + FILE_DIGEST_LEN + 4 + 2 + MAX_FILE_NAME_LEN;

/// Largest frame body a peer may send when chunks hold at most `chunk_size` bytes.
pub const fn max_frame_len(chunk_size: usize) -> usize {
    let chunk_frame = FRAME_HEADER_LEN + CHUNK_FIELDS_LEN + chunk_size;
    if chunk_frame > MAX_OFFER_LEN {
        chunk_frame
    } else {
        MAX_OFFER_LEN
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_frame_len_covers_offer_for_tiny_chunks() {
        assert_eq!(max_frame_len(1), MAX_OFFER_LEN);
    }

    #[test]
    fn max_frame_len_grows_with_chunk_size() {
        assert_eq!(max_frame_len(4096), 4096 + FRAME_HEADER_LEN + CHUNK_FIELDS_LEN);
    }
}
