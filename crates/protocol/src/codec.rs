//! Frame body encoding and decoding.
//!
//! # Frame layout
//!
//! Every body starts with a common header. The transport adds a 4-byte
//! big-endian length prefix in front of each body, so the body itself
//! needs no outer length field.
//!
//! ```text
//! [1 byte : frame type]   0x01 CHUNK, 0x02 ACK, 0x03 OFFER, 0x04 ACCEPT
//! [4 bytes: CRC-32 BE]    IEEE CRC-32 over every byte that follows
//!
//! CHUNK : [8 bytes BE: sequence][1 byte: flags, bit 0 = final][payload: rest]
//! ACK   : [8 bytes BE: sequence][1 byte: status 0=OK 1=CHECKSUM_MISMATCH 2=OUT_OF_ORDER]
//! OFFER : [16 bytes: transfer id][8 bytes BE: file size][32 bytes: SHA-256]
//!         [4 bytes BE: sender retry window, ms]
//!         [2 bytes BE: name_len][name_len bytes: file name UTF-8]
//! ACCEPT: [16 bytes: transfer id]
//! ```
//!
//! The checksum is verified before any field is interpreted, so damage to
//! a length, flag or status byte surfaces as [`DecodeError::ChecksumMismatch`]
//! rather than as a misparsed frame.

use std::time::Duration;

use uuid::Uuid;

use crate::error::{DecodeError, EncodeError};
use crate::frame::{Ack, AckStatus, Chunk, Frame, FrameType, Offer};
use crate::{FILE_DIGEST_LEN, FRAME_HEADER_LEN, MAX_FILE_NAME_LEN};

/// IEEE CRC-32 over the concatenation of `parts`.
pub fn frame_checksum(parts: &[&[u8]]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize()
}

/// Serializes a frame into a body ready for the transport.
///
/// CHUNK frames carry the checksum stored in the [`Chunk`]; every other
/// frame has its checksum computed here.
pub fn encode(frame: &Frame) -> Result<Vec<u8>, EncodeError> {
    let mut body = Vec::with_capacity(FRAME_HEADER_LEN + 64);
    body.push(frame.frame_type() as u8);
    body.extend_from_slice(&[0u8; 4]);

    match frame {
        Frame::Chunk(chunk) => {
            body.reserve(crate::CHUNK_FIELDS_LEN + chunk.payload.len());
            body.extend_from_slice(&chunk.sequence.to_be_bytes());
            body.push(chunk.flags());
            body.extend_from_slice(&chunk.payload);
        }
        Frame::Ack(ack) => {
            body.extend_from_slice(&ack.sequence.to_be_bytes());
            body.push(ack.status as u8);
        }
        Frame::Offer(offer) => {
            let name = offer.file_name.as_bytes();
            if name.len() > MAX_FILE_NAME_LEN {
                return Err(EncodeError::FileNameTooLong(name.len()));
            }
            body.extend_from_slice(offer.transfer_id.as_bytes());
            body.extend_from_slice(&offer.file_size.to_be_bytes());
            body.extend_from_slice(&offer.file_digest);
            let window_ms = u32::try_from(offer.retry_window.as_millis()).unwrap_or(u32::MAX);
            body.extend_from_slice(&window_ms.to_be_bytes());
            body.extend_from_slice(&(name.len() as u16).to_be_bytes());
            body.extend_from_slice(name);
        }
        Frame::Accept { transfer_id } => {
            body.extend_from_slice(transfer_id.as_bytes());
        }
    }

    let checksum = match frame {
        Frame::Chunk(chunk) => chunk.checksum,
        _ => frame_checksum(&[&body[FRAME_HEADER_LEN..]]),
    };
    body[1..FRAME_HEADER_LEN].copy_from_slice(&checksum.to_be_bytes());
    Ok(body)
}

/// Parses a frame body produced by [`encode`].
pub fn decode(body: &[u8]) -> Result<Frame, DecodeError> {
    if body.len() < FRAME_HEADER_LEN {
        return Err(malformed(format!(
            "frame too short: need at least {FRAME_HEADER_LEN} bytes, got {}",
            body.len()
        )));
    }

    let frame_type = FrameType::try_from(body[0])
        .map_err(|tag| malformed(format!("unknown frame type {tag:#04x}")))?;
    let expected = u32::from_be_bytes([body[1], body[2], body[3], body[4]]);
    let fields = &body[FRAME_HEADER_LEN..];

    let actual = frame_checksum(&[fields]);
    if actual != expected {
        let sequence = match frame_type {
            FrameType::Chunk | FrameType::Ack => leading_u64(fields),
            FrameType::Offer | FrameType::Accept => None,
        };
        return Err(DecodeError::ChecksumMismatch {
            frame_type,
            sequence,
            expected,
            actual,
        });
    }

    let mut reader = Fields { buf: fields };
    let frame = match frame_type {
        FrameType::Chunk => {
            let sequence = reader.u64("sequence")?;
            let flags = reader.u8("flags")?;
            if flags & !0x01 != 0 {
                return Err(malformed(format!("unknown chunk flags {flags:#04x}")));
            }
            Frame::Chunk(Chunk {
                sequence,
                payload: reader.rest().to_vec(),
                checksum: expected,
                is_final: flags & 0x01 != 0,
            })
        }
        FrameType::Ack => {
            let sequence = reader.u64("sequence")?;
            let status = AckStatus::try_from(reader.u8("status")?)
                .map_err(|s| malformed(format!("unknown ack status {s}")))?;
            Frame::Ack(Ack { sequence, status })
        }
        FrameType::Offer => {
            let transfer_id = Uuid::from_bytes(reader.array::<16>("transfer id")?);
            let file_size = reader.u64("file size")?;
            let file_digest = reader.array::<FILE_DIGEST_LEN>("file digest")?;
            let retry_window = Duration::from_millis(reader.u32("retry window")?.into());
            let name_len = reader.u16("name length")? as usize;
            if name_len > MAX_FILE_NAME_LEN {
                return Err(malformed(format!(
                    "file name too long: {name_len} bytes (max {MAX_FILE_NAME_LEN})"
                )));
            }
            let file_name = String::from_utf8(reader.take(name_len, "file name")?.to_vec())
                .map_err(|e| malformed(format!("invalid UTF-8 file name: {e}")))?;
            Frame::Offer(Offer {
                transfer_id,
                file_name,
                file_size,
                file_digest,
                retry_window,
            })
        }
        FrameType::Accept => Frame::Accept {
            transfer_id: Uuid::from_bytes(reader.array::<16>("transfer id")?),
        },
    };

    if !reader.buf.is_empty() {
        return Err(malformed(format!(
            "{} trailing bytes after {frame_type} frame",
            reader.buf.len()
        )));
    }
    Ok(frame)
}

fn malformed(reason: String) -> DecodeError {
    DecodeError::MalformedFrame(reason)
}

fn leading_u64(bytes: &[u8]) -> Option<u64> {
    let head: [u8; 8] = bytes.get(..8)?.try_into().ok()?;
    Some(u64::from_be_bytes(head))
}

/// Forward-only cursor over frame fields.
struct Fields<'a> {
    buf: &'a [u8],
}

impl<'a> Fields<'a> {
    fn take(&mut self, n: usize, what: &str) -> Result<&'a [u8], DecodeError> {
        if self.buf.len() < n {
            return Err(malformed(format!(
                "truncated {what}: need {n} bytes, have {}",
                self.buf.len()
            )));
        }
        let (head, rest) = self.buf.split_at(n);
        self.buf = rest;
        Ok(head)
    }

    fn array<const N: usize>(&mut self, what: &str) -> Result<[u8; N], DecodeError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N, what)?);
        Ok(out)
    }

    fn u8(&mut self, what: &str) -> Result<u8, DecodeError> {
        Ok(self.take(1, what)?[0])
    }

    fn u16(&mut self, what: &str) -> Result<u16, DecodeError> {
        Ok(u16::from_be_bytes(self.array(what)?))
    }

    fn u32(&mut self, what: &str) -> Result<u32, DecodeError> {
        Ok(u32::from_be_bytes(self.array(what)?))
    }

    fn u64(&mut self, what: &str) -> Result<u64, DecodeError> {
        Ok(u64::from_be_bytes(self.array(what)?))
    }

    fn rest(&mut self) -> &'a [u8] {
        std::mem::take(&mut self.buf)
    }
}
