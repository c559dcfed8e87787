//! Length-delimited frame transport over a byte stream.
//!
//! # Wire format
//!
//! ```text
//! [4 bytes BE: body_len][body_len bytes: frame body]
//! ```
//!
//! Bodies are produced and parsed by [`chunkferry_protocol::codec`]. The
//! configured [`FaultPolicy`] is applied to each body after encoding on the
//! way out and before decoding on the way in.

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::debug;

use chunkferry_protocol::{Frame, LENGTH_PREFIX_LEN, codec};

use crate::TransferError;
use crate::fault::{Direction, FaultAction, FaultPolicy};

/// Frame-level view of one connection.
pub struct FrameTransport<S> {
    framed: Framed<S, LengthDelimitedCodec>,
    faults: Box<dyn FaultPolicy>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> FrameTransport<S> {
    /// Wraps `stream`, rejecting any incoming body longer than `max_frame_len`.
    pub fn new(stream: S, max_frame_len: usize, faults: Box<dyn FaultPolicy>) -> Self {
        let codec = LengthDelimitedCodec::builder()
            .length_field_length(LENGTH_PREFIX_LEN)
            .max_frame_length(max_frame_len)
            .new_codec();
        Self {
            framed: Framed::new(stream, codec),
            faults,
        }
    }

    /// Encodes and writes one frame, flushing the stream.
    pub async fn send(&mut self, frame: &Frame) -> Result<(), TransferError> {
        let mut body = codec::encode(frame)?;
        match self.faults.apply(Direction::Outbound, &mut body) {
            FaultAction::Pass => {}
            FaultAction::Drop => {
                debug!(frame_type = %frame.frame_type(), "outbound frame dropped by fault policy");
                return Ok(());
            }
            FaultAction::Corrupt => {
                debug!(
                    frame_type = %frame.frame_type(),
                    "outbound frame corrupted by fault policy"
                );
            }
            FaultAction::Delay(delay) => tokio::time::sleep(delay).await,
        }
        self.framed.send(Bytes::from(body)).await?;
        Ok(())
    }

    /// Reads and decodes the next frame.
    ///
    /// Cancel-safe while waiting for bytes: partially received frames stay
    /// buffered, so wrapping this in a timeout never desynchronises the
    /// stream. A frame delayed by the fault policy is lost if the call is
    /// cancelled during the delay, which is indistinguishable from a drop.
    pub async fn recv(&mut self) -> Result<Frame, TransferError> {
        loop {
            let mut body = match self.framed.next().await {
                Some(Ok(body)) => body,
                Some(Err(e)) if e.kind() == std::io::ErrorKind::InvalidData => {
                    return Err(TransferError::Malformed(e.to_string()));
                }
                Some(Err(e)) => return Err(e.into()),
                None => return Err(TransferError::ConnectionClosed),
            };

            match self.faults.apply(Direction::Inbound, &mut body) {
                FaultAction::Pass => {}
                FaultAction::Drop => {
                    debug!(len = body.len(), "inbound frame dropped by fault policy");
                    continue;
                }
                FaultAction::Corrupt => {
                    debug!(len = body.len(), "inbound frame corrupted by fault policy");
                }
                FaultAction::Delay(delay) => tokio::time::sleep(delay).await,
            }

            return codec::decode(&body).map_err(TransferError::from);
        }
    }

    /// Flushes pending writes and shuts down the write half.
    pub async fn close(&mut self) -> Result<(), TransferError> {
        SinkExt::<Bytes>::close(&mut self.framed).await?;
        Ok(())
    }
}
