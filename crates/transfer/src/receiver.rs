//! Receiving side of a transfer.
//!
//! The receiver never retransmits on its own initiative: every frame it
//! sends is a reply to a frame it received. It is idempotent under
//! duplicates, so the sender can resend freely.

use std::path::PathBuf;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};
use uuid::Uuid;

use chunkferry_protocol::{Ack, AckStatus, Chunk, Frame, FrameType, Offer, TransferState};

use crate::TransferError;
use crate::chunked::DestinationWriter;
use crate::config::TransferConfig;
use crate::transport::FrameTransport;

/// Position of a [`ReceiverSession`] in its state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverState {
    WaitingForChunk,
    Processing,
    Completed,
    Failed,
}

/// What a receiver session produced.
#[derive(Debug, Clone)]
pub struct ReceiveReport {
    pub transfer_id: Uuid,
    pub file_name: String,
    pub destination: PathBuf,
    pub bytes_written: u64,
    /// Chunks received again after they had already been accepted.
    pub duplicates: u64,
    pub state: TransferState,
}

/// Serves exactly one connection.
pub struct ReceiverSession {
    config: TransferConfig,
    state: ReceiverState,
    offer: Option<Offer>,
    writer: Option<DestinationWriter>,
    destination: Option<PathBuf>,
    expected_next_sequence: u64,
    bytes_written: u64,
    duplicates: u64,
    failure: Option<TransferError>,
}

impl ReceiverSession {
    pub fn new(config: TransferConfig) -> Self {
        Self {
            config,
            state: ReceiverState::WaitingForChunk,
            offer: None,
            writer: None,
            destination: None,
            expected_next_sequence: 0,
            bytes_written: 0,
            duplicates: 0,
            failure: None,
        }
    }

    pub fn state(&self) -> ReceiverState {
        self.state
    }

    /// Overall transfer state as seen by the receiver.
    pub fn transfer_state(&self) -> TransferState {
        match self.state {
            ReceiverState::Completed => TransferState::Completed,
            ReceiverState::Failed => TransferState::Failed,
            _ if self.offer.is_none() => TransferState::Establishing,
            _ => TransferState::InProgress,
        }
    }

    /// Processes frames until the sender closes the connection or stays
    /// silent for longer than it could possibly still be retrying.
    ///
    /// The silence bound is the longer of this side's own retry window and
    /// the one the sender announces in its offer.
    ///
    /// A completed session keeps answering duplicates of the final chunk
    /// until then, so a lost final ack still lets the sender finish.
    pub async fn run<S>(
        &mut self,
        transport: &mut FrameTransport<S>,
    ) -> Result<ReceiveReport, TransferError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let ended_by = loop {
            let idle_limit = self.idle_limit();
            let received = match tokio::time::timeout(idle_limit, transport.recv()).await {
                Ok(received) => received,
                Err(_) => {
                    debug!(state = ?self.state, "peer idle for {idle_limit:?}");
                    break TransferError::Timeout;
                }
            };

            let result = match received {
                Ok(frame) => self.handle_frame(transport, frame).await,
                Err(TransferError::ChecksumMismatch {
                    frame_type: FrameType::Chunk,
                    sequence,
                }) => self.reject_damaged_chunk(transport, sequence).await,
                Err(e @ TransferError::ChecksumMismatch { .. }) => {
                    // The sender times out and resends.
                    debug!("discarding damaged frame: {e}");
                    Ok(())
                }
                Err(e) => Err(e),
            };

            if let Err(e) = result {
                break e;
            }
        };

        let _ = transport.close().await;
        self.finish(ended_by).await
    }

    fn idle_limit(&self) -> Duration {
        let own = self.config.retry_window();
        match &self.offer {
            Some(offer) => own.max(offer.retry_window),
            None => own,
        }
    }

    async fn finish(&mut self, ended_by: TransferError) -> Result<ReceiveReport, TransferError> {
        match self.state {
            ReceiverState::Completed => Ok(self.report()),
            ReceiverState::Failed => Err(self.failure.take().unwrap_or(ended_by)),
            _ => {
                if let Some(writer) = self.writer.take() {
                    writer.discard().await;
                }
                self.state = ReceiverState::Failed;
                if let Some(offer) = &self.offer {
                    warn!(
                        transfer_id = %offer.transfer_id,
                        received = self.expected_next_sequence,
                        "transfer abandoned: {ended_by}"
                    );
                }
                Err(ended_by)
            }
        }
    }

    fn report(&self) -> ReceiveReport {
        let (transfer_id, file_name) = self
            .offer
            .as_ref()
            .map(|o| (o.transfer_id, o.file_name.clone()))
            .unwrap_or_default();
        ReceiveReport {
            transfer_id,
            file_name,
            destination: self.destination.clone().unwrap_or_default(),
            bytes_written: self.bytes_written,
            duplicates: self.duplicates,
            state: self.transfer_state(),
        }
    }

    async fn handle_frame<S>(
        &mut self,
        transport: &mut FrameTransport<S>,
        frame: Frame,
    ) -> Result<(), TransferError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        if self.state == ReceiverState::Failed {
            debug!(frame_type = %frame.frame_type(), "draining frame after failure");
            return Ok(());
        }
        match frame {
            Frame::Offer(offer) => self.handle_offer(transport, offer).await,
            Frame::Chunk(chunk) => self.handle_chunk(transport, chunk).await,
            other => Err(TransferError::ProtocolViolation(format!(
                "receiver got a {} frame",
                other.frame_type()
            ))),
        }
    }

    async fn handle_offer<S>(
        &mut self,
        transport: &mut FrameTransport<S>,
        offer: Offer,
    ) -> Result<(), TransferError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let transfer_id = offer.transfer_id;
        if let Some(current) = &self.offer {
            if current.transfer_id != transfer_id {
                return Err(TransferError::ProtocolViolation(format!(
                    "second transfer {transfer_id} offered while {} is active",
                    current.transfer_id
                )));
            }
            debug!(%transfer_id, "repeated offer, accepting again");
            return transport.send(&Frame::Accept { transfer_id }).await;
        }

        let created =
            DestinationWriter::create(&self.config.output_dir, &offer.file_name, transfer_id).await;
        match created {
            Ok(writer) => {
                info!(
                    %transfer_id,
                    file = %offer.file_name,
                    size = offer.file_size,
                    destination = %writer.final_path().display(),
                    "accepting transfer"
                );
                self.writer = Some(writer);
                self.offer = Some(offer);
                transport.send(&Frame::Accept { transfer_id }).await
            }
            Err(e) => {
                warn!(%transfer_id, file = %offer.file_name, "rejecting transfer: {e}");
                self.offer = Some(offer);
                self.fail(e);
                Ok(())
            }
        }
    }

    async fn handle_chunk<S>(
        &mut self,
        transport: &mut FrameTransport<S>,
        chunk: Chunk,
    ) -> Result<(), TransferError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        if self.offer.is_none() {
            warn!(sequence = chunk.sequence, "chunk before any offer, ignoring");
            return Ok(());
        }

        let expected = self.expected_next_sequence;
        if chunk.sequence == expected && self.state == ReceiverState::WaitingForChunk {
            self.state = ReceiverState::Processing;
            match self.accept_chunk(&chunk).await {
                Ok(()) => {
                    self.state = if chunk.is_final {
                        ReceiverState::Completed
                    } else {
                        ReceiverState::WaitingForChunk
                    };
                    transport.send(&Frame::Ack(Ack::ok(chunk.sequence))).await
                }
                Err(
                    e @ (TransferError::DestinationWrite(_) | TransferError::DigestMismatch { .. }),
                ) => {
                    warn!(sequence = chunk.sequence, "transfer failed: {e}");
                    self.fail(e);
                    Ok(())
                }
                Err(e) => Err(e),
            }
        } else if expected > 0 && chunk.sequence == expected - 1 {
            self.duplicates += 1;
            debug!(sequence = chunk.sequence, "duplicate chunk, re-acknowledging");
            transport.send(&Frame::Ack(Ack::ok(chunk.sequence))).await
        } else {
            debug!(sequence = chunk.sequence, expected, "chunk out of order");
            transport
                .send(&Frame::Ack(Ack {
                    sequence: expected,
                    status: AckStatus::OutOfOrder,
                }))
                .await
        }
    }

    /// Writes an in-order chunk, publishing the file after the final one.
    async fn accept_chunk(&mut self, chunk: &Chunk) -> Result<(), TransferError> {
        let (file_size, file_digest) = match &self.offer {
            Some(offer) => (offer.file_size, offer.file_digest),
            None => return Err(TransferError::ProtocolViolation("chunk before offer".into())),
        };
        let len = chunk.payload.len() as u64;
        if self.bytes_written + len > file_size {
            return Err(TransferError::ProtocolViolation(format!(
                "chunk {} exceeds the offered size of {file_size} bytes",
                chunk.sequence
            )));
        }

        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| TransferError::DestinationWrite("no open destination".into()))?;
        writer.append(&chunk.payload).await?;
        self.bytes_written += len;
        self.expected_next_sequence += 1;
        debug!(sequence = chunk.sequence, bytes = len, "chunk written");

        if chunk.is_final {
            let writer = self
                .writer
                .take()
                .ok_or_else(|| TransferError::DestinationWrite("no open destination".into()))?;
            let destination = writer.finalize(file_size, &file_digest).await?;
            info!(
                destination = %destination.display(),
                bytes = self.bytes_written,
                chunks = self.expected_next_sequence,
                "file received"
            );
            self.destination = Some(destination);
        }
        Ok(())
    }

    /// Answers a chunk that failed its checksum. Nothing is written.
    async fn reject_damaged_chunk<S>(
        &mut self,
        transport: &mut FrameTransport<S>,
        sequence: Option<u64>,
    ) -> Result<(), TransferError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        if self.state == ReceiverState::Failed || self.offer.is_none() {
            return Ok(());
        }
        let sequence = sequence.unwrap_or(self.expected_next_sequence);
        debug!(sequence, "chunk failed checksum, requesting resend");
        transport
            .send(&Frame::Ack(Ack {
                sequence,
                status: AckStatus::ChecksumMismatch,
            }))
            .await
    }

    /// Enters the terminal failure state. The temporary file is removed and
    /// no further frames are acknowledged.
    fn fail(&mut self, error: TransferError) {
        self.writer = None;
        self.state = ReceiverState::Failed;
        self.failure = Some(error);
    }
}
