//! Sending side of a transfer.
//!
//! State machine:
//!
//! ```text
//! Establishing -> SendingChunk -> AwaitingAck -> SendingChunk   (ack OK, more chunks)
//!                                             -> Completed      (ack OK, final chunk)
//!                                             -> Retrying -> AwaitingAck
//!                                             -> Failed         (retries exhausted)
//! ```
//!
//! Exactly one frame is unacknowledged at any time. Every retransmission
//! of the same frame bumps its retry counter; the counter resets when a new
//! sequence is acknowledged.

use std::path::Path;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use chunkferry_protocol::{AckStatus, Frame, FrameType, Offer};

use crate::chunked::{ChunkReader, calculate_file_digest};
use crate::config::TransferConfig;
use crate::transport::FrameTransport;
use crate::{TCP_CONNECT_TIMEOUT, TransferError};

/// Position of a [`SenderSession`] in its state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SenderState {
    Establishing,
    SendingChunk,
    AwaitingAck,
    Retrying,
    Completed,
    Failed,
}

/// Emitted after every acknowledged chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferProgress {
    pub transfer_id: Uuid,
    pub sequence: u64,
    pub bytes_acked: u64,
    pub total_bytes: u64,
}

/// Summary of a completed transfer.
#[derive(Debug, Clone)]
pub struct TransferReport {
    pub transfer_id: Uuid,
    pub file_name: String,
    pub bytes_sent: u64,
    pub chunks: u64,
    /// Retransmissions across the whole transfer.
    pub retries: u64,
    pub elapsed: Duration,
}

/// Outcome of waiting for the reply to one transmission.
enum Reply {
    Acked,
    /// The frame must be sent again; carries the recoverable cause.
    Retry(TransferError),
}

/// Owns one outbound transfer.
pub struct SenderSession {
    config: TransferConfig,
    transfer_id: Uuid,
    file_name: String,
    file_digest: [u8; chunkferry_protocol::FILE_DIGEST_LEN],
    reader: ChunkReader,
    state: SenderState,
    expected_next_sequence: u64,
    bytes_acked: u64,
    total_retries: u64,
    cancel: CancellationToken,
    progress_tx: Option<mpsc::Sender<TransferProgress>>,
}

impl SenderSession {
    /// Prepares a transfer of `path`: hashes the file and opens it for
    /// chunked reading.
    pub async fn open(path: &Path, config: TransferConfig) -> Result<Self, TransferError> {
        config.validate()?;

        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| {
                TransferError::InvalidPath(format!("no file name in {}", path.display()))
            })?
            .to_string();
        if file_name.len() > chunkferry_protocol::MAX_FILE_NAME_LEN {
            return Err(chunkferry_protocol::EncodeError::FileNameTooLong(file_name.len()).into());
        }

        let file_digest = calculate_file_digest(path).await?;
        let reader = ChunkReader::open(path, config.chunk_size).await?;

        Ok(Self {
            config,
            transfer_id: Uuid::new_v4(),
            file_name,
            file_digest,
            reader,
            state: SenderState::Establishing,
            expected_next_sequence: 0,
            bytes_acked: 0,
            total_retries: 0,
            cancel: CancellationToken::new(),
            progress_tx: None,
        })
    }

    /// Aborts the transfer with [`TransferError::Cancelled`] when `cancel` fires.
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Reports progress after each acknowledged chunk (non-blocking).
    pub fn with_progress(mut self, progress_tx: mpsc::Sender<TransferProgress>) -> Self {
        self.progress_tx = Some(progress_tx);
        self
    }

    pub fn transfer_id(&self) -> Uuid {
        self.transfer_id
    }

    pub fn state(&self) -> SenderState {
        self.state
    }

    /// Runs the transfer to completion or failure, then closes the connection.
    ///
    /// Afterwards [`state`](Self::state) reports `Completed` or `Failed`.
    pub async fn run<S>(
        &mut self,
        transport: &mut FrameTransport<S>,
    ) -> Result<TransferReport, TransferError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let started = Instant::now();
        let result = self.drive(transport).await;
        let _ = transport.close().await;

        match result {
            Ok(chunks) => {
                self.state = SenderState::Completed;
                let report = TransferReport {
                    transfer_id: self.transfer_id,
                    file_name: self.file_name.clone(),
                    bytes_sent: self.bytes_acked,
                    chunks,
                    retries: self.total_retries,
                    elapsed: started.elapsed(),
                };
                info!(
                    transfer_id = %report.transfer_id,
                    bytes = report.bytes_sent,
                    chunks = report.chunks,
                    retries = report.retries,
                    "transfer completed"
                );
                Ok(report)
            }
            Err(e) => {
                self.state = SenderState::Failed;
                warn!(transfer_id = %self.transfer_id, "transfer failed: {e}");
                Err(e)
            }
        }
    }

    /// Returns the number of chunks delivered.
    async fn drive<S>(&mut self, transport: &mut FrameTransport<S>) -> Result<u64, TransferError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let offer = Frame::Offer(Offer {
            transfer_id: self.transfer_id,
            file_name: self.file_name.clone(),
            file_size: self.reader.file_size(),
            file_digest: self.file_digest,
            retry_window: self.config.retry_window(),
        });
        info!(
            transfer_id = %self.transfer_id,
            file = %self.file_name,
            size = self.reader.file_size(),
            chunks = self.reader.chunk_count(),
            digest = %hex::encode(self.file_digest),
            "offering transfer"
        );
        self.deliver(transport, &offer).await?;

        while let Some(chunk) = self.reader.next_chunk().await? {
            let sequence = chunk.sequence;
            let len = chunk.payload.len() as u64;
            let is_final = chunk.is_final;

            self.deliver(transport, &Frame::Chunk(chunk)).await?;

            self.expected_next_sequence = sequence + 1;
            self.bytes_acked += len;
            if let Some(tx) = &self.progress_tx {
                let _ = tx.try_send(TransferProgress {
                    transfer_id: self.transfer_id,
                    sequence,
                    bytes_acked: self.bytes_acked,
                    total_bytes: self.reader.file_size(),
                });
            }
            if is_final {
                return Ok(self.expected_next_sequence);
            }
        }

        Err(TransferError::ProtocolViolation(
            "reader ended without a final chunk".into(),
        ))
    }

    /// Sends `frame` until it is acknowledged or its retries run out.
    async fn deliver<S>(
        &mut self,
        transport: &mut FrameTransport<S>,
        frame: &Frame,
    ) -> Result<(), TransferError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut retries: u32 = 0;
        loop {
            if !matches!(self.state, SenderState::Establishing) {
                self.state = if retries == 0 {
                    SenderState::SendingChunk
                } else {
                    SenderState::Retrying
                };
            }
            transport.send(frame).await?;

            let timeout = self.config.backoff.timeout_for(self.config.ack_timeout, retries);
            if !matches!(self.state, SenderState::Establishing) {
                self.state = SenderState::AwaitingAck;
            }

            match self.await_reply(transport, frame, timeout).await? {
                Reply::Acked => {
                    if matches!(frame, Frame::Offer(_)) {
                        debug!(transfer_id = %self.transfer_id, "offer accepted");
                        self.state = SenderState::SendingChunk;
                    }
                    return Ok(());
                }
                Reply::Retry(reason) => {
                    retries += 1;
                    self.total_retries += 1;
                    if retries > self.config.max_retries {
                        return Err(match frame {
                            Frame::Chunk(chunk) => TransferError::MaxRetriesExceeded {
                                sequence: chunk.sequence,
                                retries: self.config.max_retries,
                            },
                            _ => TransferError::HandshakeFailed {
                                retries: self.config.max_retries,
                            },
                        });
                    }
                    warn!(
                        frame_type = %frame.frame_type(),
                        sequence = self.expected_next_sequence,
                        retry = retries,
                        "resending: {reason}"
                    );
                }
            }
        }
    }

    /// Waits up to `timeout` for the reply to `sent`, skipping stale frames.
    async fn await_reply<S>(
        &self,
        transport: &mut FrameTransport<S>,
        sent: &Frame,
        timeout: Duration,
    ) -> Result<Reply, TransferError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let received = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(TransferError::Cancelled),
                result = tokio::time::timeout_at(deadline, transport.recv()) => result,
            };

            let frame = match received {
                Err(_) => return Ok(Reply::Retry(TransferError::Timeout)),
                Ok(Err(e)) if e.is_recoverable() => {
                    debug!("damaged reply: {e}");
                    return Ok(Reply::Retry(e));
                }
                Ok(Err(e)) => return Err(e),
                Ok(Ok(frame)) => frame,
            };

            if let Some(reply) = self.classify(sent, frame)? {
                return Ok(reply);
            }
        }
    }

    /// Maps a received frame to a reply for `sent`, or `None` if it is stale.
    fn classify(&self, sent: &Frame, received: Frame) -> Result<Option<Reply>, TransferError> {
        match (sent, received) {
            (Frame::Offer(offer), Frame::Accept { transfer_id }) => {
                if transfer_id == offer.transfer_id {
                    Ok(Some(Reply::Acked))
                } else {
                    Err(TransferError::ProtocolViolation(format!(
                        "accept for unknown transfer {transfer_id}"
                    )))
                }
            }
            // Duplicate accept for a retransmitted offer.
            (Frame::Chunk(_), Frame::Accept { transfer_id }) if transfer_id == self.transfer_id => {
                Ok(None)
            }
            (Frame::Chunk(chunk), Frame::Ack(ack)) => {
                let current = chunk.sequence;
                if ack.sequence == current {
                    return Ok(Some(match ack.status {
                        AckStatus::Ok => Reply::Acked,
                        AckStatus::ChecksumMismatch => {
                            Reply::Retry(TransferError::ChecksumMismatch {
                                frame_type: FrameType::Chunk,
                                sequence: Some(current),
                            })
                        }
                        AckStatus::OutOfOrder => Reply::Retry(TransferError::OutOfOrder {
                            sequence: current,
                            expected: ack.sequence,
                        }),
                    }));
                }
                if ack.sequence < current {
                    debug!(ack = ack.sequence, current, status = %ack.status, "ignoring stale ack");
                    return Ok(None);
                }
                match ack.status {
                    // The sequence of a negative ack for a damaged chunk is unreliable.
                    AckStatus::ChecksumMismatch => Ok(None),
                    status => Err(TransferError::ProtocolViolation(format!(
                        "{status} ack for chunk {} while chunk {current} is in flight",
                        ack.sequence
                    ))),
                }
            }
            (sent, received) => Err(TransferError::ProtocolViolation(format!(
                "unexpected {} frame while awaiting reply to {}",
                received.frame_type(),
                sent.frame_type()
            ))),
        }
    }
}

/// Connects to `addr` and transfers `path` using `config`.
///
/// Fault injection follows `config.faults`.
pub async fn send_file(
    addr: &str,
    path: &Path,
    config: &TransferConfig,
    cancel: CancellationToken,
    progress_tx: Option<mpsc::Sender<TransferProgress>>,
) -> Result<TransferReport, TransferError> {
    let mut session = SenderSession::open(path, config.clone())
        .await?
        .with_cancel(cancel.clone());
    if let Some(tx) = progress_tx {
        session = session.with_progress(tx);
    }

    let stream = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(TransferError::Cancelled),
        result = tokio::time::timeout(TCP_CONNECT_TIMEOUT, TcpStream::connect(addr)) => {
            match result {
                Ok(Ok(s)) => {
                    info!(%addr, "connected to server");
                    s
                }
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => return Err(TransferError::Timeout),
            }
        }
    };
    stream.set_nodelay(true)?;

    let mut transport =
        FrameTransport::new(stream, config.max_frame_len(), config.fault_policy(0));
    session.run(&mut transport).await
}
