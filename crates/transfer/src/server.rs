//! TCP accept loop running one [`ReceiverSession`] per connection.

use std::net::SocketAddr;

use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{MAX_CHUNK_SIZE, TransferError};
use crate::config::TransferConfig;
use crate::receiver::{ReceiveReport, ReceiverSession};
use crate::transport::FrameTransport;

/// Result of one connection, reported to observers.
#[derive(Debug)]
pub struct SessionOutcome {
    pub peer: SocketAddr,
    pub result: Result<ReceiveReport, TransferError>,
}

/// Receives files on a bound TCP listener until cancelled.
pub struct TransferServer {
    listener: TcpListener,
    config: TransferConfig,
    cancel: CancellationToken,
    outcomes: Option<mpsc::Sender<SessionOutcome>>,
}

impl TransferServer {
    /// Validates `config`, creates its output directory and binds `addr`.
    pub async fn bind(
        addr: impl ToSocketAddrs,
        config: TransferConfig,
        cancel: CancellationToken,
    ) -> Result<Self, TransferError> {
        config.validate()?;
        tokio::fs::create_dir_all(&config.output_dir).await.map_err(|e| {
            TransferError::DestinationWrite(format!(
                "create output directory {}: {e}",
                config.output_dir.display()
            ))
        })?;

        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            config,
            cancel,
            outcomes: None,
        })
    }

    /// Publishes the outcome of every session on `tx`.
    pub fn with_outcomes(mut self, tx: mpsc::Sender<SessionOutcome>) -> Self {
        self.outcomes = Some(tx);
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TransferError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accepts connections until the cancellation token fires.
    ///
    /// Session failures are logged and never stop the loop.
    pub async fn run(self) -> Result<(), TransferError> {
        let local_addr = self.listener.local_addr()?;
        info!(
            %local_addr,
            output_dir = %self.config.output_dir.display(),
            faults = self.config.faults.enabled,
            "transfer server listening"
        );

        let mut connections: u64 = 0;
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("server shutting down");
                    break Ok(());
                }

                result = self.listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            let connection = connections;
                            connections += 1;
                            tokio::spawn(serve_connection(
                                stream,
                                peer,
                                connection,
                                self.config.clone(),
                                self.cancel.clone(),
                                self.outcomes.clone(),
                            ));
                        }
                        Err(e) => {
                            warn!("accept error: {e}");
                        }
                    }
                }
            }
        }
    }
}

/// Runs one session and reports how it ended.
async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    connection: u64,
    config: TransferConfig,
    cancel: CancellationToken,
    outcomes: Option<mpsc::Sender<SessionOutcome>>,
) {
    let result = handle_connection(stream, peer, connection, config, cancel).await;
    match &result {
        Ok(report) => info!(
            %peer,
            destination = %report.destination.display(),
            bytes = report.bytes_written,
            "session completed"
        ),
        Err(e) => error!(%peer, "session failed: {e}"),
    }
    if let Some(tx) = outcomes {
        let _ = tx.send(SessionOutcome { peer, result }).await;
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    connection: u64,
    config: TransferConfig,
    cancel: CancellationToken,
) -> Result<ReceiveReport, TransferError> {
    info!(%peer, connection, "connection accepted");
    stream.set_nodelay(true)?;

    // Senders pick their own chunk size, so accept anything up to the hard cap.
    let max_frame_len = chunkferry_protocol::max_frame_len(MAX_CHUNK_SIZE);
    let faults = config.fault_policy(connection);
    let mut transport = FrameTransport::new(stream, max_frame_len, faults);
    let mut session = ReceiverSession::new(config);

    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(TransferError::Cancelled),
        result = session.run(&mut transport) => result,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn bind_creates_output_dir() {
        let dir = TempDir::new().unwrap();
        let output_dir = dir.path().join("nested").join("out");
        let config = TransferConfig {
            output_dir: output_dir.clone(),
            ..Default::default()
        };

        let server = TransferServer::bind("127.0.0.1:0", config, CancellationToken::new())
            .await
            .unwrap();
        assert!(output_dir.is_dir());
        assert_ne!(server.local_addr().unwrap().port(), 0);
    }

    #[tokio::test]
    async fn bind_rejects_invalid_config() {
        let config = TransferConfig {
            chunk_size: 0,
            ..Default::default()
        };
        let result = TransferServer::bind("127.0.0.1:0", config, CancellationToken::new()).await;
        assert!(matches!(result, Err(TransferError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn run_stops_on_cancel() {
        let dir = TempDir::new().unwrap();
        let config = TransferConfig {
            output_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        let cancel = CancellationToken::new();
        let server = TransferServer::bind("127.0.0.1:0", config, cancel.clone())
            .await
            .unwrap();
        let handle = tokio::spawn(server.run());

        cancel.cancel();
        handle.await.unwrap().unwrap();
    }
}
