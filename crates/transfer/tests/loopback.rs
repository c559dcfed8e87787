//! End-to-end transfers over loopback TCP.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chunkferry_protocol::{Frame, decode};
use chunkferry_transfer::{
    Direction, FaultAction, FaultConfig, FaultPolicy, FrameTransport, ReceiverSession,
    SenderSession, SessionOutcome, TransferConfig, TransferError, TransferServer, send_file,
};
use tempfile::TempDir;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

fn fast_config(output_dir: &Path) -> TransferConfig {
    TransferConfig {
        ack_timeout: Duration::from_millis(100),
        output_dir: output_dir.to_path_buf(),
        ..Default::default()
    }
}

async fn start_server(
    config: TransferConfig,
) -> (SocketAddr, CancellationToken, mpsc::Receiver<SessionOutcome>) {
    let cancel = CancellationToken::new();
    let (tx, rx) = mpsc::channel(64);
    let server = TransferServer::bind("127.0.0.1:0", config, cancel.clone())
        .await
        .unwrap()
        .with_outcomes(tx);
    let addr = server.local_addr().unwrap();
    tokio::spawn(server.run());
    (addr, cancel, rx)
}

/// Deterministic content that is not a repetition of one chunk.
fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

fn write_source(dir: &Path, name: &str, data: &[u8]) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, data).unwrap();
    path
}

fn leftover_parts(dir: &Path) -> Vec<String> {
    std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .filter(|n| n.ends_with(".part"))
        .collect()
}

/// Drops frames matching a predicate, a limited number of times.
struct DropMatching<F> {
    direction: Direction,
    matches: F,
    remaining: usize,
}

impl<F> FaultPolicy for DropMatching<F>
where
    F: Fn(&Frame) -> bool + Send,
{
    fn apply(&mut self, direction: Direction, frame: &mut [u8]) -> FaultAction {
        if direction != self.direction || self.remaining == 0 {
            return FaultAction::Pass;
        }
        match decode(frame) {
            Ok(decoded) if (self.matches)(&decoded) => {
                self.remaining -= 1;
                FaultAction::Drop
            }
            _ => FaultAction::Pass,
        }
    }
}

#[tokio::test]
async fn round_trip_preserves_content() {
    let src = TempDir::new().unwrap();
    let out = TempDir::new().unwrap();
    let (addr, cancel, mut outcomes) = start_server(fast_config(out.path())).await;

    let cases: &[(usize, usize)] = &[
        (0, 4096),
        (1, 4096),
        (4095, 4096),
        (4096, 4096),
        (4097, 4096),
        (100_000, 4096),
        (10_000, 1000),
        (10_001, 1000),
        (64 * 1024, 16 * 1024),
    ];

    for (i, &(size, chunk_size)) in cases.iter().enumerate() {
        let data = pattern(size);
        let name = format!("file_{i}.bin");
        let path = write_source(src.path(), &name, &data);
        let config = TransferConfig {
            chunk_size,
            ..fast_config(out.path())
        };

        let report = send_file(&addr.to_string(), &path, &config, CancellationToken::new(), None)
            .await
            .unwrap_or_else(|e| panic!("size {size} chunk {chunk_size}: {e}"));
        assert_eq!(report.bytes_sent, size as u64);
        assert_eq!(report.chunks, size.div_ceil(chunk_size).max(1) as u64);
        assert_eq!(report.retries, 0);

        let outcome = outcomes.recv().await.unwrap();
        let received = outcome.result.unwrap();
        assert_eq!(received.destination, out.path().join(format!("received_{name}")));
        assert_eq!(std::fs::read(&received.destination).unwrap(), data);
    }

    assert!(leftover_parts(out.path()).is_empty());
    cancel.cancel();
}

#[tokio::test]
async fn nine_bytes_in_chunks_of_four() {
    let src = TempDir::new().unwrap();
    let out = TempDir::new().unwrap();
    let (addr, cancel, mut outcomes) = start_server(fast_config(out.path())).await;
    let path = write_source(src.path(), "abc.txt", b"ABCDEFGHI");

    let (tx, mut progress) = mpsc::channel(16);
    let config = TransferConfig {
        chunk_size: 4,
        ..fast_config(out.path())
    };
    let report = send_file(&addr.to_string(), &path, &config, CancellationToken::new(), Some(tx))
        .await
        .unwrap();
    assert_eq!(report.chunks, 3);

    let mut acked = Vec::new();
    while let Ok(p) = progress.try_recv() {
        acked.push((p.sequence, p.bytes_acked));
    }
    assert_eq!(acked, vec![(0, 4), (1, 8), (2, 9)]);

    let received = outcomes.recv().await.unwrap().result.unwrap();
    assert_eq!(std::fs::read(received.destination).unwrap(), b"ABCDEFGHI");
    cancel.cancel();
}

#[tokio::test]
async fn lost_ack_is_recovered_without_duplicating_bytes() {
    let src = TempDir::new().unwrap();
    let out = TempDir::new().unwrap();
    let data = pattern(10);
    let path = write_source(src.path(), "lost_ack.bin", &data);
    let config = TransferConfig {
        chunk_size: 4,
        ..fast_config(out.path())
    };

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let receiver_config = config.clone();
    let receiver = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        // The first ack for chunk 1 never reaches the sender.
        let policy = DropMatching {
            direction: Direction::Outbound,
            matches: |f: &Frame| matches!(f, Frame::Ack(ack) if ack.sequence == 1),
            remaining: 1,
        };
        let mut transport =
            FrameTransport::new(stream, receiver_config.max_frame_len(), Box::new(policy));
        let mut session = ReceiverSession::new(receiver_config);
        session.run(&mut transport).await
    });

    let report = send_file(&addr.to_string(), &path, &config, CancellationToken::new(), None)
        .await
        .unwrap();
    assert_eq!(report.chunks, 3);
    assert_eq!(report.retries, 1);

    let received = receiver.await.unwrap().unwrap();
    assert_eq!(received.duplicates, 1);
    assert_eq!(received.bytes_written, data.len() as u64);
    assert_eq!(std::fs::read(received.destination).unwrap(), data);
}

#[tokio::test]
async fn random_faults_never_corrupt_a_successful_transfer() {
    let src = TempDir::new().unwrap();
    let out = TempDir::new().unwrap();
    let server_config = TransferConfig {
        chunk_size: 1024,
        ack_timeout: Duration::from_millis(50),
        max_retries: 12,
        ..fast_config(out.path())
    };
    let (addr, cancel, mut outcomes) = start_server(server_config.clone()).await;

    for seed in 0..16u64 {
        let data = pattern(20 * 1024 + seed as usize);
        let name = format!("trial_{seed}.bin");
        let path = write_source(src.path(), &name, &data);
        let config = TransferConfig {
            faults: FaultConfig {
                enabled: true,
                drop_probability: 0.1,
                corrupt_probability: 0.1,
                max_delay: Duration::ZERO,
                seed: Some(seed),
            },
            ..server_config.clone()
        };

        let result =
            send_file(&addr.to_string(), &path, &config, CancellationToken::new(), None).await;
        let outcome = outcomes.recv().await.unwrap();

        match result {
            Ok(report) => {
                assert_eq!(report.bytes_sent, data.len() as u64);
                let received = outcome.result.unwrap();
                assert_eq!(
                    std::fs::read(&received.destination).unwrap(),
                    data,
                    "seed {seed} delivered different bytes"
                );
            }
            Err(e) => panic!("seed {seed}: transfer failed: {e}"),
        }
    }

    assert!(leftover_parts(out.path()).is_empty());
    cancel.cancel();
}

#[tokio::test]
async fn receiver_side_faults_never_corrupt_a_successful_transfer() {
    let src = TempDir::new().unwrap();
    let out = TempDir::new().unwrap();
    let sender_config = TransferConfig {
        chunk_size: 1024,
        ack_timeout: Duration::from_millis(50),
        max_retries: 12,
        ..fast_config(out.path())
    };
    // One seed for the whole server; each connection still sees its own
    // fault sequence.
    let server_config = TransferConfig {
        faults: FaultConfig {
            enabled: true,
            drop_probability: 0.1,
            corrupt_probability: 0.1,
            max_delay: Duration::ZERO,
            seed: Some(7),
        },
        ..sender_config.clone()
    };
    let (addr, cancel, mut outcomes) = start_server(server_config).await;

    let trials = 12u64;
    let mut delivered = 0;
    for trial in 0..trials {
        let data = pattern(8 * 1024 + trial as usize);
        let name = format!("inbound_{trial}.bin");
        let path = write_source(src.path(), &name, &data);

        let result =
            send_file(&addr.to_string(), &path, &sender_config, CancellationToken::new(), None)
                .await;
        let outcome = outcomes.recv().await.unwrap();

        if let Ok(report) = result {
            assert_eq!(report.bytes_sent, data.len() as u64);
            let received = outcome.result.unwrap();
            assert_eq!(
                std::fs::read(&received.destination).unwrap(),
                data,
                "trial {trial} delivered different bytes"
            );
            delivered += 1;
        }
    }

    assert!(delivered >= trials - 1, "only {delivered} of {trials} transfers completed");
    assert!(leftover_parts(out.path()).is_empty());
    cancel.cancel();
}

#[tokio::test]
async fn receiver_waits_for_a_slower_sender() {
    let src = TempDir::new().unwrap();
    let out = TempDir::new().unwrap();
    // The server alone would give up after 500ms of silence.
    let (addr, cancel, mut outcomes) = start_server(fast_config(out.path())).await;
    let data = pattern(10);
    let path = write_source(src.path(), "patient.bin", &data);

    let config = TransferConfig {
        chunk_size: 4,
        ack_timeout: Duration::from_millis(800),
        max_retries: 3,
        ..fast_config(out.path())
    };
    let mut session = SenderSession::open(&path, config.clone()).await.unwrap();
    let stream = TcpStream::connect(addr).await.unwrap();
    // The first transmission of chunk 1 is lost, so the sender stays
    // silent for a full 800ms ack timeout.
    let policy = DropMatching {
        direction: Direction::Outbound,
        matches: |f: &Frame| matches!(f, Frame::Chunk(c) if c.sequence == 1),
        remaining: 1,
    };
    let mut transport = FrameTransport::new(stream, config.max_frame_len(), Box::new(policy));
    let report = session.run(&mut transport).await.unwrap();
    drop(transport);

    assert_eq!(report.chunks, 3);
    assert_eq!(report.retries, 1);

    let received = outcomes.recv().await.unwrap().result.unwrap();
    assert_eq!(std::fs::read(received.destination).unwrap(), data);
    assert!(leftover_parts(out.path()).is_empty());
    cancel.cancel();
}

#[tokio::test]
async fn persistent_loss_fails_and_server_keeps_serving() {
    let src = TempDir::new().unwrap();
    let out = TempDir::new().unwrap();
    let config = TransferConfig {
        chunk_size: 4,
        max_retries: 2,
        ..fast_config(out.path())
    };
    let (addr, cancel, mut outcomes) = start_server(config.clone()).await;
    let path = write_source(src.path(), "doomed.txt", b"ABCDEFGHI");

    // Every transmission of chunk 1 is lost.
    let mut session = SenderSession::open(&path, config.clone()).await.unwrap();
    let stream = TcpStream::connect(addr).await.unwrap();
    let policy = DropMatching {
        direction: Direction::Outbound,
        matches: |f: &Frame| matches!(f, Frame::Chunk(c) if c.sequence == 1),
        remaining: usize::MAX,
    };
    let mut transport = FrameTransport::new(stream, config.max_frame_len(), Box::new(policy));
    let result = session.run(&mut transport).await;
    drop(transport);

    match result {
        Err(TransferError::MaxRetriesExceeded { sequence, retries }) => {
            assert_eq!(sequence, 1);
            assert_eq!(retries, 2);
        }
        other => panic!("expected MaxRetriesExceeded, got {other:?}"),
    }

    let failed = outcomes.recv().await.unwrap();
    assert!(failed.result.is_err());
    assert!(!out.path().join("received_doomed.txt").exists());
    assert!(leftover_parts(out.path()).is_empty());

    // The same server still accepts a clean transfer.
    let path = write_source(src.path(), "fine.txt", b"ABCDEFGHI");
    send_file(&addr.to_string(), &path, &config, CancellationToken::new(), None)
        .await
        .unwrap();
    let received = outcomes.recv().await.unwrap().result.unwrap();
    assert_eq!(std::fs::read(received.destination).unwrap(), b"ABCDEFGHI");
    cancel.cancel();
}

#[tokio::test]
async fn concurrent_transfers_are_independent() {
    let src = TempDir::new().unwrap();
    let out = TempDir::new().unwrap();
    let (addr, cancel, mut outcomes) = start_server(fast_config(out.path())).await;
    let addr = addr.to_string();

    let a = pattern(50_000);
    let b: Vec<u8> = pattern(30_000).into_iter().rev().collect();
    let path_a = write_source(src.path(), "a.bin", &a);
    let path_b = write_source(src.path(), "b.bin", &b);
    let config = fast_config(out.path());

    let (ra, rb) = tokio::join!(
        send_file(&addr, &path_a, &config, CancellationToken::new(), None),
        send_file(&addr, &path_b, &config, CancellationToken::new(), None),
    );
    ra.unwrap();
    rb.unwrap();

    for _ in 0..2 {
        outcomes.recv().await.unwrap().result.unwrap();
    }
    assert_eq!(std::fs::read(out.path().join("received_a.bin")).unwrap(), a);
    assert_eq!(std::fs::read(out.path().join("received_b.bin")).unwrap(), b);
    cancel.cancel();
}

#[tokio::test]
async fn connect_failure_is_reported() {
    let src = TempDir::new().unwrap();
    let path = write_source(src.path(), "x.txt", b"x");

    // Bind and immediately drop to get a port nobody listens on.
    let addr = TcpListener::bind("127.0.0.1:0").await.unwrap().local_addr().unwrap();
    let result = send_file(
        &addr.to_string(),
        &path,
        &TransferConfig::default(),
        CancellationToken::new(),
        None,
    )
    .await;
    assert!(matches!(result, Err(TransferError::Io(_))));
}

#[tokio::test]
async fn missing_source_file_is_an_error() {
    let src = TempDir::new().unwrap();
    let result =
        SenderSession::open(&src.path().join("absent.bin"), TransferConfig::default()).await;
    assert!(result.is_err());
}
