//! Command dispatch.

use std::path::Path;

use anyhow::Context;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use chunkferry_transfer::{TransferConfig, TransferProgress, TransferServer, send_file};

use crate::cli::Command;
use crate::config::Config;
use crate::test_file::create_test_file;

/// Runs one command to completion.
pub async fn run(command: Command, config: Config) -> anyhow::Result<()> {
    match command {
        Command::Serve {
            listen,
            output_dir,
            simulate_errors,
        } => {
            let mut transfer = config.transfer_config(simulate_errors);
            if let Some(dir) = output_dir {
                transfer.output_dir = dir;
            }
            let addr = listen.unwrap_or(config.listen);
            serve(&addr, transfer).await
        }
        Command::Send {
            file,
            server,
            chunk_size,
            simulate_errors,
        } => {
            let mut transfer = config.transfer_config(simulate_errors);
            if let Some(size) = chunk_size {
                transfer.chunk_size = size;
            }
            let addr = server.unwrap_or(config.server);
            send(&addr, &file, transfer).await
        }
        Command::CreateTestFile { name, size_kb } => {
            let bytes = create_test_file(&name, size_kb)
                .with_context(|| format!("writing {}", name.display()))?;
            tracing::info!(path = %name.display(), bytes, "test file created");
            Ok(())
        }
    }
}

async fn serve(addr: &str, config: TransferConfig) -> anyhow::Result<()> {
    let cancel = CancellationToken::new();
    if config.faults.enabled {
        tracing::warn!(
            drop = config.faults.drop_probability,
            corrupt = config.faults.corrupt_probability,
            "error simulation enabled"
        );
    }

    let server = TransferServer::bind(addr, config, cancel.clone())
        .await
        .with_context(|| format!("binding {addr}"))?;
    let server_task = tokio::spawn(server.run());

    tokio::signal::ctrl_c().await?;
    tracing::info!("SIGINT received, shutting down");
    cancel.cancel();

    server_task.await??;
    Ok(())
}

async fn send(addr: &str, path: &Path, config: TransferConfig) -> anyhow::Result<()> {
    let cancel = CancellationToken::new();
    let ctrl_c_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("SIGINT received, cancelling transfer");
            ctrl_c_cancel.cancel();
        }
    });

    let (progress_tx, progress_rx) = mpsc::channel(64);
    let progress_task = tokio::spawn(log_progress(progress_rx));

    let result = send_file(addr, path, &config, cancel, Some(progress_tx)).await;
    let _ = progress_task.await;

    let report = result.with_context(|| format!("sending {} to {addr}", path.display()))?;
    tracing::info!(
        file = %report.file_name,
        bytes = report.bytes_sent,
        chunks = report.chunks,
        retries = report.retries,
        elapsed_ms = report.elapsed.as_millis() as u64,
        "file sent successfully"
    );
    Ok(())
}

/// Logs every tenth of the transfer.
async fn log_progress(mut rx: mpsc::Receiver<TransferProgress>) {
    let mut last_decile = 0;
    while let Some(progress) = rx.recv().await {
        let decile = (progress.bytes_acked * 10)
            .checked_div(progress.total_bytes)
            .unwrap_or(10);
        if decile > last_decile {
            last_decile = decile;
            tracing::info!(
                sequence = progress.sequence,
                bytes = progress.bytes_acked,
                total = progress.total_bytes,
                "{}% sent",
                decile * 10
            );
        }
    }
}
