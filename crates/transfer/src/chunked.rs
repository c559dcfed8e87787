use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use uuid::Uuid;

use chunkferry_protocol::{Chunk, FILE_DIGEST_LEN};

use crate::validation::destination_file_name;
use crate::TransferError;

// ---------------------------------------------------------------------------
// Checksum helpers
// ---------------------------------------------------------------------------

/// Computes the SHA-256 of an entire file.
pub async fn calculate_file_digest(path: &Path) -> Result<[u8; FILE_DIGEST_LEN], TransferError> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize().into())
}

// ---------------------------------------------------------------------------
// ChunkReader
// ---------------------------------------------------------------------------

/// Reads a file forward in fixed-size, sequence-numbered chunks.
///
/// Every chunk except the last holds exactly `chunk_size` bytes. The last
/// one is flagged final; an empty file yields a single empty final chunk.
pub struct ChunkReader {
    file: tokio::fs::File,
    chunk_size: usize,
    offset: u64,
    file_size: u64,
    next_sequence: u64,
    finished: bool,
}

impl ChunkReader {
    /// Opens `path` for chunked reading.
    pub async fn open(path: &Path, chunk_size: usize) -> Result<Self, TransferError> {
        if chunk_size == 0 {
            return Err(TransferError::InvalidConfig("chunk size must be at least 1".into()));
        }
        let file = tokio::fs::File::open(path).await?;
        let file_size = file.metadata().await?.len();
        Ok(Self {
            file,
            chunk_size,
            offset: 0,
            file_size,
            next_sequence: 0,
            finished: false,
        })
    }

    /// Reads the next chunk. Returns `None` once the final chunk was produced.
    pub async fn next_chunk(&mut self) -> Result<Option<Chunk>, TransferError> {
        if self.finished {
            return Ok(None);
        }

        let len = self.remaining().min(self.chunk_size as u64) as usize;
        let mut payload = vec![0u8; len];
        self.file.read_exact(&mut payload).await?;
        self.offset += len as u64;

        let is_final = self.offset == self.file_size;
        let chunk = Chunk::new(self.next_sequence, payload, is_final);
        self.next_sequence += 1;
        self.finished = is_final;
        Ok(Some(chunk))
    }

    /// Number of chunks the whole file produces.
    pub fn chunk_count(&self) -> u64 {
        self.file_size.div_ceil(self.chunk_size as u64).max(1)
    }

    /// Total file size in bytes (taken when the file was opened).
    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    fn remaining(&self) -> u64 {
        self.file_size - self.offset
    }
}

// ---------------------------------------------------------------------------
// DestinationWriter
// ---------------------------------------------------------------------------

/// Appends accepted payloads to a temporary file and publishes it under the
/// destination name only after the whole file checks out.
///
/// A writer dropped before [`finalize`](Self::finalize) removes its
/// temporary file.
pub struct DestinationWriter {
    file: Option<BufWriter<tokio::fs::File>>,
    partial_path: PathBuf,
    final_path: PathBuf,
    hasher: Sha256,
    bytes_written: u64,
    finished: bool,
}

impl DestinationWriter {
    /// Creates `<output_dir>/.received_<name>.<id>.part`.
    pub async fn create(
        output_dir: &Path,
        declared_name: &str,
        transfer_id: Uuid,
    ) -> Result<Self, TransferError> {
        let file_name = destination_file_name(declared_name)
            .map_err(|e| TransferError::DestinationWrite(e.to_string()))?;
        let final_path = output_dir.join(&file_name);
        let partial_path = output_dir.join(format!(".{file_name}.{}.part", transfer_id.simple()));

        let file = tokio::fs::File::create(&partial_path).await.map_err(|e| {
            TransferError::DestinationWrite(format!("create {}: {e}", partial_path.display()))
        })?;

        Ok(Self {
            file: Some(BufWriter::new(file)),
            partial_path,
            final_path,
            hasher: Sha256::new(),
            bytes_written: 0,
            finished: false,
        })
    }

    /// Appends one payload.
    pub async fn append(&mut self, payload: &[u8]) -> Result<(), TransferError> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| TransferError::DestinationWrite("writer already closed".into()))?;
        file.write_all(payload).await.map_err(|e| {
            TransferError::DestinationWrite(format!("write {}: {e}", self.partial_path.display()))
        })?;
        self.hasher.update(payload);
        self.bytes_written += payload.len() as u64;
        Ok(())
    }

    /// Flushes, checks size and SHA-256, then renames into place.
    ///
    /// Any failure leaves no file under the destination name.
    pub async fn finalize(
        mut self,
        expected_size: u64,
        expected_digest: &[u8; FILE_DIGEST_LEN],
    ) -> Result<PathBuf, TransferError> {
        let mut file = self
            .file
            .take()
            .ok_or_else(|| TransferError::DestinationWrite("writer already closed".into()))?;
        file.flush().await.map_err(|e| {
            TransferError::DestinationWrite(format!("flush {}: {e}", self.partial_path.display()))
        })?;
        file.into_inner().sync_all().await.map_err(|e| {
            TransferError::DestinationWrite(format!("sync {}: {e}", self.partial_path.display()))
        })?;

        if self.bytes_written != expected_size {
            return Err(TransferError::DestinationWrite(format!(
                "size mismatch: offered {expected_size} bytes, received {}",
                self.bytes_written
            )));
        }

        let actual: [u8; FILE_DIGEST_LEN] = std::mem::take(&mut self.hasher).finalize().into();
        if &actual != expected_digest {
            return Err(TransferError::DigestMismatch {
                expected: hex::encode(expected_digest),
                actual: hex::encode(actual),
            });
        }

        tokio::fs::rename(&self.partial_path, &self.final_path)
            .await
            .map_err(|e| {
                TransferError::DestinationWrite(format!(
                    "rename to {}: {e}",
                    self.final_path.display()
                ))
            })?;
        self.finished = true;
        Ok(self.final_path.clone())
    }

    /// Closes and removes the temporary file.
    pub async fn discard(mut self) {
        drop(self.file.take());
        let _ = tokio::fs::remove_file(&self.partial_path).await;
        self.finished = true;
    }

    /// Path the file is published under once finalized.
    pub fn final_path(&self) -> &Path {
        &self.final_path
    }
}

impl Drop for DestinationWriter {
    fn drop(&mut self) {
        if !self.finished {
            let _ = std::fs::remove_file(&self.partial_path);
        }
    }
}
