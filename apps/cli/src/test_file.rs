//! Test data generation.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use anyhow::Context;

/// Line repeated to fill generated test files.
pub const TEST_LINE: &str = "Hello, this is a test file for the file transfer system!\n";

/// Writes a `size_kb` KiB test file to `path` and returns its length.
///
/// The content is `TEST_LINE` repeated, with the last copy truncated.
pub fn create_test_file(path: &Path, size_kb: u64) -> anyhow::Result<u64> {
    let len = size_kb
        .checked_mul(1024)
        .with_context(|| format!("{size_kb} KiB does not fit in a 64-bit byte count"))?;

    let mut out = BufWriter::new(File::create(path)?);
    let line = TEST_LINE.as_bytes();
    let mut remaining = len;
    while remaining > 0 {
        let n = remaining.min(line.len() as u64) as usize;
        out.write_all(&line[..n])?;
        remaining -= n as u64;
    }
    out.flush()?;
    Ok(len)
}
