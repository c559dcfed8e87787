//! Command line definition.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Reliable chunked file transfer over TCP.
#[derive(Debug, Parser)]
#[command(name = "chunkferry", version, about)]
pub struct Cli {
    /// TOML configuration file (default: ./chunkferry.toml when present)
    #[arg(short = 'c', long = "config", value_name = "FILE", global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Receive files until interrupted
    Serve {
        /// Address to listen on
        #[arg(short = 'l', long = "listen", value_name = "ADDR")]
        listen: Option<String>,

        /// Directory received files are written to
        #[arg(short = 'o', long = "output-dir", value_name = "DIR")]
        output_dir: Option<PathBuf>,

        /// Randomly drop, corrupt and delay frames
        #[arg(long = "simulate-errors")]
        simulate_errors: bool,
    },

    /// Send one file to a server
    Send {
        /// File to send
        file: PathBuf,

        /// Server address
        #[arg(short = 's', long = "server", value_name = "ADDR")]
        server: Option<String>,

        /// Chunk size in bytes
        #[arg(long = "chunk-size", value_name = "BYTES")]
        chunk_size: Option<usize>,

        /// Randomly drop, corrupt and delay frames
        #[arg(long = "simulate-errors")]
        simulate_errors: bool,
    },

    /// Write a text file of repeated lines for trying out transfers
    CreateTestFile {
        /// Output file name
        #[arg(default_value = "test_data.txt")]
        name: PathBuf,

        /// Size in KiB
        #[arg(long = "size-kb", default_value = "10")]
        size_kb: u64,
    },
}
