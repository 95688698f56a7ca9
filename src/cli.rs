//! CLI struct definitions for the signbot command-line interface.
//!
//! All clap-derived types live here. Dispatch logic lives in `lib.rs`.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[clap(
    name = "signbot",
    version = env!("CARGO_PKG_VERSION"),
    about = concat!(
        "Signbot replays a request's review thread, decides which categories are signed, ",
        "and writes labels and its own cache back to the thread."
    )
)]
pub(crate) struct Cli {
    #[clap(subcommand)]
    pub command: Command,
}

#[derive(clap::Args, Debug)]
pub(crate) struct SourceArgs {
    /// Bot configuration (TOML).
    #[clap(long, default_value = "signbot.toml")]
    pub config: PathBuf,
    /// Recorded forge state (JSON). Updated in place unless --dry-run.
    #[clap(long)]
    pub recording: PathBuf,
    /// Compute everything, write nothing.
    #[clap(long)]
    pub dry_run: bool,
    /// Output format: 'text' or 'json'.
    #[clap(long, default_value = "text")]
    pub format: String,
}

#[derive(Subcommand, Debug)]
pub(crate) enum Command {
    /// Process one request
    Process {
        #[clap(flatten)]
        source: SourceArgs,
        /// Request number
        #[clap(long)]
        request: u64,
    },
    /// Process several requests on a bounded worker pool
    Batch {
        #[clap(flatten)]
        source: SourceArgs,
        /// Worker threads
        #[clap(long, default_value_t = 4)]
        jobs: usize,
        /// Request numbers; every recorded request when omitted
        requests: Vec<u64>,
    },
    /// Decode and print the cache stored in a request's thread
    Inspect {
        #[clap(long, default_value = "signbot.toml")]
        config: PathBuf,
        #[clap(long)]
        recording: PathBuf,
        #[clap(long)]
        request: u64,
    },
    /// Check a configuration file and print what it defines
    ValidateConfig {
        #[clap(long, default_value = "signbot.toml")]
        config: PathBuf,
    },
}
