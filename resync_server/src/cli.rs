use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "resync", version, about = "Incremental resource sync engine")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Serve webhooks and on-demand resyncs; run the scheduler in the background
    /// (default if no subcommand given).
    Serve {
        #[arg(long, default_value = "0.0.0.0")]
        host: String,
        #[arg(long, default_value = "8000")]
        port: u16,
        /// Integration config (YAML or JSON).
        #[arg(long, env = "RESYNC_CONFIG", default_value = "resync.yaml")]
        config: PathBuf,
    },

    /// Run one resync round and exit. Non-zero exit if any pass failed.
    Resync {
        #[arg(long, env = "RESYNC_CONFIG", default_value = "resync.yaml")]
        config: PathBuf,
        /// Only this provider (e.g. `gitlab`).
        #[arg(long)]
        provider: Option<String>,
        /// Only this kind (e.g. `mergeRequest`); requires `--provider`.
        #[arg(long, requires = "provider")]
        kind: Option<String>,
    },

    /// Print the effective configuration with credentials redacted.
    CheckConfig {
        #[arg(long, env = "RESYNC_CONFIG", default_value = "resync.yaml")]
        config: PathBuf,
    },
}
