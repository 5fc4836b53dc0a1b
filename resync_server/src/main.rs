use clap::Parser;
use resync_server::cli::{Cli, Commands};
use resync_server::commands;
use std::path::PathBuf;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // JSON stdout logs unless RESYNC_LOG_FORMAT=pretty; RUST_LOG filters.
    resync_core::o11y::init_tracing_from_env()?;
    let cli = Cli::parse();

    let cmd = cli.command.unwrap_or(Commands::Serve {
        host: "0.0.0.0".to_string(),
        port: 8000,
        config: PathBuf::from("resync.yaml"),
    });

    match cmd {
        Commands::Serve { host, port, config } => commands::serve(&host, port, &config).await,
        Commands::Resync {
            config,
            provider,
            kind,
        } => commands::resync(&config, provider, kind).await,
        Commands::CheckConfig { config } => commands::check_config(&config),
    }
}
