use anyhow::Result;
use clap::Parser;
use tracing::debug;

use tether_cli::cli::{Cli, Commands};
use tether_cli::{commands, logging};
use tether_client::ClientConfig;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    logging::init(cli.log_level, cli.verbose);

    // Load configuration with CLI overrides
    let mut config = ClientConfig::load(cli.config.as_deref())?;
    cli.apply_overrides(&mut config);
    debug!(url = %config.url, "Configuration loaded");

    match cli.command {
        Commands::Send { op, data } => commands::send::execute(config, op, data).await?,
        Commands::Watch { buffers } => commands::watch::execute(config, buffers).await?,
    }

    Ok(())
}
