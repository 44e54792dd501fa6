//! The dojod command line binary.

#![allow(missing_docs)]
#![allow(clippy::missing_docs_in_private_items)]

use clap::Parser;
use clap::Subcommand;
use tracing_subscriber::EnvFilter;

/// Workspace provisioning service for a CTF-style teaching platform.
#[derive(Parser, Debug)]
#[command(name = "dojod", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the workspace provisioning API server.
    Serve(dojod::commands::serve::Args),
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Command::Serve(args) => dojod::commands::serve::serve(args).await,
    };

    if let Err(e) = result {
        tracing::error!("{:#}", e);
        std::process::exit(1);
    }
}
