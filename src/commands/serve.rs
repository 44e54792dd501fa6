//! Implementation of the `serve` subcommand.

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;

use crate::config::Config;

/// Arguments to the `serve` subcommand.
#[derive(Parser, Debug)]
pub struct Args {
    /// Configuration file path.
    #[arg(short, long)]
    pub config: Option<PathBuf>,
}

/// The main function for the `serve` subcommand.
pub async fn serve(args: Args) -> Result<()> {
    let config = match args.config {
        Some(path) => Config::from_file(&path)?,
        None => Config::default(),
    }
    .with_env_overrides()?;

    crate::server::run(config).await
}
