mod cast;
mod scan;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use crate::config::Config;

pub use cast::CastCommand;
pub use scan::ScanCommand;

#[derive(Parser, Debug)]
#[command(name = "beamer")]
#[command(about = "Cast video streams to networked devices")]
pub struct Args {
    /// Path to the configuration file
    #[arg(short, long, global = true, default_value = "config.yaml")]
    pub config: PathBuf,

    /// Enable debug logging
    #[arg(long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Cast a video to the configured device
    Cast(CastCommand),
    /// List all devices on the local network
    Scan(ScanCommand),
}

impl Args {
    pub async fn run(self, cancel: &CancellationToken) -> Result<()> {
        let config = Config::load(&self.config)
            .with_context(|| format!("loading config from {}", self.config.display()))?;

        match self.command {
            Command::Cast(cmd) => cmd.run(cancel, &config).await,
            Command::Scan(cmd) => cmd.run(&config).await,
        }
    }
}
