use anyhow::Result;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

mod broker;
mod cast;
mod cli;
mod config;
mod device;
mod extract;
mod media;
mod resolve;
mod transcode;

#[tokio::main]
async fn main() {
    let args = cli::Args::parse();
    init_logging(args.debug);

    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    if let Err(err) = args.run(&cancel).await {
        error!("{err:#}");
        std::process::exit(1);
    }
}

fn init_logging(debug: bool) {
    let filter = if debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .init();
}

/// Cancel the root token on the first interrupt; a second one terminates
/// the process the default way.
fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        if let Err(err) = shutdown_signal().await {
            error!(error = %err, "signal handler failed");
            return;
        }
        info!("shutdown requested");
        cancel.cancel();
    });
}

#[cfg(unix)]
async fn shutdown_signal() -> Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = interrupt.recv() => {}
        _ = terminate.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn shutdown_signal() -> Result<()> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}
