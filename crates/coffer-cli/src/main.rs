mod commands;
mod config;

use std::time::Duration;

use clap::Parser;
use coffer_core::{with_timeout, CancellationToken};
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse();

    // Initialize logging. Output goes to stderr so `ls` and `cat` stay pipeable.
    let default_filter = if config.verbose {
        "info,coffer_core=debug"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    let root = create_shutdown_signal();
    let ctx = match config.timeout_secs {
        Some(secs) => with_timeout(&root, Duration::from_secs(secs)),
        None => root.clone(),
    };

    commands::run(&config, &ctx).await
}

/// Create a token cancelled on Ctrl+C or SIGTERM.
fn create_shutdown_signal() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();

    tokio::spawn(async move {
        let ctrl_c = async {
            signal::ctrl_c()
                .await
                .expect("Failed to install Ctrl+C handler");
            info!("Received Ctrl+C, cancelling");
        };

        #[cfg(unix)]
        let terminate = async {
            signal::unix::signal(signal::unix::SignalKind::terminate())
                .expect("Failed to install SIGTERM handler")
                .recv()
                .await;
            info!("Received SIGTERM, cancelling");
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {},
            _ = terminate => {},
        }

        trigger.cancel();
    });

    token
}
