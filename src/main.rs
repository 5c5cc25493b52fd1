//! Gateway entry point.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use fieldgw::gateway::{Server, DEFAULT_CONFIG_PATH, DEFAULT_PORT};

/// Industrial data-acquisition gateway.
#[derive(Parser, Debug)]
#[command(name = "fieldgw", version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// TCP API port
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let server = Server::new(args.port);

    if let Err(e) = server.load_config(&args.config).await {
        error!(path = %args.config.display(), error = %e, "fatal: cannot load configuration");
        return ExitCode::FAILURE;
    }

    let listener = match server.bind().await {
        Ok(listener) => listener,
        Err(e) => {
            error!(port = args.port, error = %e, "fatal: cannot bind listener");
            return ExitCode::FAILURE;
        }
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    info!(port = args.port, "gateway started");
    server.serve(listener, shutdown_rx).await;

    ExitCode::SUCCESS
}

/// Wait for SIGINT or SIGTERM.
async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(e) => {
                error!(error = %e, "cannot install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
