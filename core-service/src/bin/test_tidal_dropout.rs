//! `test-tidal-dropout` - dropout soak test for TIDAL playback on a device
//! topology. See [`core_service::DOC`] for usage.

use anyhow::{Context, Result};
use clap::Parser;
use core_service::SoakArgs;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let args = SoakArgs::parse();

    core_runtime::logging::init_logging(
        args.logging_config()
            .context("Invalid logging options")?,
    )
    .context("Failed to initialize logging")?;

    let cancel = CancellationToken::new();
    tokio::spawn(shutdown_signal(cancel.clone()));

    let code = core_service::execute(&args, cancel).await;
    std::process::exit(code);
}

/// Cancel the run on Ctrl+C (or SIGTERM on unix).
async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, stopping the run"),
        _ = terminate => info!("Received terminate signal, stopping the run"),
    }
    cancel.cancel();
}
