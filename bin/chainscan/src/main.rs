mod cli;
mod config_loader;

use anyhow::Context;
use chainscan_common::utils::logging::init_logging;
use chainscan_core::{BlockScanner, HandlerChain, LoggingHandler, MempoolTracker, ScanEvent};
use chainscan_rpc::{BitcoindClient, OpReturnHandler};
use chainscan_storage::SledLedger;
use clap::Parser;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 1. Parse CLI and load config
    let args = cli::Cli::parse();
    let config = config_loader::load_app_config(&args.config, &args)?;

    // 2. Setup logging; the guard flushes file output on exit
    let _log_guard = init_logging(&config.logging)?;
    info!("Loaded config from {:?}", args.config);

    // 3. Open ledger and node client
    let ledger = Arc::new(
        SledLedger::open(&config.storage)
            .with_context(|| format!("Failed to open ledger at {:?}", config.storage.path))?,
    );
    let client = Arc::new(BitcoindClient::new(config.node.clone())?);
    info!("Using node at {}", client.url());

    // 4. Transaction handlers
    let handler = HandlerChain::new()
        .with(Arc::new(LoggingHandler))
        .with(Arc::new(OpReturnHandler::new(client.clone())));

    // 5. Start scanner and mempool tracker
    let scanner = BlockScanner::new(client.clone(), ledger.clone(), Arc::new(handler), config.scanner.clone());
    let events = scanner.subscribe();
    scanner.start().await?;

    let mempool = if config.mempool.enabled {
        let tracker = MempoolTracker::new(client.clone(), config.mempool.clone());
        tracker.start().await?;
        Some(tracker)
    } else {
        info!("Mempool tracking disabled");
        None
    };

    // 6. Run until a signal arrives or the scanner gives up
    tokio::select! {
        _ = shutdown_signal() => {}
        _ = log_events(events) => {
            warn!("Scanner terminated on its own");
        }
    }

    // 7. Shutdown
    info!("Shutting down gracefully");
    if let Some(tracker) = mempool {
        if let Err(e) = tracker.stop().await {
            warn!("Mempool tracker did not stop cleanly: {}", e);
        }
    }
    let result = scanner.stop().await;
    ledger.flush().await?;

    if let Err(e) = result {
        error!("Scanner stopped with error: {}", e);
        return Err(e.into());
    }
    Ok(())
}

/// Logs scan events until the scanner publishes `Terminated`.
async fn log_events(mut events: broadcast::Receiver<ScanEvent>) {
    loop {
        match events.recv().await {
            Ok(ScanEvent::BlockScanned { height, hash, transactions, inserted }) => {
                info!(
                    "Scanned block {} at height {} ({} transactions{})",
                    hash,
                    height,
                    transactions,
                    if inserted { "" } else { ", already stored" }
                );
            }
            Ok(ScanEvent::ForkDetected { height, hash, fork_point_height, fork_point_hash, flagged, lookups }) => {
                warn!(
                    "Fork at height {} ({}): fork point {} at height {}, {} blocks flagged after {} lookups",
                    height, hash, fork_point_hash, fork_point_height, flagged, lookups
                );
            }
            Ok(ScanEvent::IterationFailed { height, error }) => {
                warn!("Scan of height {} failed: {}", height, error);
            }
            Ok(ScanEvent::Terminated { error }) => {
                if let Some(error) = error {
                    error!("Scanner terminated: {}", error);
                }
                return;
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!("Event logger fell behind, skipped {} events", skipped);
            }
            Err(RecvError::Closed) => return,
        }
    }
}

/// Graceful shutdown signal
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install terminate handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C");
        },
        _ = terminate => {
            info!("Received terminate signal");
        },
    }
}
