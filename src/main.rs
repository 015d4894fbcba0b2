//! txpilot daemon - nonce-ordered public transaction submission for EVM
//! ledgers
//!
//! Wires the engine to its production collaborators: the Postgres
//! transaction store, the ethers-backed ledger client, locally held signing
//! keys, and a channel-fed block indexer the surrounding process pushes
//! confirmed-transaction batches into.

use anyhow::Result;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};

use txpilot::config::Settings;
use txpilot::engine::Engine;
use txpilot::events::BroadcastNotifier;
use txpilot::indexer::ChannelBlockIndexer;
use txpilot::keys::LocalWalletKeyManager;
use txpilot::ledger::EvmLedgerClient;
use txpilot::metrics::MetricsServer;
use txpilot::store::PgTxStore;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    init_logging();

    info!("Starting txpilot v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let settings = Settings::load()?;
    info!(chain_id = settings.ledger.chain_id, "Loaded configuration");

    // Initialize database connection
    let store = Arc::new(PgTxStore::new(&settings.database).await?);
    info!("Database connection established");

    // Run migrations
    store.run_migrations().await?;

    // Ledger client and signing keys
    let ledger = Arc::new(EvmLedgerClient::new(&settings.ledger)?);
    let keys = Arc::new(LocalWalletKeyManager::from_config(
        &settings.wallet,
        settings.ledger.chain_id,
    )?);

    // Confirmation feed and progress events
    let indexer = Arc::new(ChannelBlockIndexer::new());
    let notifier = Arc::new(BroadcastNotifier::new(1024));

    // Initialize the engine
    let engine = Engine::new(
        &settings,
        ledger,
        keys,
        store.clone(),
        indexer.clone(),
        notifier.clone(),
    )?;
    let poll_handle = engine.start().await?;
    info!("Engine started");

    // Start metrics server
    let metrics_handle = if settings.metrics.enabled {
        let server = MetricsServer::new(settings.metrics.port);
        info!("Metrics: http://0.0.0.0:{}/metrics", settings.metrics.port);
        Some(tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!("Metrics server error: {}", e);
            }
        }))
    } else {
        None
    };

    info!("txpilot is running");

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutdown signal received, stopping...");

    // Graceful shutdown
    engine.stop().await;

    // Abort background tasks
    poll_handle.abort();
    if let Some(h) = metrics_handle {
        h.abort();
    }

    info!("txpilot stopped");
    Ok(())
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,txpilot=debug,sqlx=warn,hyper=warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
