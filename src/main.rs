//! Conduit bridge - cross-chain value-transfer coordinator
//!
//! Wires the intake flow, deposit watcher, and settlement dispatcher
//! around a shared transaction ledger and runs them as independent tasks.

use anyhow::Result;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

use conduit_bridge::bridge::{DepositWatcher, LifecycleEngine, SettlementDispatcher};
use conduit_bridge::chain::{
    DepositLocusIssuer, DestinationChainClient, EvmDestinationClient, EvmLocusIssuer, EvmProvider,
    EvmSourceClient, SourceChainClient,
};
use conduit_bridge::chat::{ChatRouter, ConsoleTransport};
use conduit_bridge::config::{LedgerBackend, Settings};
use conduit_bridge::intake::IntakeHandler;
use conduit_bridge::ledger::{Ledger, MemoryLedger, PostgresLedger};
use conduit_bridge::metrics::MetricsServer;
use conduit_bridge::session::SessionStore;
use conduit_bridge::{api, metrics};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    init_logging();

    info!("Starting Conduit bridge v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let settings = Settings::load()?;
    info!(
        "Loaded configuration: {} -> {}",
        settings.source_chain.name, settings.destination_chain.name
    );

    // Initialize the transaction ledger
    let ledger: Arc<dyn Ledger> = match settings.database.backend {
        LedgerBackend::Memory => {
            warn!("Using the in-memory ledger; transactions will not survive a restart");
            Arc::new(MemoryLedger::new())
        }
        LedgerBackend::Postgres => {
            let ledger = PostgresLedger::connect(&settings.database).await?;
            ledger.run_migrations().await?;
            info!("Database connection established");
            Arc::new(ledger)
        }
    };

    // Chain clients
    let source_provider = Arc::new(EvmProvider::new(settings.source_chain.clone())?);
    let destination_provider = Arc::new(EvmProvider::new(settings.destination_chain.clone())?);

    let source: Arc<dyn SourceChainClient> =
        Arc::new(EvmSourceClient::new(source_provider.clone()));
    let destination: Arc<dyn DestinationChainClient> = Arc::new(EvmDestinationClient::new(
        destination_provider.clone(),
        &settings.destination_chain,
    )?);
    let issuer: Arc<dyn DepositLocusIssuer> = Arc::new(EvmLocusIssuer::new(&settings.source_chain)?);
    info!("Chain connections initialized");

    // Chat transport
    let transport = Arc::new(ConsoleTransport::new());

    // Core components
    let engine = Arc::new(LifecycleEngine::new(
        ledger.clone(),
        issuer,
        transport.clone(),
        settings.bridge.clone(),
    ));
    let sessions = Arc::new(SessionStore::new(settings.bridge.session_idle_timeout_secs));
    let intake = Arc::new(IntakeHandler::new(
        sessions.clone(),
        engine.clone(),
        settings.intake.clone(),
    ));
    let router = Arc::new(ChatRouter::new(
        intake,
        engine.clone(),
        transport.clone(),
    ));

    let watcher = Arc::new(DepositWatcher::new(
        ledger.clone(),
        source,
        settings.watcher.clone(),
    ));
    let dispatcher = Arc::new(SettlementDispatcher::new(
        ledger.clone(),
        destination,
        transport.clone(),
        settings.dispatcher.clone(),
    ));
    info!("Lifecycle engine initialized");

    // Start API server
    let api_handle = tokio::spawn({
        let config = settings.api.clone();
        let ledger = ledger.clone();
        async move {
            if let Err(e) = api::run_server(config, ledger).await {
                error!("API server error: {}", e);
            }
        }
    });

    // Start metrics server
    let metrics_handle = if settings.metrics.enabled {
        let server = MetricsServer::new(settings.metrics.port);
        Some(tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!("Metrics server error: {}", e);
            }
        }))
    } else {
        None
    };

    // Start the deposit watcher
    let watcher_handle = tokio::spawn({
        let watcher = watcher.clone();
        async move {
            if let Err(e) = watcher.run().await {
                error!("Deposit watcher error: {}", e);
            }
        }
    });

    // Start the settlement dispatcher
    let dispatcher_handle = tokio::spawn({
        let dispatcher = dispatcher.clone();
        async move {
            if let Err(e) = dispatcher.run().await {
                error!("Settlement dispatcher error: {}", e);
            }
        }
    });

    // Start the expiry sweep
    let engine_handle = tokio::spawn({
        let engine = engine.clone();
        async move {
            if let Err(e) = engine.run().await {
                error!("Lifecycle engine error: {}", e);
            }
        }
    });

    // Session idle sweep
    let session_handle = tokio::spawn({
        let sessions = sessions.clone();
        let interval = settings.bridge.session_sweep_interval_secs;
        async move {
            loop {
                tokio::time::sleep(tokio::time::Duration::from_secs(interval)).await;
                let swept = sessions.sweep_idle();
                if swept > 0 {
                    info!("Swept {} idle intake sessions", swept);
                }
                metrics::record_sessions_open(sessions.open_count());
            }
        }
    });

    // Health check loop
    let health_handle = tokio::spawn({
        let ledger = ledger.clone();
        let interval = settings.bridge.health_check_interval_secs;
        async move {
            loop {
                tokio::time::sleep(tokio::time::Duration::from_secs(interval)).await;

                let source_ok = source_provider.health_check().await;
                metrics::record_chain_health(source_provider.chain_name(), source_ok);
                if !source_ok {
                    warn!("Source chain health check failed");
                }

                let destination_ok = destination_provider.health_check().await;
                metrics::record_chain_health(destination_provider.chain_name(), destination_ok);
                if !destination_ok {
                    warn!("Destination chain health check failed");
                }

                if let Err(e) = ledger.health_check().await {
                    warn!("Ledger health check failed: {}", e);
                    metrics::record_health_check_failure();
                } else {
                    metrics::record_health_check();
                }
            }
        }
    });

    // Chat loop
    let chat_handle = tokio::spawn({
        let router = router.clone();
        let transport = transport.clone();
        async move {
            router.run(transport).await;
        }
    });

    info!("Conduit bridge is running");
    info!("API server: http://{}:{}", settings.api.host, settings.api.port);
    if settings.metrics.enabled {
        info!("Metrics: http://0.0.0.0:{}/metrics", settings.metrics.port);
    }

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutdown signal received, stopping...");

    // Graceful shutdown
    engine.stop().await;
    watcher.stop().await;
    dispatcher.stop().await;

    // Abort background tasks
    api_handle.abort();
    watcher_handle.abort();
    dispatcher_handle.abort();
    engine_handle.abort();
    session_handle.abort();
    health_handle.abort();
    chat_handle.abort();
    if let Some(h) = metrics_handle {
        h.abort();
    }

    info!("Conduit bridge stopped");
    Ok(())
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,conduit_bridge=debug,sqlx=warn,hyper=warn"));

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
