//! Auction swap agent - drives HTLC atomic swaps settled by an English auction
//!
//! The agent watches auctions on chain A, resolves the local account's role in
//! each ended one and walks both HTLC legs to completion or refund.

use anyhow::Result;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

mod agent;
mod api;
mod chain;
mod config;
mod coordination;
mod error;
mod events;
mod metrics;
mod swap;
mod tx;

use chain::ChainManager;
use config::Settings;
use coordination::SwapCoordinator;
use metrics::MetricsServer;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    init_logging();

    info!("Starting auction swap agent v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let settings = Settings::load()?;
    let policy = settings.timelock_policy()?;
    info!(
        "Loaded configuration for {} ({} <-> {}), timelock margin {}s",
        settings.agent.instance_id,
        settings.chains.a.name,
        settings.chains.b.name,
        policy.margin()
    );

    // Initialize metrics server
    let metrics_server = if settings.metrics.enabled {
        Some(MetricsServer::new(settings.metrics.port))
    } else {
        None
    };

    // Connect both chains with the configured wallet
    let chain_manager = Arc::new(ChainManager::connect(&settings).await?);
    info!("Chain connections initialized for {:?}", chain_manager.account());

    let coordinator = Arc::new(SwapCoordinator::new(
        chain_manager.clone(),
        settings.agent.clone(),
        policy,
    ));

    // Start API server
    let api_handle = tokio::spawn({
        let config = settings.api.clone();
        let coordinator = coordinator.clone();
        async move {
            if let Err(e) = api::run_server(config, coordinator).await {
                error!("API server error: {}", e);
            }
        }
    });

    // Start metrics server
    let metrics_handle = metrics_server.map(|server| {
        tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!("Metrics server error: {}", e);
            }
        })
    });

    // Start swap coordinator
    let coordinator_handle = tokio::spawn({
        let coordinator = coordinator.clone();
        async move {
            if let Err(e) = coordinator.run().await {
                error!("Swap coordinator error: {}", e);
            }
        }
    });

    // Health check loop
    let health_handle = tokio::spawn({
        let chain_manager = chain_manager.clone();
        let interval = settings.agent.health_check_interval_secs;
        async move {
            loop {
                tokio::time::sleep(tokio::time::Duration::from_secs(interval)).await;

                let health = chain_manager.health_check().await;
                let mut all_healthy = true;
                for (side, healthy) in health {
                    if !healthy {
                        warn!("Chain {} health check failed", side);
                        all_healthy = false;
                    }
                }

                metrics::record_health_check(all_healthy);
            }
        }
    });

    info!("Auction swap agent is running");
    info!("API server: http://{}:{}", settings.api.host, settings.api.port);
    if settings.metrics.enabled {
        info!("Metrics: http://0.0.0.0:{}/metrics", settings.metrics.port);
    }

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutdown signal received, stopping...");

    // Agent loops observe the flag between steps
    coordinator.stop().await;
    if let Err(e) = coordinator_handle.await {
        error!("Swap coordinator task failed: {}", e);
    }

    // Abort background tasks
    api_handle.abort();
    health_handle.abort();
    if let Some(h) = metrics_handle {
        h.abort();
    }

    info!("Auction swap agent stopped");
    Ok(())
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,auction_swap_agent=debug,hyper=warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
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
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
