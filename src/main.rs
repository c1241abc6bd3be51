// =============================================================================
// Helios Bot — Main Entry Point
// =============================================================================
//
// Boot order matters: configuration is validated before any exchange client is
// built, positions are resumed from the durable store before the risk engine
// starts counting, and the exit watcher is the last subsystem up and the first
// one down.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod app_state;
mod binance;
mod config;
mod exchange;
mod execution;
mod positions;
mod risk;
mod store;
mod types;
mod watcher;

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::binance::BinanceClient;
use crate::config::Config;
use crate::exchange::ExchangeClient;
use crate::execution::ExecutionEngine;
use crate::positions::PositionManager;
use crate::risk::RiskEngine;
use crate::store::CsvStore;
use crate::types::{Clock, SystemClock};
use crate::watcher::ExitWatcher;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Helios Bot starting up");

    let config = Config::from_env();
    config.validate()?;

    info!(
        testnet = config.use_testnet,
        base_url = %config.exchange_base_url(),
        positions_file = %config.positions_file,
        exit_interval_secs = config.exit_check_interval_secs,
        "configuration loaded"
    );

    // ── 2. Positions (resume from durable store) ─────────────────────────
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store = CsvStore::new(&config.positions_file);
    let position_manager = Arc::new(PositionManager::with_store(Box::new(store), clock.clone())?);

    // ── 3. Exchange client ───────────────────────────────────────────────
    let exchange: Arc<dyn ExchangeClient> = Arc::new(BinanceClient::new(
        config.binance_api_key.clone(),
        config.binance_api_secret.clone(),
        config.exchange_base_url(),
    ));

    // ── 4. Risk & execution engines ──────────────────────────────────────
    let risk_engine = Arc::new(RiskEngine::new(
        config.risk.clone(),
        clock,
        position_manager.clone(),
    ));
    let execution = Arc::new(ExecutionEngine::new(
        exchange.clone(),
        risk_engine.clone(),
        position_manager.clone(),
        config.risk.clone(),
    ));

    // ── 5. API server ────────────────────────────────────────────────────
    let bind_addr = format!("{}:{}", config.host, config.port);
    let state = Arc::new(AppState::new(
        config.clone(),
        risk_engine,
        position_manager.clone(),
        exchange.clone(),
        execution,
    ));

    let api_state = state.clone();
    let api_addr = bind_addr.clone();
    tokio::spawn(async move {
        let app = api::rest::router(api_state);
        let listener = tokio::net::TcpListener::bind(&api_addr)
            .await
            .expect("Failed to bind API server");
        info!(addr = %api_addr, "API server listening");
        axum::serve(listener, app)
            .await
            .expect("API server failed");
    });

    // ── 6. Exit watcher ──────────────────────────────────────────────────
    let watcher = Arc::new(ExitWatcher::new(
        position_manager,
        exchange,
        Duration::from_secs(state.config.exit_check_interval_secs),
    ));
    watcher.start();

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 7. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received — stopping gracefully");

    watcher.stop().await;

    info!("Helios Bot shut down complete.");
    Ok(())
}
