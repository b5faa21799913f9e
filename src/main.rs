// =============================================================================
// Candle Relay — Main Entry Point
// =============================================================================
//
// Trade feed → aggregator → update channel → coalescer → registry → consumers.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod app_state;
mod broadcast;
mod error;
mod market_data;
mod runtime_config;
mod store;
mod types;

use std::sync::Arc;

use anyhow::Context;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::runtime_config::RuntimeConfig;
use crate::store::{CandleStore, MemoryCandleStore, SqliteCandleStore};

const DEFAULT_CONFIG_PATH: &str = "candle_relay.json";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Candle Relay — starting up");

    let config_path =
        std::env::var("CANDLE_RELAY_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.into());
    let mut config = RuntimeConfig::load(&config_path).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        RuntimeConfig::default()
    });
    config.apply_env()?;
    config.validate()?;

    if config.api_key.is_empty() {
        warn!("no feed API key configured (API_KEY / FINNHUB_API_KEY)");
    }
    info!(
        symbols = ?config.symbols,
        candle_interval_secs = config.candle_interval_secs,
        broadcast_interval_ms = config.broadcast_interval_ms,
        "configuration ready"
    );

    // ── 2. Storage ───────────────────────────────────────────────────────
    let store: Arc<dyn CandleStore> = if config.db_path.is_empty() {
        warn!("no db_path configured — closed candles are kept in memory only");
        Arc::new(MemoryCandleStore::new())
    } else {
        Arc::new(
            SqliteCandleStore::open(&config.db_path)
                .with_context(|| format!("failed to open candle store at {}", config.db_path))?,
        )
    };

    // ── 3. Shared state ──────────────────────────────────────────────────
    let (state, updates) = AppState::new(config, store)?;
    let state = Arc::new(state);

    // ── 4. Coalescer ─────────────────────────────────────────────────────
    tokio::spawn(broadcast::run_coalescer(
        updates,
        state.registry.clone(),
        state.config.broadcast_interval(),
    ));

    // ── 5. Trade feed (re-dials after every disconnect) ──────────────────
    let feed_state = state.clone();
    tokio::spawn(async move {
        let cfg = &feed_state.config;
        loop {
            if let Err(e) = market_data::trade_stream::run_trade_stream(
                &cfg.feed_url,
                &cfg.api_key,
                &cfg.symbols,
                &feed_state.aggregator,
            )
            .await
            {
                error!(error = %e, "Trade feed error — reconnecting in {}s", cfg.feed_reconnect_secs);
            }
            tokio::time::sleep(cfg.feed_reconnect_delay()).await;
        }
    });

    // ── 6. HTTP / WebSocket server ───────────────────────────────────────
    let listener = tokio::net::TcpListener::bind(&state.config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", state.config.bind_addr))?;
    info!(addr = %state.config.bind_addr, "API server listening");

    let app = api::rest::router(state.clone());
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "API server failed");
        }
    });

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 7. Shutdown ──────────────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received");

    let health = state.health();
    info!(
        trades = health.trades_ingested,
        candles = health.candles_closed,
        "Candle Relay shut down complete."
    );
    Ok(())
}
