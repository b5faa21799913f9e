// =============================================================================
// Runtime Configuration — service settings from JSON file + environment
// =============================================================================
//
// Settings are read from an optional JSON file, then individual fields are
// overridden from the environment (a `.env` file is loaded by main first).
// All fields carry `#[serde(default)]` so that a partial or empty file still
// loads.
//
// =============================================================================

use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_symbols() -> Vec<String> {
    vec!["AAPL".to_string(), "AMZN".to_string()]
}

fn default_candle_interval_secs() -> u64 {
    60
}

fn default_broadcast_interval_ms() -> u64 {
    1_000
}

fn default_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_feed_url() -> String {
    "wss://ws.finnhub.io".to_string()
}

fn default_db_path() -> String {
    "candles.db".to_string()
}

fn default_consumer_queue_capacity() -> usize {
    64
}

fn default_consumer_write_timeout_ms() -> u64 {
    5_000
}

fn default_feed_reconnect_secs() -> u64 {
    5
}

// =============================================================================
// RuntimeConfig
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Instruments to subscribe to on the upstream feed.
    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,

    /// Width of every candle bucket.
    #[serde(default = "default_candle_interval_secs")]
    pub candle_interval_secs: u64,

    /// Period of the live-update coalescing timer.
    #[serde(default = "default_broadcast_interval_ms")]
    pub broadcast_interval_ms: u64,

    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    #[serde(default = "default_feed_url")]
    pub feed_url: String,

    /// Feed API token. Only ever taken from the environment.
    #[serde(skip)]
    pub api_key: String,

    /// SQLite file for finalized candles. Empty keeps candles in memory only.
    #[serde(default = "default_db_path")]
    pub db_path: String,

    /// Outbound frames buffered per consumer before it is considered stalled.
    #[serde(default = "default_consumer_queue_capacity")]
    pub consumer_queue_capacity: usize,

    /// Upper bound on a single socket write to a consumer.
    #[serde(default = "default_consumer_write_timeout_ms")]
    pub consumer_write_timeout_ms: u64,

    /// Delay before re-dialing the feed after a disconnect.
    #[serde(default = "default_feed_reconnect_secs")]
    pub feed_reconnect_secs: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            symbols: default_symbols(),
            candle_interval_secs: default_candle_interval_secs(),
            broadcast_interval_ms: default_broadcast_interval_ms(),
            bind_addr: default_bind_addr(),
            feed_url: default_feed_url(),
            api_key: String::new(),
            db_path: default_db_path(),
            consumer_queue_capacity: default_consumer_queue_capacity(),
            consumer_write_timeout_ms: default_consumer_write_timeout_ms(),
            feed_reconnect_secs: default_feed_reconnect_secs(),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse config from {}", path.display()))?;

        info!(path = %path.display(), symbols = ?config.symbols, "config loaded");

        Ok(config)
    }

    /// Apply overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from any key lookup; `apply_env` passes the process
    /// environment.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(syms) = lookup("CANDLE_RELAY_SYMBOLS") {
            self.symbols = syms.split(',').map(str::to_string).collect();
        }
        if let Some(v) = lookup("CANDLE_RELAY_INTERVAL_SECS") {
            self.candle_interval_secs = v
                .trim()
                .parse()
                .with_context(|| format!("CANDLE_RELAY_INTERVAL_SECS is not an integer: {v}"))?;
        }
        if let Some(v) = lookup("CANDLE_RELAY_BROADCAST_MS") {
            self.broadcast_interval_ms = v
                .trim()
                .parse()
                .with_context(|| format!("CANDLE_RELAY_BROADCAST_MS is not an integer: {v}"))?;
        }
        if let Some(addr) = lookup("CANDLE_RELAY_BIND_ADDR") {
            self.bind_addr = addr;
        } else if let Some(port) = lookup("SERVER_PORT") {
            self.bind_addr = format!("0.0.0.0:{}", port.trim());
        }
        if let Some(url) = lookup("CANDLE_RELAY_FEED_URL") {
            self.feed_url = url;
        }
        if let Some(key) = lookup("FINNHUB_API_KEY").or_else(|| lookup("API_KEY")) {
            self.api_key = key;
        }
        if let Some(path) = lookup("CANDLE_RELAY_DB_PATH") {
            self.db_path = path;
        }

        self.normalize_symbols();
        Ok(())
    }

    fn normalize_symbols(&mut self) {
        let mut symbols: Vec<String> = self
            .symbols
            .iter()
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect();
        let mut seen = std::collections::HashSet::new();
        symbols.retain(|s| seen.insert(s.clone()));
        self.symbols = symbols;
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.symbols.is_empty() {
            bail!("no symbols configured");
        }
        if self.candle_interval_secs == 0 {
            bail!("candle_interval_secs must be positive");
        }
        if self.broadcast_interval_ms == 0 {
            bail!("broadcast_interval_ms must be positive");
        }
        if self.consumer_queue_capacity == 0 {
            bail!("consumer_queue_capacity must be positive");
        }
        Ok(())
    }

    pub fn candle_interval(&self) -> Duration {
        Duration::from_secs(self.candle_interval_secs)
    }

    pub fn broadcast_interval(&self) -> Duration {
        Duration::from_millis(self.broadcast_interval_ms)
    }

    pub fn consumer_write_timeout(&self) -> Duration {
        Duration::from_millis(self.consumer_write_timeout_ms)
    }

    pub fn feed_reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.feed_reconnect_secs)
    }
}
