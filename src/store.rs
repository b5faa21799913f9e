// =============================================================================
// Candle Store — write-once persistence of finalized candles
// =============================================================================
//
// The aggregator hands every finalized candle to a `CandleStore` exactly once.
// Failures are reported back but never stop the candle from being broadcast;
// the caller decides how loudly to log them.
// =============================================================================

use std::path::Path;

use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use tracing::{info, warn};

use crate::error::StoreError;
use crate::types::Candle;

/// Write-once sink for finalized candles.
pub trait CandleStore: Send + Sync {
    fn persist(&self, candle: &Candle) -> Result<(), StoreError>;
}

// ---------------------------------------------------------------------------
// SQLite
// ---------------------------------------------------------------------------

/// SQLite-backed store. One row per `(symbol, timestamp)`; re-persisting the
/// same candle is a no-op.
pub struct SqliteCandleStore {
    conn: Mutex<Connection>,
}

impl SqliteCandleStore {
    /// Open (or create) the database file at `path` and ensure the schema.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StoreError::Unavailable(format!("{}: {e}", parent.display())))?;
            }
        }

        let conn = Connection::open(path)?;
        ensure_schema(&conn)?;
        info!(path = %path.display(), "candle store opened");

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    #[cfg(test)]
    fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        ensure_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    #[cfg(test)]
    fn count(&self, symbol: &str) -> i64 {
        self.conn
            .lock()
            .query_row(
                "SELECT COUNT(*) FROM candles WHERE symbol = ?1",
                params![symbol],
                |row| row.get(0),
            )
            .unwrap()
    }
}

fn ensure_schema(conn: &Connection) -> Result<(), StoreError> {
    // Pragmas (best-effort).
    if let Err(e) = conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;") {
        warn!(error = %e, "failed to apply sqlite pragmas");
    }

    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS candles (
            symbol TEXT NOT NULL,
            timestamp_ms INTEGER NOT NULL,
            open REAL NOT NULL,
            high REAL NOT NULL,
            low REAL NOT NULL,
            close REAL NOT NULL,
            volume INTEGER NOT NULL,
            created_at TEXT NOT NULL,
            PRIMARY KEY (symbol, timestamp_ms)
        );
        "#,
    )?;
    Ok(())
}

impl CandleStore for SqliteCandleStore {
    fn persist(&self, candle: &Candle) -> Result<(), StoreError> {
        let created_at = Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
        self.conn.lock().execute(
            r#"
            INSERT OR IGNORE INTO candles
                (symbol, timestamp_ms, open, high, low, close, volume, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
            params![
                candle.symbol,
                candle.timestamp.timestamp_millis(),
                candle.open,
                candle.high,
                candle.low,
                candle.close,
                candle.volume,
                created_at,
            ],
        )?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// In-memory
// ---------------------------------------------------------------------------

/// Keeps persisted candles in memory. Selected when no database path is
/// configured.
#[derive(Default)]
pub struct MemoryCandleStore {
    candles: Mutex<Vec<Candle>>,
}

impl MemoryCandleStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every candle persisted so far, oldest first.
    #[cfg(test)]
    pub fn candles(&self) -> Vec<Candle> {
        self.candles.lock().clone()
    }
}

impl CandleStore for MemoryCandleStore {
    fn persist(&self, candle: &Candle) -> Result<(), StoreError> {
        self.candles.lock().push(candle.clone());
        Ok(())
    }
}
