// =============================================================================
// Shared types used across the candle relay
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single trade tick as delivered by the upstream feed.
#[derive(Debug, Clone, PartialEq)]
pub struct TradeEvent {
    pub symbol: String,
    pub price: f64,
    pub volume: i64,
    /// Exchange timestamp in Unix milliseconds.
    pub timestamp_millis: i64,
}

impl TradeEvent {
    pub fn new(symbol: impl Into<String>, price: f64, volume: i64, timestamp_millis: i64) -> Self {
        Self {
            symbol: symbol.into(),
            price,
            volume,
            timestamp_millis,
        }
    }

    /// Wall-clock time of the trade, or `None` when the millisecond value is
    /// outside chrono's representable range.
    pub fn wall_time(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis(self.timestamp_millis)
    }
}

/// A finalized (or snapshotted) OHLCV candle.
///
/// `timestamp` is the close time of the bucket the candle was derived from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub symbol: String,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: i64,
    pub timestamp: DateTime<Utc>,
}

/// Whether an update carries a still-open bucket or a finalized candle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateKind {
    Live,
    Closed,
}

impl std::fmt::Display for UpdateKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Live => write!(f, "live"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// Message flowing from the aggregator to the coalescer, and the exact JSON
/// envelope written to consumers:
///
/// ```json
/// { "updateType": "live", "candle": { "symbol": "AAPL", "open": 100.0, ... } }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateEvent {
    #[serde(rename = "updateType")]
    pub kind: UpdateKind,
    pub candle: Candle,
}

impl UpdateEvent {
    pub fn live(candle: Candle) -> Self {
        Self {
            kind: UpdateKind::Live,
            candle,
        }
    }

    pub fn closed(candle: Candle) -> Self {
        Self {
            kind: UpdateKind::Closed,
            candle,
        }
    }

    pub fn symbol(&self) -> &str {
        &self.candle.symbol
    }
}
