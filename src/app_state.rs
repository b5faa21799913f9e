// =============================================================================
// Central Application State
// =============================================================================
//
// Ties the long-lived components together so that the feed task, the
// coalescer task and every WebSocket connection task can share them through a
// single `Arc<AppState>`:
//   - the aggregator owns the open-bucket map,
//   - the registry owns the subscriber map,
//   - the config is read-only after startup.
// =============================================================================

use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use serde::Serialize;
use tokio::sync::mpsc::{self, UnboundedReceiver};

use crate::broadcast::SubscriberRegistry;
use crate::market_data::CandleAggregator;
use crate::runtime_config::RuntimeConfig;
use crate::store::CandleStore;
use crate::types::UpdateEvent;

pub struct AppState {
    pub config: RuntimeConfig,
    pub aggregator: Arc<CandleAggregator>,
    pub registry: Arc<SubscriberRegistry>,
    /// Instant when the service was started. Used for uptime reporting.
    pub start_time: Instant,
}

/// Point-in-time counters for the health endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub status: &'static str,
    pub subscribers: usize,
    pub open_buckets: usize,
    pub trades_ingested: u64,
    pub candles_closed: u64,
    pub uptime_secs: u64,
}

impl AppState {
    /// Build the state and return the receiving end of the update channel,
    /// which the caller hands to the coalescer task.
    pub fn new(
        config: RuntimeConfig,
        store: Arc<dyn CandleStore>,
    ) -> Result<(Self, UnboundedReceiver<UpdateEvent>)> {
        let (tx, rx) = mpsc::unbounded_channel();
        let aggregator = CandleAggregator::new(config.candle_interval(), store, tx)?;

        let state = Self {
            config,
            aggregator: Arc::new(aggregator),
            registry: Arc::new(SubscriberRegistry::new()),
            start_time: Instant::now(),
        };
        Ok((state, rx))
    }

    pub fn health(&self) -> HealthSnapshot {
        HealthSnapshot {
            status: "ok",
            subscribers: self.registry.len(),
            open_buckets: self.aggregator.open_buckets(),
            trades_ingested: self.aggregator.trades_ingested(),
            candles_closed: self.aggregator.candles_closed(),
            uptime_secs: self.start_time.elapsed().as_secs(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryCandleStore;
    use crate::types::{TradeEvent, UpdateKind};

    #[test]
    fn ingest_reaches_returned_receiver() {
        let (state, mut rx) =
            AppState::new(RuntimeConfig::default(), Arc::new(MemoryCandleStore::new())).unwrap();

        state.aggregator.ingest(&TradeEvent::new("AAPL", 100.0, 1, 0));

        let update = rx.try_recv().unwrap();
        assert_eq!(update.kind, UpdateKind::Live);

        let health = state.health();
        assert_eq!(health.open_buckets, 1);
        assert_eq!(health.trades_ingested, 1);
        assert_eq!(health.subscribers, 0);
    }
}
