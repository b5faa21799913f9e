// =============================================================================
// Candle Aggregator — per-symbol fixed-interval OHLCV bucketing
// =============================================================================
//
// Every trade tick goes through `ingest`. Each symbol has at most one open
// bucket; a trade stamped strictly after the bucket's close time finalizes it
// (persist + `Closed` update) and opens a fresh bucket seeded from that trade.
// A `Live` snapshot of the current bucket is emitted after every trade.
//
// Buckets are only ever closed by an observed trade, never by the wall clock:
// an idle symbol produces no candles.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

use crate::store::CandleStore;
use crate::types::{Candle, TradeEvent, UpdateEvent};

/// The in-progress bucket for one symbol.
#[derive(Debug, Clone, PartialEq)]
pub struct OpenBucket {
    pub symbol: String,
    pub open_time: DateTime<Utc>,
    /// Fixed at creation.
    pub close_time: DateTime<Utc>,
    pub open_price: f64,
    pub close_price: f64,
    pub high_price: f64,
    pub low_price: f64,
    pub volume: i64,
}

impl OpenBucket {
    fn seed(trade: &TradeEvent, open_time: DateTime<Utc>, close_time: DateTime<Utc>) -> Self {
        Self {
            symbol: trade.symbol.clone(),
            open_time,
            close_time,
            open_price: trade.price,
            close_price: trade.price,
            high_price: trade.price,
            low_price: trade.price,
            volume: trade.volume,
        }
    }

    /// Fold a trade in. Returns `false`, leaving the bucket untouched, if the
    /// running volume would overflow.
    fn apply(&mut self, trade: &TradeEvent) -> bool {
        let Some(volume) = self.volume.checked_add(trade.volume) else {
            return false;
        };
        self.close_price = trade.price;
        self.volume = volume;
        self.high_price = self.high_price.max(trade.price);
        self.low_price = self.low_price.min(trade.price);
        true
    }

    /// Candle-shaped view of the bucket, stamped with its close time.
    pub fn to_candle(&self) -> Candle {
        Candle {
            symbol: self.symbol.clone(),
            open: self.open_price,
            high: self.high_price,
            low: self.low_price,
            close: self.close_price,
            volume: self.volume,
            timestamp: self.close_time,
        }
    }
}

/// Owns the open-bucket map and publishes updates onto the coalescer channel.
pub struct CandleAggregator {
    interval: chrono::Duration,
    /// One lock scope per `ingest` call: lookup, finalize and update are atomic.
    buckets: Mutex<HashMap<String, OpenBucket>>,
    store: Arc<dyn CandleStore>,
    updates: UnboundedSender<UpdateEvent>,
    trades_ingested: AtomicU64,
    candles_closed: AtomicU64,
}

impl CandleAggregator {
    pub fn new(
        interval: std::time::Duration,
        store: Arc<dyn CandleStore>,
        updates: UnboundedSender<UpdateEvent>,
    ) -> Result<Self> {
        let interval = chrono::Duration::from_std(interval)
            .context("candle interval does not fit a chrono duration")?;

        Ok(Self {
            interval,
            buckets: Mutex::new(HashMap::new()),
            store,
            updates,
            trades_ingested: AtomicU64::new(0),
            candles_closed: AtomicU64::new(0),
        })
    }

    /// Fold one trade into its symbol's bucket.
    ///
    /// Trades with a non-finite price, a negative volume, a timestamp that
    /// cannot be placed on the wall clock, or a volume that would overflow the
    /// bucket total are dropped with a warning and leave state as it was.
    pub fn ingest(&self, trade: &TradeEvent) {
        if !trade.price.is_finite() {
            warn!(symbol = %trade.symbol, price = trade.price, "discarding trade with non-finite price");
            return;
        }
        if trade.volume < 0 {
            warn!(symbol = %trade.symbol, volume = trade.volume, "discarding trade with negative volume");
            return;
        }
        let Some(timestamp) = trade.wall_time() else {
            warn!(symbol = %trade.symbol, ts = trade.timestamp_millis, "discarding trade with unrepresentable timestamp");
            return;
        };

        let mut buckets = self.buckets.lock();

        let needs_new_bucket = match buckets.get(&trade.symbol) {
            Some(bucket) => timestamp > bucket.close_time,
            None => true,
        };

        if needs_new_bucket {
            let Some(close_time) = timestamp.checked_add_signed(self.interval) else {
                warn!(symbol = %trade.symbol, ts = trade.timestamp_millis, "discarding trade: bucket close time overflows");
                return;
            };

            if let Some(previous) = buckets.remove(&trade.symbol) {
                self.finalize(previous);
            }

            debug!(symbol = %trade.symbol, open_time = %timestamp, "opening bucket");
            buckets.insert(
                trade.symbol.clone(),
                OpenBucket::seed(trade, timestamp, close_time),
            );
        } else if let Some(bucket) = buckets.get_mut(&trade.symbol) {
            if !bucket.apply(trade) {
                warn!(symbol = %trade.symbol, volume = trade.volume, bucket_volume = bucket.volume, "discarding trade: bucket volume overflows");
                return;
            }
        }

        self.trades_ingested.fetch_add(1, Ordering::Relaxed);

        if let Some(bucket) = buckets.get(&trade.symbol) {
            self.publish(UpdateEvent::live(bucket.to_candle()));
        }
    }

    /// Persist and announce a bucket that a later trade has crossed.
    fn finalize(&self, bucket: OpenBucket) {
        let candle = bucket.to_candle();

        // Synchronous write under the bucket lock; a slow disk delays `Closed`.
        if let Err(e) = self.store.persist(&candle) {
            warn!(symbol = %candle.symbol, timestamp = %candle.timestamp, error = %e, "failed to persist candle");
        }

        self.candles_closed.fetch_add(1, Ordering::Relaxed);
        info!(
            symbol = %candle.symbol,
            open = candle.open,
            high = candle.high,
            low = candle.low,
            close = candle.close,
            volume = candle.volume,
            timestamp = %candle.timestamp,
            "candle closed"
        );

        self.publish(UpdateEvent::closed(candle));
    }

    fn publish(&self, update: UpdateEvent) {
        if self.updates.send(update).is_err() {
            debug!("update channel closed; dropping update");
        }
    }

    /// Copy of the open bucket for `symbol`, if any.
    #[cfg(test)]
    pub fn bucket(&self, symbol: &str) -> Option<OpenBucket> {
        self.buckets.lock().get(symbol).cloned()
    }

    pub fn open_buckets(&self) -> usize {
        self.buckets.lock().len()
    }

    pub fn trades_ingested(&self) -> u64 {
        self.trades_ingested.load(Ordering::Relaxed)
    }

    pub fn candles_closed(&self) -> u64 {
        self.candles_closed.load(Ordering::Relaxed)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::market_data::trade_stream::parse_trade_message;
    use crate::store::MemoryCandleStore;
    use crate::types::UpdateKind;
    use tokio::sync::mpsc::{self, UnboundedReceiver};

    const MINUTE: std::time::Duration = std::time::Duration::from_secs(60);

    struct FailingStore;

    impl CandleStore for FailingStore {
        fn persist(&self, _candle: &Candle) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("disk on fire".into()))
        }
    }

    fn setup() -> (CandleAggregator, Arc<MemoryCandleStore>, UnboundedReceiver<UpdateEvent>) {
        let store = Arc::new(MemoryCandleStore::new());
        let (tx, rx) = mpsc::unbounded_channel();
        let agg = CandleAggregator::new(MINUTE, store.clone(), tx).unwrap();
        (agg, store, rx)
    }

    fn drain(rx: &mut UnboundedReceiver<UpdateEvent>) -> Vec<UpdateEvent> {
        let mut out = Vec::new();
        while let Ok(update) = rx.try_recv() {
            out.push(update);
        }
        out
    }

    fn ts(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    #[test]
    fn first_trade_opens_seeded_bucket() {
        let (agg, _store, mut rx) = setup();
        agg.ingest(&TradeEvent::new("AAPL", 100.0, 10, 0));

        let bucket = agg.bucket("AAPL").unwrap();
        assert_eq!(bucket.open_time, ts(0));
        assert_eq!(bucket.close_time, ts(60));
        assert_eq!(bucket.open_price, 100.0);
        assert_eq!(bucket.high_price, 100.0);
        assert_eq!(bucket.low_price, 100.0);
        assert_eq!(bucket.close_price, 100.0);
        assert_eq!(bucket.volume, 10);

        let updates = drain(&mut rx);
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].kind, UpdateKind::Live);
    }

    #[test]
    fn trades_within_interval_accumulate() {
        let (agg, _store, mut rx) = setup();
        let prices = [100.0, 103.5, 97.25, 101.0];
        for (i, price) in prices.iter().enumerate() {
            agg.ingest(&TradeEvent::new("AAPL", *price, 5 + i as i64, i as i64 * 10_000));
        }

        let bucket = agg.bucket("AAPL").unwrap();
        assert_eq!(bucket.volume, 5 + 6 + 7 + 8);
        assert_eq!(bucket.open_price, 100.0);
        assert_eq!(bucket.close_price, 101.0);
        assert_eq!(bucket.high_price, 103.5);
        assert_eq!(bucket.low_price, 97.25);
        assert_eq!(bucket.close_time, ts(60));

        let updates = drain(&mut rx);
        assert_eq!(updates.len(), prices.len());
        assert!(updates.iter().all(|u| u.kind == UpdateKind::Live));
    }

    #[test]
    fn crossing_trade_closes_previous_bucket() {
        let (agg, store, mut rx) = setup();
        agg.ingest(&TradeEvent::new("AAPL", 100.0, 1, 0));
        agg.ingest(&TradeEvent::new("AAPL", 105.0, 1, 30_000));
        agg.ingest(&TradeEvent::new("AAPL", 98.0, 1, 61_000));

        let updates = drain(&mut rx);
        let kinds: Vec<UpdateKind> = updates.iter().map(|u| u.kind).collect();
        assert_eq!(
            kinds,
            vec![UpdateKind::Live, UpdateKind::Live, UpdateKind::Closed, UpdateKind::Live]
        );

        let closed = &updates[2].candle;
        assert_eq!(closed.open, 100.0);
        assert_eq!(closed.high, 105.0);
        assert_eq!(closed.low, 100.0);
        assert_eq!(closed.close, 105.0);
        assert_eq!(closed.volume, 2);
        assert_eq!(closed.timestamp, ts(60));

        let bucket = agg.bucket("AAPL").unwrap();
        assert_eq!(bucket.open_time, ts(61));
        assert_eq!(bucket.close_time, ts(121));
        assert_eq!(bucket.open_price, 98.0);
        assert_eq!(bucket.volume, 1);

        assert_eq!(store.candles(), vec![closed.clone()]);
        assert_eq!(agg.candles_closed(), 1);
    }

    #[test]
    fn trade_at_close_time_stays_in_bucket() {
        let (agg, store, mut rx) = setup();
        agg.ingest(&TradeEvent::new("AAPL", 100.0, 1, 0));
        agg.ingest(&TradeEvent::new("AAPL", 101.0, 1, 60_000));

        assert!(drain(&mut rx).iter().all(|u| u.kind == UpdateKind::Live));
        assert!(store.candles().is_empty());
        assert_eq!(agg.bucket("AAPL").unwrap().volume, 2);
    }

    #[test]
    fn idle_symbols_never_close() {
        let (agg, store, mut rx) = setup();
        agg.ingest(&TradeEvent::new("AAPL", 100.0, 1, 0));
        // Far in the future, but for another symbol.
        agg.ingest(&TradeEvent::new("AMZN", 50.0, 1, 3_600_000));

        let updates = drain(&mut rx);
        assert!(updates.iter().all(|u| u.kind == UpdateKind::Live));
        assert!(store.candles().is_empty());
        assert_eq!(agg.open_buckets(), 2);
    }

    #[test]
    fn out_of_order_trade_joins_open_bucket() {
        let (agg, _store, _rx) = setup();
        agg.ingest(&TradeEvent::new("AAPL", 100.0, 1, 120_000));
        agg.ingest(&TradeEvent::new("AAPL", 90.0, 4, 60_000));

        let bucket = agg.bucket("AAPL").unwrap();
        assert_eq!(bucket.open_time, ts(120));
        assert_eq!(bucket.low_price, 90.0);
        assert_eq!(bucket.volume, 5);
    }

    #[test]
    fn persist_failure_still_broadcasts_closed() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let agg = CandleAggregator::new(MINUTE, Arc::new(FailingStore), tx).unwrap();

        agg.ingest(&TradeEvent::new("AAPL", 100.0, 1, 0));
        agg.ingest(&TradeEvent::new("AAPL", 101.0, 1, 61_000));

        let closed: Vec<UpdateEvent> = drain(&mut rx)
            .into_iter()
            .filter(|u| u.kind == UpdateKind::Closed)
            .collect();
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].candle.close, 100.0);
    }

    #[test]
    fn malformed_trades_leave_state_untouched() {
        let (agg, _store, mut rx) = setup();
        agg.ingest(&TradeEvent::new("AAPL", f64::NAN, 1, 0));
        agg.ingest(&TradeEvent::new("AAPL", 100.0, 1, i64::MAX));

        assert!(agg.bucket("AAPL").is_none());
        assert!(drain(&mut rx).is_empty());
        assert_eq!(agg.trades_ingested(), 0);
    }

    #[test]
    fn overflowing_volume_is_dropped_before_any_change() {
        let (agg, _store, mut rx) = setup();
        agg.ingest(&TradeEvent::new("AAPL", 100.0, i64::MAX, 0));
        agg.ingest(&TradeEvent::new("AAPL", 101.0, 1, 1_000));

        let bucket = agg.bucket("AAPL").unwrap();
        assert_eq!(bucket.volume, i64::MAX);
        assert_eq!(bucket.close_price, 100.0);
        assert_eq!(bucket.high_price, 100.0);
        assert_eq!(drain(&mut rx).len(), 1);
        assert_eq!(agg.trades_ingested(), 1);

        // The bucket keeps working for trades that fit.
        agg.ingest(&TradeEvent::new("AAPL", 99.0, 0, 2_000));
        assert_eq!(agg.bucket("AAPL").unwrap().low_price, 99.0);
    }

    #[test]
    fn negative_volume_is_dropped() {
        let (agg, _store, mut rx) = setup();
        agg.ingest(&TradeEvent::new("AAPL", 100.0, 5, 0));
        agg.ingest(&TradeEvent::new("AAPL", 90.0, -3, 1_000));
        agg.ingest(&TradeEvent::new("AMZN", 10.0, -1, 0));

        let bucket = agg.bucket("AAPL").unwrap();
        assert_eq!(bucket.volume, 5);
        assert_eq!(bucket.low_price, 100.0);
        assert!(agg.bucket("AMZN").is_none());
        assert_eq!(drain(&mut rx).len(), 1);
    }

    #[test]
    fn oversized_feed_volume_does_not_stop_ingest() {
        let (agg, _store, mut rx) = setup();
        let frame = r#"{"type":"trade","data":[
            {"s":"AAPL","p":1.0,"v":9223372036854775807,"t":0},
            {"s":"AAPL","p":1.0,"v":5,"t":1}
        ]}"#;
        for trade in parse_trade_message(frame).unwrap() {
            agg.ingest(&trade);
        }
        agg.ingest(&TradeEvent::new("AAPL", 2.0, 1, 61_000));

        let kinds: Vec<UpdateKind> = drain(&mut rx).iter().map(|u| u.kind).collect();
        assert_eq!(kinds, vec![UpdateKind::Live, UpdateKind::Closed, UpdateKind::Live]);
        assert_eq!(agg.candles_closed(), 1);
    }

    #[test]
    fn closed_receiver_does_not_break_ingest() {
        let (agg, store, rx) = setup();
        drop(rx);

        agg.ingest(&TradeEvent::new("AAPL", 100.0, 1, 0));
        agg.ingest(&TradeEvent::new("AAPL", 101.0, 1, 61_000));

        assert_eq!(store.candles().len(), 1);
        assert_eq!(agg.trades_ingested(), 2);
    }
}
