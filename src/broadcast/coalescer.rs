// =============================================================================
// Broadcast Coalescer — rate-limits live updates, passes closed ones through
// =============================================================================
//
// Single loop selecting over the aggregator's update channel and a periodic
// timer:
//   - `Closed` updates are fanned out the moment they arrive.
//   - `Live` updates overwrite a per-symbol pending slot (latest wins).
//   - On every tick each pending slot is fanned out once and cleared.
//
// Consumers therefore see at most one live message per symbol per tick no
// matter how fast trades arrive.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, info};

use crate::broadcast::SubscriberRegistry;
use crate::types::{UpdateEvent, UpdateKind};

/// Pending-slot bookkeeping, independent of the channel and timer.
#[derive(Debug, Default)]
pub struct Coalescer {
    pending: HashMap<String, UpdateEvent>,
}

impl Coalescer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept one update. Returns it back when it must be delivered right
    /// away; live updates are parked instead.
    pub fn accept(&mut self, update: UpdateEvent) -> Option<UpdateEvent> {
        match update.kind {
            UpdateKind::Closed => Some(update),
            UpdateKind::Live => {
                self.pending.insert(update.candle.symbol.clone(), update);
                None
            }
        }
    }

    /// Take every parked live update, leaving all slots empty.
    pub fn flush(&mut self) -> Vec<UpdateEvent> {
        let mut due: Vec<UpdateEvent> = self.pending.drain().map(|(_, u)| u).collect();
        due.sort_by(|a, b| a.candle.symbol.cmp(&b.candle.symbol));
        due
    }

    #[cfg(test)]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

/// Drive the coalescer until the update channel closes.
///
/// Spawned once at startup:
///
/// ```ignore
/// tokio::spawn(run_coalescer(rx, registry.clone(), Duration::from_secs(1)));
/// ```
pub async fn run_coalescer(
    mut updates: UnboundedReceiver<UpdateEvent>,
    registry: Arc<SubscriberRegistry>,
    period: Duration,
) {
    let mut coalescer = Coalescer::new();
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick of a tokio interval completes immediately.
    ticker.tick().await;

    info!(period_ms = period.as_millis() as u64, "coalescer running");

    loop {
        tokio::select! {
            maybe_update = updates.recv() => {
                match maybe_update {
                    Some(update) => {
                        if let Some(now) = coalescer.accept(update) {
                            registry.fan_out(&now);
                        }
                    }
                    None => {
                        info!("update channel closed — coalescer stopping");
                        break;
                    }
                }
            }

            _ = ticker.tick() => {
                let due = coalescer.flush();
                if !due.is_empty() {
                    debug!(count = due.len(), "flushing live updates");
                }
                for update in &due {
                    registry.fan_out(update);
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::registry::RecordingTransport;
    use crate::types::Candle;
    use chrono::DateTime;
    use tokio::sync::mpsc;

    fn candle(symbol: &str, close: f64) -> Candle {
        Candle {
            symbol: symbol.into(),
            open: 100.0,
            high: close.max(100.0),
            low: close.min(100.0),
            close,
            volume: 1,
            timestamp: DateTime::from_timestamp(60, 0).unwrap(),
        }
    }

    #[test]
    fn closed_passes_through_and_live_is_parked() {
        let mut c = Coalescer::new();
        let closed = UpdateEvent::closed(candle("AAPL", 1.0));

        assert_eq!(c.accept(closed.clone()), Some(closed));
        assert_eq!(c.accept(UpdateEvent::live(candle("AAPL", 2.0))), None);
        assert_eq!(c.pending_len(), 1);
    }

    #[test]
    fn latest_live_wins_per_symbol() {
        let mut c = Coalescer::new();
        c.accept(UpdateEvent::live(candle("AAPL", 1.0)));
        c.accept(UpdateEvent::live(candle("AMZN", 5.0)));
        c.accept(UpdateEvent::live(candle("AAPL", 2.0)));

        let due = c.flush();
        assert_eq!(
            due,
            vec![
                UpdateEvent::live(candle("AAPL", 2.0)),
                UpdateEvent::live(candle("AMZN", 5.0)),
            ]
        );
        assert!(c.flush().is_empty());
    }

    #[test]
    fn closed_does_not_touch_pending_live() {
        let mut c = Coalescer::new();
        c.accept(UpdateEvent::live(candle("AAPL", 1.0)));
        c.accept(UpdateEvent::closed(candle("AAPL", 1.0)));
        assert_eq!(c.pending_len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn burst_yields_one_live_per_tick() {
        let registry = Arc::new(SubscriberRegistry::new());
        let aapl = Arc::new(RecordingTransport::default());
        let amzn = Arc::new(RecordingTransport::default());
        let a = registry.register(aapl.clone());
        let b = registry.register(amzn.clone());
        registry.set_subscription(a, "AAPL");
        registry.set_subscription(b, "AMZN");

        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(run_coalescer(rx, registry.clone(), Duration::from_secs(1)));

        // Let the loop consume its immediate first tick.
        tokio::task::yield_now().await;

        for i in 0..50 {
            tx.send(UpdateEvent::live(candle("AAPL", 100.0 + i as f64))).unwrap();
            tokio::time::sleep(Duration::from_millis(4)).await;
        }
        assert!(aapl.frames().is_empty());

        tokio::time::sleep(Duration::from_millis(900)).await;

        let frames = aapl.frames();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].candle.close, 149.0);
        assert!(amzn.frames().is_empty());

        // Nothing pending: another tick sends nothing.
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(aapl.frames().len(), 1);

        drop(tx);
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn closed_is_delivered_without_waiting_for_tick() {
        let registry = Arc::new(SubscriberRegistry::new());
        let t = Arc::new(RecordingTransport::default());
        let id = registry.register(t.clone());
        registry.set_subscription(id, "AAPL");

        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(run_coalescer(rx, registry.clone(), Duration::from_secs(1)));
        tokio::task::yield_now().await;

        tx.send(UpdateEvent::closed(candle("AAPL", 1.0))).unwrap();
        tx.send(UpdateEvent::closed(candle("AAPL", 2.0))).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let kinds: Vec<UpdateKind> = t.frames().into_iter().map(|u| u.kind).collect();
        assert_eq!(kinds, vec![UpdateKind::Closed, UpdateKind::Closed]);

        drop(tx);
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn every_symbol_flushes_on_the_same_tick() {
        let registry = Arc::new(SubscriberRegistry::new());
        let aapl = Arc::new(RecordingTransport::default());
        let amzn = Arc::new(RecordingTransport::default());
        let a = registry.register(aapl.clone());
        let b = registry.register(amzn.clone());
        registry.set_subscription(a, "AAPL");
        registry.set_subscription(b, "AMZN");

        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(run_coalescer(rx, registry.clone(), Duration::from_secs(1)));
        tokio::task::yield_now().await;

        tx.send(UpdateEvent::live(candle("AAPL", 1.0))).unwrap();
        tx.send(UpdateEvent::live(candle("AMZN", 2.0))).unwrap();
        tokio::time::sleep(Duration::from_millis(1_100)).await;

        assert_eq!(aapl.frames().len(), 1);
        assert_eq!(amzn.frames().len(), 1);

        drop(tx);
        handle.await.unwrap();
    }
}
