// =============================================================================
// Subscriber Registry — who wants which symbol
// =============================================================================
//
// One entry per connected consumer. The registry references each consumer's
// transport but does not own the connection; it writes serialized updates to
// it and, on a failed write, drops the entry and asks the transport to close.
// A failure is confined to the consumer that produced it.
//
// Writers (connection tasks) and the single reader (the coalescer's fan-out)
// share the map through a parking_lot RwLock. Transport writes never block,
// so no lock is ever held across an await point.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::TransportError;
use crate::types::UpdateEvent;

/// Opaque handle identifying one consumer connection.
pub type ConsumerId = Uuid;

/// Outbound half of a consumer connection.
pub trait ConsumerTransport: Send + Sync {
    /// Queue one text frame. Must not block.
    fn write(&self, payload: &str) -> Result<(), TransportError>;

    /// Tear the connection down. Called at most once, after the entry has
    /// been removed.
    fn close(&self);
}

struct SubscriberEntry {
    transport: Arc<dyn ConsumerTransport>,
    /// `None` until the consumer sends its first subscribe message.
    symbol: Option<String>,
}

/// Result of one fan-out pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FanOutReport {
    pub delivered: usize,
    pub evicted: usize,
}

#[derive(Default)]
pub struct SubscriberRegistry {
    entries: RwLock<HashMap<ConsumerId, SubscriberEntry>>,
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a consumer with no subscription yet.
    pub fn register(&self, transport: Arc<dyn ConsumerTransport>) -> ConsumerId {
        let id = Uuid::new_v4();
        self.entries.write().insert(
            id,
            SubscriberEntry {
                transport,
                symbol: None,
            },
        );
        debug!(consumer = %id, "consumer registered");
        id
    }

    /// Replace the consumer's subscription. Returns `false` if the consumer is
    /// no longer registered.
    pub fn set_subscription(&self, id: ConsumerId, symbol: impl Into<String>) -> bool {
        let symbol = symbol.into();
        match self.entries.write().get_mut(&id) {
            Some(entry) => {
                info!(consumer = %id, symbol = %symbol, "consumer subscribed");
                entry.symbol = Some(symbol);
                true
            }
            None => false,
        }
    }

    /// Remove the consumer. Idempotent; the transport is not closed here since
    /// callers use this when the transport itself reported the failure.
    pub fn unregister(&self, id: ConsumerId) -> bool {
        let removed = self.entries.write().remove(&id).is_some();
        if removed {
            debug!(consumer = %id, "consumer unregistered");
        }
        removed
    }

    #[cfg(test)]
    pub fn subscription(&self, id: ConsumerId) -> Option<String> {
        self.entries
            .read()
            .get(&id)
            .and_then(|entry| entry.symbol.clone())
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Write `update` to every consumer subscribed to its symbol.
    ///
    /// Consumers whose write fails are removed and closed; everyone else still
    /// receives the update.
    pub fn fan_out(&self, update: &UpdateEvent) -> FanOutReport {
        let payload = match serde_json::to_string(update) {
            Ok(json) => json,
            Err(e) => {
                warn!(symbol = %update.symbol(), error = %e, "failed to serialize update");
                return FanOutReport::default();
            }
        };

        let mut report = FanOutReport::default();
        let mut failed: Vec<ConsumerId> = Vec::new();

        {
            let entries = self.entries.read();
            for (id, entry) in entries.iter() {
                if entry.symbol.as_deref() != Some(update.symbol()) {
                    continue;
                }
                match entry.transport.write(&payload) {
                    Ok(()) => report.delivered += 1,
                    Err(e) => {
                        warn!(consumer = %id, symbol = %update.symbol(), error = %e, "consumer write failed — evicting");
                        failed.push(*id);
                    }
                }
            }
        }

        if !failed.is_empty() {
            let mut entries = self.entries.write();
            for id in failed {
                if let Some(entry) = entries.remove(&id) {
                    entry.transport.close();
                    report.evicted += 1;
                }
            }
        }

        debug!(
            symbol = %update.symbol(),
            kind = %update.kind,
            delivered = report.delivered,
            evicted = report.evicted,
            "update fanned out"
        );
        report
    }
}

// ---------------------------------------------------------------------------
// Test transport
// ---------------------------------------------------------------------------

/// Records every frame; can be told to fail writes.
#[cfg(test)]
#[derive(Default)]
pub struct RecordingTransport {
    frames: parking_lot::Mutex<Vec<String>>,
    fail: std::sync::atomic::AtomicBool,
    closed: std::sync::atomic::AtomicBool,
}

#[cfg(test)]
impl RecordingTransport {
    pub fn failing() -> Self {
        let t = Self::default();
        t.set_failing(true);
        t
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn frames(&self) -> Vec<UpdateEvent> {
        self.frames
            .lock()
            .iter()
            .map(|f| serde_json::from_str(f).unwrap())
            .collect()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[cfg(test)]
impl ConsumerTransport for RecordingTransport {
    fn write(&self, payload: &str) -> Result<(), TransportError> {
        if self.fail.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        self.frames.lock().push(payload.to_string());
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, std::sync::atomic::Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
