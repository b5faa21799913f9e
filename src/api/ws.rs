// =============================================================================
// WebSocket Handler — consumer transport
// =============================================================================
//
// Consumers connect to `/ws` and send a plain-text symbol (e.g. `AAPL`) to
// choose what they receive. Any later text frame replaces the subscription.
// Symbols are matched upper-cased, like the configured symbol list.
// Outbound frames are the JSON update envelopes produced by the registry.
//
// Each connection owns a bounded outbound queue. The registry only ever
// enqueues (never blocks); this task drains the queue into the socket with a
// per-write deadline. A full queue or a dead socket gets the consumer evicted
// without affecting anyone else.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Notify};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::app_state::AppState;
use crate::broadcast::{ConsumerId, ConsumerTransport, SubscriberRegistry};
use crate::error::TransportError;

// =============================================================================
// Transport
// =============================================================================

/// Registry-facing half of one WebSocket connection.
pub struct WsTransport {
    outbound: mpsc::Sender<String>,
    shutdown: Arc<Notify>,
    capacity: usize,
}

impl WsTransport {
    pub fn new(outbound: mpsc::Sender<String>, shutdown: Arc<Notify>, capacity: usize) -> Self {
        Self {
            outbound,
            shutdown,
            capacity,
        }
    }
}

impl ConsumerTransport for WsTransport {
    fn write(&self, payload: &str) -> Result<(), TransportError> {
        match self.outbound.try_send(payload.to_string()) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(TransportError::Backlogged {
                capacity: self.capacity,
            }),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(TransportError::Closed),
        }
    }

    fn close(&self) {
        // Stores a permit if the connection task is not currently waiting.
        self.shutdown.notify_one();
    }
}

// =============================================================================
// WebSocket upgrade handler
// =============================================================================

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ws_connection(socket, state))
}

// =============================================================================
// Connection handler
// =============================================================================

/// Apply one inbound text frame. Returns `false` once the consumer is no
/// longer registered.
fn handle_subscribe_text(registry: &SubscriberRegistry, id: ConsumerId, text: &str) -> bool {
    let symbol = text.trim().to_uppercase();
    if symbol.is_empty() {
        debug!(consumer = %id, "ignoring empty subscribe message");
        return true;
    }
    registry.set_subscription(id, symbol)
}

/// Manages a single consumer connection lifecycle.
///
/// One `tokio::select!` loop handles three sources:
///   1. **Outbound queue** — frames enqueued by the registry's fan-out.
///   2. **Shutdown** — the registry evicted this consumer.
///   3. **Inbound** — subscribe messages and Close. Pongs are queued by the
///      socket itself and flushed on the next read.
async fn handle_ws_connection(socket: WebSocket, state: Arc<AppState>) {
    let capacity = state.config.consumer_queue_capacity;
    let write_timeout = state.config.consumer_write_timeout();

    let (tx, mut rx) = mpsc::channel::<String>(capacity);
    let shutdown = Arc::new(Notify::new());
    let transport = Arc::new(WsTransport::new(tx, shutdown.clone(), capacity));
    let id = state.registry.register(transport);
    info!(consumer = %id, "consumer connected");

    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            // ── Outbound: drain frames queued by fan-out ────────────────
            Some(frame) = rx.recv() => {
                match timeout(write_timeout, sender.send(Message::Text(frame))).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        debug!(consumer = %id, error = %e, "WebSocket send failed — disconnecting");
                        break;
                    }
                    Err(_) => {
                        warn!(consumer = %id, timeout_ms = write_timeout.as_millis() as u64, "WebSocket send timed out — disconnecting");
                        break;
                    }
                }
            }

            // ── Evicted by the registry ─────────────────────────────────
            _ = shutdown.notified() => {
                info!(consumer = %id, "consumer evicted — closing");
                let _ = timeout(write_timeout, sender.send(Message::Close(None))).await;
                break;
            }

            // ── Inbound: subscribe messages and control frames ──────────
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if !handle_subscribe_text(&state.registry, id, &text) {
                            break;
                        }
                    }
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                    Some(Ok(Message::Binary(_))) => {
                        debug!(consumer = %id, "WebSocket binary message ignored");
                    }
                    Some(Ok(Message::Close(_))) => {
                        info!(consumer = %id, "WebSocket Close frame received — disconnecting");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(consumer = %id, error = %e, "WebSocket receive error — disconnecting");
                        break;
                    }
                    None => {
                        info!(consumer = %id, "WebSocket stream ended");
                        break;
                    }
                }
            }
        }
    }

    state.registry.unregister(id);
    info!(consumer = %id, "consumer disconnected");
}

// =============================================================================
// Tests
// =============================================================================
