// =============================================================================
// Trade Stream — upstream trade feed client
// =============================================================================
//
// Dials the trade WebSocket, subscribes to every configured symbol and hands
// each decoded tick to the aggregator, in arrival order, from this single
// task. Malformed frames are logged and skipped; they never touch aggregation
// state.
// =============================================================================

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::market_data::CandleAggregator;
use crate::types::TradeEvent;

/// Envelope of every frame the feed sends.
#[derive(Debug, Deserialize)]
struct FeedMessage {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Vec<FeedTrade>,
}

#[derive(Debug, Deserialize)]
struct FeedTrade {
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "p")]
    price: f64,
    #[serde(rename = "v")]
    volume: i64,
    #[serde(rename = "t")]
    timestamp: i64,
}

impl From<FeedTrade> for TradeEvent {
    fn from(t: FeedTrade) -> Self {
        TradeEvent::new(t.symbol, t.price, t.volume, t.timestamp)
    }
}

/// Decode one text frame.
///
/// Returns an empty vector for well-formed frames that carry no trades
/// (`ping`, subscription acks and the like).
///
/// Expected shape:
/// ```json
/// { "type": "trade", "data": [ { "s": "AAPL", "p": 187.2, "v": 100, "t": 1700000000000 } ] }
/// ```
pub fn parse_trade_message(text: &str) -> Result<Vec<TradeEvent>> {
    let msg: FeedMessage = serde_json::from_str(text).context("failed to parse feed message")?;

    if msg.kind != "trade" {
        return Ok(Vec::new());
    }

    Ok(msg.data.into_iter().map(TradeEvent::from).collect())
}

fn subscribe_frame(symbol: &str) -> String {
    serde_json::json!({ "type": "subscribe", "symbol": symbol }).to_string()
}

fn feed_endpoint(feed_url: &str, api_key: &str) -> String {
    if api_key.is_empty() {
        feed_url.to_string()
    } else {
        format!("{feed_url}?token={api_key}")
    }
}

/// Connect to the trade feed and pump trades into `aggregator`.
///
/// Runs until the stream disconnects or an error occurs, then returns so that
/// the caller (main.rs) can decide whether to re-dial.
pub async fn run_trade_stream(
    feed_url: &str,
    api_key: &str,
    symbols: &[String],
    aggregator: &CandleAggregator,
) -> Result<()> {
    info!(url = %feed_url, symbols = ?symbols, "connecting to trade feed");

    let (ws_stream, _response) = connect_async(feed_endpoint(feed_url, api_key))
        .await
        .context("failed to connect to trade feed")?;

    info!("trade feed connected");
    let (mut write, mut read) = ws_stream.split();

    for symbol in symbols {
        write
            .send(Message::Text(subscribe_frame(symbol)))
            .await
            .with_context(|| format!("failed to subscribe to {symbol}"))?;
        debug!(symbol = %symbol, "subscribed");
    }

    loop {
        match read.next().await {
            Some(Ok(Message::Text(text))) => match parse_trade_message(&text) {
                Ok(trades) => {
                    for trade in &trades {
                        aggregator.ingest(trade);
                    }
                }
                Err(e) => {
                    warn!(error = %e, "discarding malformed feed message");
                }
            },
            Some(Ok(Message::Close(frame))) => {
                warn!(frame = ?frame, "trade feed sent close frame");
                return Ok(());
            }
            // Ping / Pong / Binary: tungstenite answers pings itself.
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                error!(error = %e, "trade feed read error");
                return Err(e.into());
            }
            None => {
                warn!("trade feed stream ended");
                return Ok(());
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
