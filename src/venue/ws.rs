use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use crate::db::models::{Trade, TradeSide};

use super::raw::{parse_millis_timestamp, TradeEvent};

/// Each connection carries at most this many subscriptions; a larger
/// instrument set is sharded across several connections.
const MAX_INSTRUMENTS_PER_CONN: usize = 500;
const QUEUE_CAPACITY: usize = 10_000;
const RECONNECT_BASE_DELAY: Duration = Duration::from_millis(500);
const RECONNECT_MAX_DELAY: Duration = Duration::from_secs(30);

/// Handle to a pool of self-reconnecting websocket connections feeding one
/// shared, bounded queue of parsed trades. A full queue drops the incoming
/// event and counts it rather than blocking the connection's read loop —
/// the keepalive and parse path must never stall behind a slow consumer.
/// Shared counters a [`TradeStream`]'s connection tasks update directly,
/// read by the owning collector's health snapshot.
#[derive(Default)]
struct StreamCounters {
    /// Every well-formed trade event parsed off the wire, counted before
    /// the enqueue attempt — this is the `trades_received` the health
    /// snapshot reports, independent of whether the queue had room.
    received: AtomicU64,
    dropped: AtomicU64,
    enqueued: AtomicU64,
    reconnections: AtomicU64,
}

pub struct TradeStream {
    receiver: mpsc::Receiver<Trade>,
    handles: Vec<JoinHandle<()>>,
    counters: Arc<StreamCounters>,
    connection_count: usize,
}

impl TradeStream {
    pub fn connect(ws_host: String, token_ids: Vec<String>, ping_interval: Duration) -> Self {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        let counters = Arc::new(StreamCounters::default());
        let mut handles = Vec::new();

        for chunk in token_ids.chunks(MAX_INSTRUMENTS_PER_CONN) {
            let host = ws_host.clone();
            let ids = chunk.to_vec();
            let tx = tx.clone();
            let counters = counters.clone();
            handles.push(tokio::spawn(connection_loop(host, ids, ping_interval, tx, counters)));
        }

        let connection_count = handles.len();
        Self { receiver: rx, handles, counters, connection_count }
    }

    pub async fn recv(&mut self) -> Option<Trade> {
        self.receiver.recv().await
    }

    pub fn received_count(&self) -> u64 {
        self.counters.received.load(Ordering::Relaxed)
    }

    pub fn dropped_count(&self) -> u64 {
        self.counters.dropped.load(Ordering::Relaxed)
    }

    pub fn enqueued_count(&self) -> u64 {
        self.counters.enqueued.load(Ordering::Relaxed)
    }

    pub fn reconnection_count(&self) -> u64 {
        self.counters.reconnections.load(Ordering::Relaxed)
    }

    pub fn connection_count(&self) -> usize {
        self.connection_count
    }

    /// Aborts every connection task. Any trades already buffered in the
    /// queue remain readable via `recv` until drained.
    pub async fn stop(self) {
        for handle in self.handles {
            handle.abort();
        }
    }
}

async fn connection_loop(
    host: String,
    token_ids: Vec<String>,
    ping_interval: Duration,
    tx: mpsc::Sender<Trade>,
    counters: Arc<StreamCounters>,
) {
    let mut attempt: u32 = 0;
    let mut first = true;
    loop {
        if !first {
            counters.reconnections.fetch_add(1, Ordering::Relaxed);
        }
        first = false;

        match run_connection(&host, &token_ids, ping_interval, &tx, &counters).await {
            Ok(()) => {
                debug!(target: "venue", "websocket connection closed, reconnecting");
                attempt = 0;
            }
            Err(e) => {
                warn!(target: "venue", error = %e, attempt, "websocket connection dropped, reconnecting");
                attempt = attempt.saturating_add(1);
            }
        }

        let delay = RECONNECT_BASE_DELAY
            .saturating_mul(1u32 << attempt.min(6))
            .min(RECONNECT_MAX_DELAY);
        let jitter = Duration::from_millis(rand::random::<u64>() % 250);
        tokio::time::sleep(delay + jitter).await;
    }
}

async fn run_connection(
    host: &str,
    token_ids: &[String],
    ping_interval: Duration,
    tx: &mpsc::Sender<Trade>,
    counters: &Arc<StreamCounters>,
) -> Result<(), tokio_tungstenite::tungstenite::Error> {
    let (ws_stream, _) = tokio_tungstenite::connect_async(host).await?;
    let (mut write, mut read) = ws_stream.split();

    let subscribe = serde_json::json!({
        "assets_ids": token_ids,
        "type": "market",
    });
    write.send(Message::Text(subscribe.to_string())).await?;

    // Application-level keepalive, independent of the transport's own
    // ping/pong — the venue expects a text "PING" on the wire at this
    // cadence or it closes the connection from its side.
    let mut ping_tick = tokio::time::interval(ping_interval);
    ping_tick.tick().await;

    loop {
        tokio::select! {
            _ = ping_tick.tick() => {
                write.send(Message::Text("PING".to_string())).await?;
            }
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => handle_payload(&text, tx, counters).await,
                    Some(Ok(Message::Ping(payload))) => {
                        write.send(Message::Pong(payload)).await?;
                    }
                    Some(Ok(Message::Close(_))) | None => return Ok(()),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e),
                }
            }
        }
    }
}

async fn handle_payload(text: &str, tx: &mpsc::Sender<Trade>, counters: &Arc<StreamCounters>) {
    if text == "PONG" {
        return;
    }

    let events: Vec<TradeEvent> = match serde_json::from_str::<Vec<TradeEvent>>(text) {
        Ok(v) => v,
        Err(_) => match serde_json::from_str::<TradeEvent>(text) {
            Ok(single) => vec![single],
            Err(_) => return,
        },
    };

    for event in events {
        let Some(trade) = to_trade(event) else { continue };

        counters.received.fetch_add(1, Ordering::Relaxed);

        match tx.try_send(trade) {
            Ok(()) => {
                counters.enqueued.fetch_add(1, Ordering::Relaxed);
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                counters.dropped.fetch_add(1, Ordering::Relaxed);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }
}

fn to_trade(event: TradeEvent) -> Option<Trade> {
    let side = TradeSide::from_str(&event.side.to_uppercase())?;
    let price: f64 = event.price.parse().ok()?;
    let size: f64 = event.size.parse().ok()?;
    let ts = parse_millis_timestamp(&event.timestamp).unwrap_or_else(Utc::now);

    Some(Trade {
        ts,
        token_id: event.token_id,
        side: side.as_str().to_string(),
        price,
        size,
        trade_id: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn to_trade_parses_buy_side_case_insensitively() {
        let event = TradeEvent {
            token_id: "tok-1".to_string(),
            side: "buy".to_string(),
            price: "0.42".to_string(),
            size: "10".to_string(),
            timestamp: "1700000000000".to_string(),
        };
        let trade = to_trade(event).unwrap();
        assert_eq!(trade.side, "BUY");
        assert_eq!(trade.trade_id, None);
        assert!((trade.price - 0.42).abs() < 1e-9);
    }

    #[test]
    fn to_trade_rejects_unparseable_price() {
        let event = TradeEvent {
            token_id: "tok-1".to_string(),
            side: "BUY".to_string(),
            price: "not-a-number".to_string(),
            size: "10".to_string(),
            timestamp: "1700000000000".to_string(),
        };
        assert!(to_trade(event).is_none());
    }
}
