use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tracing::{info, warn};

use crate::db::models::Trade;
use crate::db::pool::DbPool;
use crate::db::queries::markets::get_active_markets;
use crate::db::queries::trades::insert_trades;
use crate::venue::VenueClient;

/// Structured snapshot of [`TradeListener`] internals. Cloned out of the
/// atomics on every `get_health()` call so a caller can never observe a
/// torn read or mutate live state.
#[derive(Debug, Clone)]
pub struct TradeListenerHealth {
    pub trades_received: u64,
    pub trades_inserted: u64,
    pub batches_inserted: u64,
    pub connections_active: u64,
    pub reconnections: u64,
    pub queue_depth: u64,
    pub drops: u64,
    pub last_trade_ts: Option<DateTime<Utc>>,
    pub last_insert_ts: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct HealthInner {
    trades_received: AtomicU64,
    trades_inserted: AtomicU64,
    batches_inserted: AtomicU64,
    connections_active: AtomicUsize,
    reconnections: AtomicU64,
    drops: AtomicU64,
    queue_depth_hint: AtomicU64,
    last_trade_ts_millis: AtomicI64,
    last_insert_ts_millis: AtomicI64,
    started_at_millis: AtomicI64,
}

/// The trade listener is the one collector that doesn't fit `collect_once`:
/// it owns a long-lived `run()`/`stop()` lifecycle instead of a periodic
/// poll, draining a shared bounded queue fed by one or more self-reconnecting
/// websocket connections.
pub struct TradeListener {
    venue: Arc<dyn VenueClient>,
    db: Arc<DbPool>,
    ping_interval: Duration,
    batch_size: usize,
    drain_idle_timeout: Duration,
    health: HealthInner,
    shutdown: Notify,
    stopping: AtomicBool,
}

impl TradeListener {
    pub fn new(
        venue: Arc<dyn VenueClient>,
        db: Arc<DbPool>,
        ping_interval: Duration,
        batch_size: usize,
        drain_idle_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            venue,
            db,
            ping_interval,
            batch_size,
            drain_idle_timeout,
            health: HealthInner::default(),
            shutdown: Notify::new(),
            stopping: AtomicBool::new(false),
        })
    }

    pub fn get_health(&self) -> TradeListenerHealth {
        let millis_to_dt = |v: i64| if v == 0 { None } else { DateTime::from_timestamp_millis(v) };
        TradeListenerHealth {
            trades_received: self.health.trades_received.load(Ordering::Relaxed),
            trades_inserted: self.health.trades_inserted.load(Ordering::Relaxed),
            batches_inserted: self.health.batches_inserted.load(Ordering::Relaxed),
            connections_active: self.health.connections_active.load(Ordering::Relaxed) as u64,
            reconnections: self.health.reconnections.load(Ordering::Relaxed),
            queue_depth: self.health.queue_depth_hint.load(Ordering::Relaxed),
            drops: self.health.drops.load(Ordering::Relaxed),
            last_trade_ts: millis_to_dt(self.health.last_trade_ts_millis.load(Ordering::Relaxed)),
            last_insert_ts: millis_to_dt(self.health.last_insert_ts_millis.load(Ordering::Relaxed)),
            started_at: millis_to_dt(self.health.started_at_millis.load(Ordering::Relaxed)),
        }
    }

    /// Requests shutdown. `run()` performs one final flush before returning.
    pub fn stop(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        self.shutdown.notify_one();
    }

    /// Discovers the active token universe, opens the connection pool, and
    /// drains trades until `stop()` is called or the stream ends
    /// unexpectedly. Token discovery happens once per `run()` invocation —
    /// if the active set changes meaningfully, the supervisor's restart of
    /// this task on unexpected exit is the refresh mechanism, not a live
    /// resubscription.
    pub async fn run(&self) {
        self.health
            .started_at_millis
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
        self.stopping.store(false, Ordering::SeqCst);

        let active_markets = match get_active_markets(self.db.raw()).await {
            Ok(markets) => markets,
            Err(e) => {
                warn!(target: "collector", collector = "trade_listener", error = %e, "failed to read active markets");
                return;
            }
        };

        let mut tokens: Vec<String> = active_markets
            .into_iter()
            .flat_map(|m| m.clob_token_ids)
            .collect();
        tokens.sort();
        tokens.dedup();

        if tokens.is_empty() {
            warn!(target: "collector", collector = "trade_listener", "no active tokens to subscribe to");
            return;
        }

        let mut stream = self.venue.open_trade_stream(tokens, self.ping_interval);
        self.health
            .connections_active
            .store(stream.connection_count(), Ordering::Relaxed);
        info!(target: "collector", collector = "trade_listener", connections = stream.connection_count(), "trade listener connected");

        let mut batch: Vec<Trade> = Vec::with_capacity(self.batch_size);
        let mut dequeued: u64 = 0;
        let mut idle = tokio::time::interval(self.drain_idle_timeout);
        idle.tick().await;

        loop {
            // `trades_received` mirrors the stream's own count of
            // well-formed events parsed off the wire, not how many this
            // loop has dequeued so far — a dropped-on-full event is still
            // "received" and must stay on the `inserted + drops == received`
            // side of the §8 accounting invariant.
            self.health
                .trades_received
                .store(stream.received_count(), Ordering::Relaxed);
            self.health
                .reconnections
                .store(stream.reconnection_count(), Ordering::Relaxed);
            self.health.drops.store(stream.dropped_count(), Ordering::Relaxed);
            self.health
                .queue_depth_hint
                .store(stream.enqueued_count().saturating_sub(dequeued), Ordering::Relaxed);

            tokio::select! {
                _ = self.shutdown.notified() => {
                    self.flush(&mut batch).await;
                    break;
                }
                _ = idle.tick() => {
                    if !batch.is_empty() {
                        self.flush(&mut batch).await;
                    }
                }
                trade = stream.recv() => {
                    match trade {
                        Some(trade) => {
                            dequeued += 1;
                            self.health
                                .last_trade_ts_millis
                                .store(trade.ts.timestamp_millis(), Ordering::Relaxed);
                            batch.push(trade);
                            if batch.len() >= self.batch_size {
                                self.flush(&mut batch).await;
                            }
                        }
                        None => {
                            warn!(target: "collector", collector = "trade_listener", "trade stream ended unexpectedly");
                            self.flush(&mut batch).await;
                            break;
                        }
                    }
                }
            }
        }

        self.health
            .trades_received
            .store(stream.received_count(), Ordering::Relaxed);
        stream.stop().await;
    }

    async fn flush(&self, batch: &mut Vec<Trade>) {
        if batch.is_empty() {
            return;
        }

        match insert_trades(self.db.raw(), batch).await {
            Ok(n) => {
                self.health.trades_inserted.fetch_add(n, Ordering::Relaxed);
                self.health.batches_inserted.fetch_add(1, Ordering::Relaxed);
                self.health
                    .last_insert_ts_millis
                    .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
            }
            Err(e) => {
                warn!(target: "collector", collector = "trade_listener", error = %e, batch_len = batch.len(), "trade batch insert failed, batch discarded");
            }
        }

        batch.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn health_defaults_to_none_timestamps() {
        let health = HealthInner::default();
        let millis_to_dt = |v: i64| if v == 0 { None::<DateTime<Utc>> } else { DateTime::from_timestamp_millis(v) };
        assert!(millis_to_dt(health.started_at_millis.load(Ordering::Relaxed)).is_none());
    }
}
