use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, warn};

use crate::db::models::{OrderbookLevels, OrderbookSnapshot};
use crate::db::pool::DbPool;
use crate::db::queries::markets::get_active_markets;
use crate::db::queries::orderbooks::insert_orderbook_snapshots;
use crate::venue::{RawBookLevel, RawOrderbook, VenueClient};

use super::{Collector, CollectorStats};

/// Snapshots top-of-book depth every 5 min (default). Every outcome token
/// in a binary market gets its own row; `side` is derived from the token's
/// position in the owning market's `outcomes`/`clob_token_ids` pair (index 0
/// → "yes", index 1 → "no") rather than from anything the order-book
/// endpoint itself returns, since that endpoint is keyed purely by token id.
pub struct OrderbookSnapshotCollector {
    venue: Arc<dyn VenueClient>,
    db: Arc<DbPool>,
    depth: usize,
    stats: Arc<CollectorStats>,
}

impl OrderbookSnapshotCollector {
    pub fn new(venue: Arc<dyn VenueClient>, db: Arc<DbPool>, depth: usize) -> Self {
        Self { venue, db, depth, stats: CollectorStats::new() }
    }

    pub fn stats(&self) -> Arc<CollectorStats> {
        self.stats.clone()
    }
}

fn levels_from_raw(levels: &[RawBookLevel], depth: usize) -> OrderbookLevels {
    let parsed: Vec<(f64, f64)> = levels
        .iter()
        .filter_map(|l| Some((l.price.parse::<f64>().ok()?, l.size.parse::<f64>().ok()?)))
        .collect();
    OrderbookLevels { levels: parsed }.top(depth)
}

fn to_snapshot(raw: &RawOrderbook, side: &'static str, depth: usize) -> OrderbookSnapshot {
    let bids = levels_from_raw(&raw.bids, depth);
    let asks = levels_from_raw(&raw.asks, depth);
    let bid_depth_usd = Some(bids.depth_usd());
    let ask_depth_usd = Some(asks.depth_usd());

    OrderbookSnapshot {
        ts: Utc::now(),
        token_id: raw.token_id.clone(),
        side: side.to_string(),
        bids: sqlx::types::Json(bids),
        asks: sqlx::types::Json(asks),
        bid_depth_usd,
        ask_depth_usd,
    }
}

/// Maps each active market's `clob_token_ids` by parity onto "yes"/"no".
fn build_side_map(markets: &[crate::db::models::Market]) -> HashMap<String, &'static str> {
    let mut map = HashMap::new();
    for m in markets {
        for (i, token_id) in m.clob_token_ids.iter().enumerate() {
            let side = if i % 2 == 0 { "yes" } else { "no" };
            map.insert(token_id.clone(), side);
        }
    }
    map
}

#[async_trait]
impl Collector for OrderbookSnapshotCollector {
    fn name(&self) -> &'static str {
        "orderbook_snapshot"
    }

    fn stats(&self) -> Arc<CollectorStats> {
        self.stats.clone()
    }

    async fn collect_once(&self) -> u64 {
        let active_markets = match get_active_markets(self.db.raw()).await {
            Ok(markets) => markets,
            Err(e) => {
                warn!(target: "collector", collector = self.name(), error = %e, "failed to read active markets");
                self.stats.record_error(e);
                return 0;
            }
        };

        let side_map = build_side_map(&active_markets);
        let token_ids: Vec<String> = side_map.keys().cloned().collect();

        if token_ids.is_empty() {
            debug!(target: "collector", collector = self.name(), "no active tokens known yet");
            self.stats.record_success(0);
            return 0;
        }

        let books = match self.venue.get_orderbooks(&token_ids, self.depth).await {
            Ok(books) => books,
            Err(e) => {
                warn!(target: "collector", collector = self.name(), error = %e, "order book fetch failed");
                self.stats.record_error(e);
                return 0;
            }
        };

        let snapshots: Vec<OrderbookSnapshot> = books
            .iter()
            .filter_map(|raw| {
                let side = side_map.get(raw.token_id.as_str())?;
                Some(to_snapshot(raw, side, self.depth))
            })
            .collect();

        match insert_orderbook_snapshots(self.db.raw(), &snapshots).await {
            Ok(n) => {
                self.stats.record_success(n);
                n
            }
            Err(e) => {
                warn!(target: "collector", collector = self.name(), error = %e, "order book insert failed");
                self.stats.record_error(e);
                0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn levels_from_raw_skips_malformed_entries_and_caps_depth() {
        let raw = vec![
            RawBookLevel { price: "0.49".to_string(), size: "100".to_string() },
            RawBookLevel { price: "not-a-number".to_string(), size: "5".to_string() },
            RawBookLevel { price: "0.48".to_string(), size: "200".to_string() },
        ];
        let levels = levels_from_raw(&raw, 1);
        assert_eq!(levels.levels, vec![(0.49, 100.0)]);
    }

    #[test]
    fn missing_side_produces_empty_levels_not_null() {
        let raw = RawOrderbook { token_id: "t1".to_string(), bids: vec![], asks: vec![] };
        let snapshot = to_snapshot(&raw, "yes", 5);
        assert!(snapshot.bids.0.levels.is_empty());
        assert_eq!(snapshot.bid_depth_usd, Some(0.0));
    }
}
