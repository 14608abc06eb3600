use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, warn};

use crate::db::models::PriceSnapshot;
use crate::db::pool::DbPool;
use crate::db::queries::markets::get_active_markets;
use crate::db::queries::prices::insert_price_snapshots;
use crate::venue::{RawMarket, VenueClient};

use super::{Collector, CollectorStats};

/// Snapshots prices every 60 s (default). This venue bundles prices with
/// market-discovery responses rather than exposing a dedicated price
/// endpoint, so every run re-fetches discovery and keeps only the tokens
/// already known to be active from the (cheap, indexed) local `markets`
/// table — the metadata poller owns creating/updating those rows; this
/// collector never writes to `markets`.
pub struct PriceSnapshotCollector {
    venue: Arc<dyn VenueClient>,
    db: Arc<DbPool>,
    stats: Arc<CollectorStats>,
}

impl PriceSnapshotCollector {
    pub fn new(venue: Arc<dyn VenueClient>, db: Arc<DbPool>) -> Self {
        Self { venue, db, stats: CollectorStats::new() }
    }

    pub fn stats(&self) -> Arc<CollectorStats> {
        self.stats.clone()
    }
}

/// Zips `outcomes`/`outcome_prices`/`clob_token_ids` by index — the venue
/// guarantees these three lists are parallel — and keeps only tokens present
/// in `known_token_ids`. Malformed or short rows are skipped, never raised.
fn snapshots_from_raw(raw: &RawMarket, known_token_ids: &HashSet<String>) -> Vec<PriceSnapshot> {
    let prices = raw.outcome_prices_f64();
    let token_ids = &raw.clob_token_ids.0;
    let ts = Utc::now();

    token_ids
        .iter()
        .zip(prices.iter())
        .filter(|(token_id, _)| known_token_ids.contains(*token_id))
        .map(|(token_id, price)| PriceSnapshot {
            ts,
            token_id: token_id.clone(),
            price: *price,
            volume_24h: raw.volume_f64(),
            liquidity: raw.liquidity_f64(),
            spread: None,
            last_trade_price: None,
        })
        .collect()
}

#[async_trait]
impl Collector for PriceSnapshotCollector {
    fn name(&self) -> &'static str {
        "price_snapshot"
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

        let known_token_ids: HashSet<String> = active_markets
            .into_iter()
            .flat_map(|m| m.clob_token_ids)
            .collect();

        if known_token_ids.is_empty() {
            debug!(target: "collector", collector = self.name(), "no active tokens known yet");
            self.stats.record_success(0);
            return 0;
        }

        let raw_markets = match self.venue.list_active_markets().await {
            Ok(markets) => markets,
            Err(e) => {
                warn!(target: "collector", collector = self.name(), error = %e, "price refresh discovery call failed");
                self.stats.record_error(e);
                return 0;
            }
        };

        let snapshots: Vec<PriceSnapshot> = raw_markets
            .iter()
            .flat_map(|raw| snapshots_from_raw(raw, &known_token_ids))
            .collect();

        match insert_price_snapshots(self.db.raw(), &snapshots).await {
            Ok(n) => {
                self.stats.record_success(n);
                n
            }
            Err(e) => {
                warn!(target: "collector", collector = self.name(), error = %e, "price snapshot insert failed");
                self.stats.record_error(e);
                0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::venue::raw::FlexArray;

    fn sample_raw() -> RawMarket {
        RawMarket {
            id: Some("m1".to_string()),
            condition_id: "c1".to_string(),
            slug: None,
            question: None,
            outcomes: FlexArray(vec!["Yes".to_string(), "No".to_string()]),
            outcome_prices: FlexArray(vec!["0.6".to_string(), "0.4".to_string()]),
            clob_token_ids: FlexArray(vec!["tA".to_string(), "tB".to_string()]),
            neg_risk: None,
            tick_size: None,
            active: Some(true),
            closed: Some(false),
            accepting_orders: Some(true),
            volume: Some("1000".to_string()),
            liquidity: Some("500".to_string()),
            event_id: None,
        }
    }

    #[test]
    fn keeps_only_known_tokens() {
        let raw = sample_raw();
        let mut known = HashSet::new();
        known.insert("tA".to_string());

        let snapshots = snapshots_from_raw(&raw, &known);
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].token_id, "tA");
        assert!((snapshots[0].price - 0.6).abs() < 1e-9);
        assert_eq!(snapshots[0].volume_24h, Some(1000.0));
    }

    #[test]
    fn empty_known_set_yields_no_snapshots() {
        let raw = sample_raw();
        let snapshots = snapshots_from_raw(&raw, &HashSet::new());
        assert!(snapshots.is_empty());
    }
}
