use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, warn};

use crate::db::models::Market;
use crate::db::pool::DbPool;
use crate::db::queries::markets::upsert_markets;
use crate::venue::{RawMarket, VenueClient};

use super::{Collector, CollectorStats};

/// Discovers markets and refreshes their mutable metadata every 5 minutes
/// (default cadence, configurable). Does not touch `price_snapshots` — that
/// table is owned by [`super::price_snapshot::PriceSnapshotCollector`] even
/// though the same API response carries price data, because that's the
/// table the price poller is responsible for writing.
pub struct MarketMetadataCollector {
    venue: Arc<dyn VenueClient>,
    db: Arc<DbPool>,
    stats: Arc<CollectorStats>,
}

impl MarketMetadataCollector {
    pub fn new(venue: Arc<dyn VenueClient>, db: Arc<DbPool>) -> Self {
        Self { venue, db, stats: CollectorStats::new() }
    }

    pub fn stats(&self) -> Arc<CollectorStats> {
        self.stats.clone()
    }
}

fn to_market(raw: &RawMarket) -> Market {
    let now = Utc::now();
    Market {
        market_id: raw.id.clone().unwrap_or_else(|| raw.condition_id.clone()),
        event_id: raw.event_id.clone(),
        condition_id: raw.condition_id.clone(),
        slug: raw.slug.clone(),
        question: raw.question.clone().unwrap_or_default(),
        outcomes: raw.outcomes.0.clone(),
        clob_token_ids: raw.clob_token_ids.0.clone(),
        neg_risk: raw.neg_risk.unwrap_or(false),
        tick_size: raw.tick_size_f64(),
        active: raw.active.unwrap_or(false),
        closed: raw.closed.unwrap_or(false),
        accepting_orders: raw.accepting_orders.unwrap_or(false),
        volume_total: raw.volume_f64(),
        liquidity: raw.liquidity_f64(),
        created_at: now,
        updated_at: now,
    }
}

#[async_trait]
impl Collector for MarketMetadataCollector {
    fn name(&self) -> &'static str {
        "market_metadata"
    }

    fn stats(&self) -> Arc<CollectorStats> {
        self.stats.clone()
    }

    async fn collect_once(&self) -> u64 {
        let raw_markets = match self.venue.list_active_markets().await {
            Ok(markets) => markets,
            Err(e) => {
                warn!(target: "collector", collector = self.name(), error = %e, "market discovery failed");
                self.stats.record_error(e);
                return 0;
            }
        };

        let markets: Vec<Market> = raw_markets.iter().map(to_market).collect();
        if markets.is_empty() {
            debug!(target: "collector", collector = self.name(), "no active markets returned");
            self.stats.record_success(0);
            return 0;
        }

        match upsert_markets(self.db.raw(), &markets).await {
            Ok(n) => {
                self.stats.record_success(n as u64);
                n as u64
            }
            Err(e) => {
                warn!(target: "collector", collector = self.name(), error = %e, "market upsert failed");
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

    #[test]
    fn to_market_falls_back_to_condition_id_when_id_missing() {
        let raw = RawMarket {
            id: None,
            condition_id: "c1".to_string(),
            slug: None,
            question: None,
            outcomes: FlexArray(vec!["Yes".to_string(), "No".to_string()]),
            outcome_prices: FlexArray(vec![]),
            clob_token_ids: FlexArray(vec!["tA".to_string(), "tB".to_string()]),
            neg_risk: None,
            tick_size: None,
            active: Some(true),
            closed: Some(false),
            accepting_orders: Some(true),
            volume: None,
            liquidity: None,
            event_id: None,
        };

        let market = to_market(&raw);
        assert_eq!(market.market_id, "c1");
        assert_eq!(market.tick_size, 0.01);
        assert!(market.active);
        assert!(!market.closed);
    }
}
