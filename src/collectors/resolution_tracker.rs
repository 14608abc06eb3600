use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use tracing::{debug, warn};

use crate::db::models::Resolution;
use crate::db::pool::DbPool;
use crate::db::queries::markets::mark_condition_closed;
use crate::db::queries::resolutions::{get_resolved_condition_ids, upsert_resolution};
use crate::venue::{RawMarket, VenueClient};

use super::{Collector, CollectorStats};

const PAGE_CEILING: usize = 3;
const LOOKBACK_DAYS: i64 = 30;

/// Watches for newly-closed markets and infers their winning outcome every
/// 10 min (default). Bounds its own lookback window and page count so a
/// venue with years of closed-market history never turns one tick into an
/// unbounded scan.
pub struct ResolutionTrackerCollector {
    venue: Arc<dyn VenueClient>,
    db: Arc<DbPool>,
    stats: Arc<CollectorStats>,
}

impl ResolutionTrackerCollector {
    pub fn new(venue: Arc<dyn VenueClient>, db: Arc<DbPool>) -> Self {
        Self { venue, db, stats: CollectorStats::new() }
    }

    pub fn stats(&self) -> Arc<CollectorStats> {
        self.stats.clone()
    }
}

/// Finds the single outcome priced at exactly 1.0 and maps it to its label
/// and token id. Returns `None` on any ambiguity or malformed input —
/// leaving a market unresolved is always preferable to recording a wrong
/// winner.
pub fn infer_winner(raw: &RawMarket) -> Option<Resolution> {
    let prices = raw.outcome_prices_f64();
    let outcomes = &raw.outcomes.0;
    let token_ids = &raw.clob_token_ids.0;

    if prices.is_empty() || prices.len() != outcomes.len() || prices.len() != token_ids.len() {
        return None;
    }

    let mut winners = prices.iter().enumerate().filter(|(_, p)| **p == 1.0);
    let (idx, _) = winners.next()?;
    if winners.next().is_some() {
        return None;
    }

    Some(Resolution {
        condition_id: raw.condition_id.clone(),
        outcome: Some(outcomes[idx].clone()),
        winner_token_id: Some(token_ids[idx].clone()),
        resolved_at: Utc::now(),
        payout_price: Some(1.0),
        detection_method: "final_prices".to_string(),
    })
}

#[async_trait]
impl Collector for ResolutionTrackerCollector {
    fn name(&self) -> &'static str {
        "resolution_tracker"
    }

    fn stats(&self) -> Arc<CollectorStats> {
        self.stats.clone()
    }

    async fn collect_once(&self) -> u64 {
        let cutoff = Utc::now() - Duration::days(LOOKBACK_DAYS);

        let closed_markets = match self.venue.list_closed_markets_since(cutoff, PAGE_CEILING).await {
            Ok(markets) => markets,
            Err(e) => {
                warn!(target: "collector", collector = self.name(), error = %e, "closed-market discovery failed");
                self.stats.record_error(e);
                return 0;
            }
        };

        if closed_markets.is_empty() {
            self.stats.record_success(0);
            return 0;
        }

        let condition_ids: Vec<String> = closed_markets
            .iter()
            .map(|m| m.condition_id.clone())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();

        for condition_id in &condition_ids {
            if let Err(e) = mark_condition_closed(self.db.raw(), condition_id).await {
                warn!(target: "collector", collector = self.name(), condition_id, error = %e, "failed to mark market closed");
                self.stats.record_error(e);
            }
        }

        let already_resolved: HashSet<String> = match get_resolved_condition_ids(self.db.raw(), &condition_ids).await {
            Ok(ids) => ids.into_iter().collect(),
            Err(e) => {
                warn!(target: "collector", collector = self.name(), error = %e, "failed to read resolved condition ids");
                self.stats.record_error(e);
                return 0;
            }
        };

        let mut resolved_count = 0u64;
        for raw in closed_markets.iter().filter(|m| !already_resolved.contains(&m.condition_id)) {
            match infer_winner(raw) {
                Some(resolution) => match upsert_resolution(self.db.raw(), &resolution).await {
                    Ok(()) => resolved_count += 1,
                    Err(e) => {
                        warn!(target: "collector", collector = self.name(), condition_id = %raw.condition_id, error = %e, "failed to write resolution");
                        self.stats.record_error(e);
                    }
                },
                None => {
                    debug!(target: "collector", collector = self.name(), condition_id = %raw.condition_id, "no resolution inferred");
                }
            }
        }

        self.stats.record_success(resolved_count);
        resolved_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::venue::raw::FlexArray;

    fn raw_with(outcomes: &[&str], prices: &[&str], tokens: &[&str]) -> RawMarket {
        RawMarket {
            id: None,
            condition_id: "c1".to_string(),
            slug: None,
            question: None,
            outcomes: FlexArray(outcomes.iter().map(|s| s.to_string()).collect()),
            outcome_prices: FlexArray(prices.iter().map(|s| s.to_string()).collect()),
            clob_token_ids: FlexArray(tokens.iter().map(|s| s.to_string()).collect()),
            neg_risk: None,
            tick_size: None,
            active: None,
            closed: Some(true),
            accepting_orders: None,
            volume: None,
            liquidity: None,
            event_id: None,
        }
    }

    #[test]
    fn s1_binary_resolved_infers_yes() {
        let raw = raw_with(&["Yes", "No"], &["1", "0"], &["tA", "tB"]);
        let resolution = infer_winner(&raw).expect("resolution expected");
        assert_eq!(resolution.condition_id, "c1");
        assert_eq!(resolution.outcome.as_deref(), Some("Yes"));
        assert_eq!(resolution.winner_token_id.as_deref(), Some("tA"));
        assert_eq!(resolution.payout_price, Some(1.0));
        assert_eq!(resolution.detection_method, "final_prices");
    }

    #[test]
    fn s2_unresolved_prices_infer_nothing() {
        let raw = raw_with(&["Yes", "No"], &["0.52", "0.48"], &["tA", "tB"]);
        assert!(infer_winner(&raw).is_none());
    }

    #[test]
    fn s3_malformed_json_infers_nothing() {
        let mut raw = raw_with(&["Yes", "No"], &[], &["tA", "tB"]);
        raw.outcome_prices = FlexArray(crate::venue::raw::flex_array_from_value(
            &serde_json::Value::String(r#"["1", "0""#.to_string()),
        ).unwrap_or_default());
        assert!(infer_winner(&raw).is_none());
    }

    #[test]
    fn ambiguous_double_winner_infers_nothing() {
        let raw = raw_with(&["Yes", "No", "Maybe"], &["1", "1", "0"], &["tA", "tB", "tC"]);
        assert!(infer_winner(&raw).is_none());
    }
}
