use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Row model for the `markets` table.
///
/// Created on first sighting from a metadata poll, upserted on every
/// subsequent poll. Never deleted.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Market {
    pub market_id: String,
    pub event_id: Option<String>,
    pub condition_id: String,
    pub slug: Option<String>,
    pub question: String,
    pub outcomes: Vec<String>,
    pub clob_token_ids: Vec<String>,
    pub neg_risk: bool,
    pub tick_size: f64,
    pub active: bool,
    pub closed: bool,
    pub accepting_orders: bool,
    pub volume_total: Option<f64>,
    pub liquidity: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Append-only row for `price_snapshots`.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PriceSnapshot {
    pub ts: DateTime<Utc>,
    pub token_id: String,
    pub price: f64,
    pub volume_24h: Option<f64>,
    pub liquidity: Option<f64>,
    pub spread: Option<f64>,
    pub last_trade_price: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderbookSide {
    Yes,
    No,
}

impl OrderbookSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderbookSide::Yes => "yes",
            OrderbookSide::No => "no",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "yes" => Some(OrderbookSide::Yes),
            "no" => Some(OrderbookSide::No),
            _ => None,
        }
    }
}

/// `{levels: [[price, size], ...]}` — the single place orderbook JSON is
/// shaped so every reader/writer of `orderbook_snapshots.bids`/`asks` goes
/// through the same struct instead of ad-hoc `serde_json::Value` digging.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrderbookLevels {
    pub levels: Vec<(f64, f64)>,
}

impl OrderbookLevels {
    pub fn empty() -> Self {
        Self { levels: Vec::new() }
    }

    /// Sum of price * size over all levels, used for `bid_depth_usd`/`ask_depth_usd`.
    pub fn depth_usd(&self) -> f64 {
        self.levels.iter().map(|(price, size)| price * size).sum()
    }

    pub fn top(&self, n: usize) -> Self {
        Self {
            levels: self.levels.iter().take(n).copied().collect(),
        }
    }
}

/// Append-only row for `orderbook_snapshots`.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct OrderbookSnapshot {
    pub ts: DateTime<Utc>,
    pub token_id: String,
    pub side: String,
    pub bids: sqlx::types::Json<OrderbookLevels>,
    pub asks: sqlx::types::Json<OrderbookLevels>,
    pub bid_depth_usd: Option<f64>,
    pub ask_depth_usd: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeSide {
    Buy,
    Sell,
}

impl TradeSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeSide::Buy => "BUY",
            TradeSide::Sell => "SELL",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "BUY" => Some(TradeSide::Buy),
            "SELL" => Some(TradeSide::Sell),
            _ => None,
        }
    }
}

/// Append-only row for `trades`. `trade_id` is `None` for every
/// event sourced from the websocket feed (it never carries one).
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Trade {
    pub ts: DateTime<Utc>,
    pub token_id: String,
    pub side: String,
    pub price: f64,
    pub size: f64,
    pub trade_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionMethod {
    FinalPrices,
    ExplicitField,
    Manual,
}

impl DetectionMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            DetectionMethod::FinalPrices => "final_prices",
            DetectionMethod::ExplicitField => "explicit_field",
            DetectionMethod::Manual => "manual",
        }
    }
}

/// Row model for `resolutions`. Written once a winner is
/// inferred; may be upserted again if detection becomes more authoritative.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Resolution {
    pub condition_id: String,
    pub outcome: Option<String>,
    pub winner_token_id: Option<String>,
    pub resolved_at: DateTime<Utc>,
    pub payout_price: Option<f64>,
    pub detection_method: String,
}
