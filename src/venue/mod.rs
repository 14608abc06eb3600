pub mod http;
pub mod raw;
pub mod ws;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

pub use raw::{RawBookLevel, RawMarket, RawOrderbook, TradeEvent};
pub use ws::TradeStream;

#[derive(Debug, Error)]
pub enum VenueError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("HTTP status {status}: {body}")]
    HttpStatus {
        status: reqwest::StatusCode,
        body: String,
        retry_after: Option<std::time::Duration>,
    },

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("serialization error: {0}")]
    SerdeJson(#[from] serde_json::Error),
}

pub type VenueResult<T> = Result<T, VenueError>;

/// Thin wrapper over the venue's REST and websocket surfaces. The
/// core is never given anything but this trait, so tests can swap in a
/// fake without touching collector logic. Every method must be safe for
/// concurrent use — the core shares one client across all collectors.
#[async_trait]
pub trait VenueClient: Send + Sync {
    /// Paginated market discovery, sequentially drained.
    async fn list_active_markets(&self) -> VenueResult<Vec<RawMarket>>;

    /// Markets closed at or after `cutoff`, paginated; used by the
    /// resolution tracker.
    async fn list_closed_markets_since(
        &self,
        cutoff: DateTime<Utc>,
        max_pages: usize,
    ) -> VenueResult<Vec<RawMarket>>;

    /// Batched top-`depth` order books for the given token ids.
    async fn get_orderbooks(&self, token_ids: &[String], depth: usize) -> VenueResult<Vec<RawOrderbook>>;

    /// Opens one or more self-reconnecting websocket connections subscribed
    /// to `token_ids` (sharded across connections once the set grows large)
    /// and returns a handle yielding parsed trade events.
    fn open_trade_stream(&self, token_ids: Vec<String>, ping_interval: std::time::Duration) -> TradeStream;
}
