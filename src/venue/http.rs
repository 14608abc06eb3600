use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::ratelimit::TokenBucket;

use super::raw::{RawMarket, RawOrderbook};
use super::ws::TradeStream;
use super::{VenueClient, VenueError, VenueResult};

const DEFAULT_PAGE_LIMIT: u32 = 100;
const ORDERBOOK_BATCH_SIZE: usize = 50;
const MAX_RETRIES: u32 = 3;

#[derive(Debug, Deserialize)]
struct MarketsPage {
    data: Vec<RawMarket>,
    #[serde(default)]
    next_cursor: Option<String>,
}

/// HTTP implementation of [`VenueClient`]. Discovery and order-book reads
/// are gated by their own [`TokenBucket`]; transient failures retry with
/// capped exponential backoff, since this client never writes to the venue
/// and every call is safe to simply redo.
pub struct HttpVenueClient {
    http: reqwest::Client,
    http_host: String,
    ws_host: String,
    discovery_bucket: Arc<TokenBucket>,
    orderbook_bucket: Arc<TokenBucket>,
}

impl HttpVenueClient {
    pub fn new(http_host: impl Into<String>, ws_host: impl Into<String>) -> VenueResult<Self> {
        let http = reqwest::Client::builder()
            .user_agent("polymarket-acquisition-daemon/0.1")
            .timeout(Duration::from_secs(15))
            .build()?;

        Ok(Self {
            http,
            http_host: http_host.into(),
            ws_host: ws_host.into(),
            discovery_bucket: Arc::new(TokenBucket::market_discovery()),
            orderbook_bucket: Arc::new(TokenBucket::orderbook_read()),
        })
    }

    fn backoff(attempt: u32) -> Duration {
        let capped = attempt.min(5);
        Duration::from_millis((250u64 * (1u64 << capped)).min(5_000))
    }

    fn parse_retry_after(resp: &reqwest::Response) -> Option<Duration> {
        resp.headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_secs)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, String)],
        bucket: &TokenBucket,
    ) -> VenueResult<T> {
        let mut attempt = 0;
        loop {
            bucket.acquire(1.0).await;

            let resp = self.http.get(url).query(query).send().await?;

            if resp.status().is_success() {
                return Ok(resp.json::<T>().await?);
            }

            if resp.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
                let retry_after = Self::parse_retry_after(&resp).unwrap_or(Duration::from_secs(1));
                warn!(target: "venue", retry_after_secs = retry_after.as_secs(), "throttled, forcing bucket drain");
                bucket.force_drain_for(retry_after).await;
                continue;
            }

            if resp.status().is_server_error() && attempt < MAX_RETRIES {
                attempt += 1;
                sleep(Self::backoff(attempt)).await;
                continue;
            }

            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(VenueError::HttpStatus { status, body, retry_after: None });
        }
    }

    async fn post_json<B: serde::Serialize + ?Sized, T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        body: &B,
        bucket: &TokenBucket,
    ) -> VenueResult<T> {
        let mut attempt = 0;
        loop {
            bucket.acquire(1.0).await;

            let resp = self.http.post(url).json(body).send().await?;

            if resp.status().is_success() {
                return Ok(resp.json::<T>().await?);
            }

            if resp.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
                let retry_after = Self::parse_retry_after(&resp).unwrap_or(Duration::from_secs(1));
                bucket.force_drain_for(retry_after).await;
                continue;
            }

            if resp.status().is_server_error() && attempt < MAX_RETRIES {
                attempt += 1;
                sleep(Self::backoff(attempt)).await;
                continue;
            }

            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(VenueError::HttpStatus { status, body, retry_after: None });
        }
    }

    async fn paginate_markets(
        &self,
        base_query: &[(&str, String)],
        max_pages: Option<usize>,
    ) -> VenueResult<Vec<RawMarket>> {
        let url = format!("{}/markets", self.http_host.trim_end_matches('/'));
        let mut out = Vec::new();
        let mut cursor: Option<String> = None;
        let mut page_count = 0usize;

        loop {
            let mut query = base_query.to_vec();
            query.push(("limit", DEFAULT_PAGE_LIMIT.to_string()));
            if let Some(c) = &cursor {
                query.push(("next_cursor", c.clone()));
            }

            let page: MarketsPage = self.get_json(&url, &query, &self.discovery_bucket).await?;
            let got = page.data.len();
            out.extend(page.data);
            page_count += 1;

            debug!(target: "venue", page = page_count, got, "fetched market discovery page");

            match page.next_cursor {
                Some(next) if got > 0 => cursor = Some(next),
                _ => break,
            }

            if let Some(max) = max_pages {
                if page_count >= max {
                    break;
                }
            }
        }

        Ok(out)
    }
}

#[async_trait::async_trait]
impl VenueClient for HttpVenueClient {
    async fn list_active_markets(&self) -> VenueResult<Vec<RawMarket>> {
        self.paginate_markets(&[("active", "true".to_string()), ("closed", "false".to_string())], None)
            .await
    }

    async fn list_closed_markets_since(
        &self,
        cutoff: DateTime<Utc>,
        max_pages: usize,
    ) -> VenueResult<Vec<RawMarket>> {
        self.paginate_markets(
            &[
                ("closed", "true".to_string()),
                ("end_date_min", cutoff.to_rfc3339()),
            ],
            Some(max_pages),
        )
        .await
    }

    async fn get_orderbooks(&self, token_ids: &[String], depth: usize) -> VenueResult<Vec<RawOrderbook>> {
        if token_ids.is_empty() {
            return Ok(Vec::new());
        }

        let url = format!("{}/books", self.http_host.trim_end_matches('/'));
        let mut out = Vec::new();

        for chunk in token_ids.chunks(ORDERBOOK_BATCH_SIZE) {
            #[derive(serde::Serialize)]
            struct BooksRequest<'a> {
                token_ids: &'a [String],
                depth: usize,
            }

            let books: Vec<RawOrderbook> = self
                .post_json(&url, &BooksRequest { token_ids: chunk, depth }, &self.orderbook_bucket)
                .await?;
            out.extend(books);
        }

        Ok(out)
    }

    fn open_trade_stream(&self, token_ids: Vec<String>, ping_interval: Duration) -> TradeStream {
        TradeStream::connect(self.ws_host.clone(), token_ids, ping_interval)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_is_monotonically_capped() {
        assert!(HttpVenueClient::backoff(0) < HttpVenueClient::backoff(3));
        assert!(HttpVenueClient::backoff(10) <= Duration::from_secs(5));
    }
}
