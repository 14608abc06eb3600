pub mod market_metadata;
pub mod orderbook_snapshot;
pub mod price_snapshot;
pub mod resolution_tracker;
pub mod trade_listener;

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Every periodic collector implements this. `collect_once` must not raise —
/// failures are logged and swallowed by the implementation itself, with 0
/// returned as the produced-row count. This lets the supervisor treat every
/// collector identically regardless of what it actually does.
#[async_trait]
pub trait Collector: Send + Sync {
    fn name(&self) -> &'static str;

    async fn collect_once(&self) -> u64;

    /// Handle to this collector's stats, shared with the supervisor's
    /// health-log loop. Every collector stores its own `Arc<CollectorStats>`
    /// and returns the same handle here, so `record_success`/`record_error`
    /// calls made from inside `collect_once` are visible immediately.
    fn stats(&self) -> Arc<CollectorStats>;
}

/// Atomics-backed stats shared between a collector and the supervisor's
/// health-log loop. `snapshot()` copies out so callers never see a value
/// mutate mid-read.
#[derive(Default)]
pub struct CollectorStats {
    total_items: AtomicU64,
    error_count: AtomicU64,
    last_collect_ts_millis: AtomicI64,
    last_error: std::sync::Mutex<Option<String>>,
}

#[derive(Debug, Clone)]
pub struct CollectorStatsSnapshot {
    pub total_items: u64,
    pub error_count: u64,
    pub last_collect_ts: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl CollectorStats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            total_items: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
            last_collect_ts_millis: AtomicI64::new(0),
            last_error: std::sync::Mutex::new(None),
        })
    }

    pub fn record_success(&self, items: u64) {
        self.total_items.fetch_add(items, Ordering::Relaxed);
        self.last_collect_ts_millis
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub fn record_error(&self, err: impl ToString) {
        self.error_count.fetch_add(1, Ordering::Relaxed);
        self.last_collect_ts_millis
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
        if let Ok(mut slot) = self.last_error.lock() {
            *slot = Some(err.to_string());
        }
    }

    pub fn snapshot(&self) -> CollectorStatsSnapshot {
        let ts_millis = self.last_collect_ts_millis.load(Ordering::Relaxed);
        CollectorStatsSnapshot {
            total_items: self.total_items.load(Ordering::Relaxed),
            error_count: self.error_count.load(Ordering::Relaxed),
            last_collect_ts: if ts_millis == 0 {
                None
            } else {
                DateTime::from_timestamp_millis(ts_millis)
            },
            last_error: self.last_error.lock().ok().and_then(|g| g.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stats_snapshot_starts_empty() {
        let stats = CollectorStats::new();
        let snap = stats.snapshot();
        assert_eq!(snap.total_items, 0);
        assert_eq!(snap.error_count, 0);
        assert!(snap.last_collect_ts.is_none());
    }

    #[test]
    fn stats_snapshot_reflects_success_and_error() {
        let stats = CollectorStats::new();
        stats.record_success(5);
        stats.record_error("boom");
        let snap = stats.snapshot();
        assert_eq!(snap.total_items, 5);
        assert_eq!(snap.error_count, 1);
        assert_eq!(snap.last_error.as_deref(), Some("boom"));
        assert!(snap.last_collect_ts.is_some());
    }
}
