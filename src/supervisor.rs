use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::collectors::{Collector, CollectorStatsSnapshot};
use crate::collectors::trade_listener::{TradeListener, TradeListenerHealth};
use crate::db::pool::DbPool;

const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(60);
const HEALTH_LOG_INTERVAL: Duration = Duration::from_secs(60);
const SHUTDOWN_BUDGET: Duration = Duration::from_secs(30);

/// Lifecycle state of one supervised task. `Backoff` carries the delay
/// about to be slept and which attempt this is, so the health log can
/// report "restarting in 8s (attempt 4)" instead of a bare label.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskState {
    NotStarted,
    Running,
    Backoff { delay: Duration, attempt: u32 },
    Stopping,
    Stopped,
}

/// One periodic collector paired with its configured interval. The
/// supervisor owns the wrapper task that calls `collect_once` on a timer;
/// the collector itself never knows about scheduling.
struct PollingEntry {
    collector: Arc<dyn Collector>,
    interval: Duration,
    state: Mutex<TaskState>,
}

/// Owns every collector's lifecycle, restart-with-backoff, and the 60s
/// health-logging loop. Nothing outside this module schedules a collector.
pub struct Daemon {
    pollers: Vec<Arc<PollingEntry>>,
    trade_listener: Option<Arc<TradeListener>>,
    trade_listener_state: Mutex<TaskState>,
    db: Arc<DbPool>,
    started_at: DateTime<Utc>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    shutting_down: AtomicBool,
}

/// Waits until the shutdown signal fires. Checks the current value first so
/// a signal that fired before this call started is never missed — unlike
/// `Notify::notified()`, a `watch` receiver also wakes every clone of itself,
/// not just one waiter, which is what ordered multi-task cancellation needs.
async fn wait_for_shutdown(rx: &mut watch::Receiver<bool>) {
    if *rx.borrow() {
        return;
    }
    while rx.changed().await.is_ok() {
        if *rx.borrow() {
            return;
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CollectorHealth {
    pub name: String,
    pub total_items: u64,
    pub error_count: u64,
    pub last_collect_ts: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub started_at: DateTime<Utc>,
    pub uptime_seconds: i64,
    pub uptime_human: String,
    pub collectors: Vec<CollectorHealth>,
    pub trade_listener: Option<TradeListenerHealthView>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TradeListenerHealthView {
    pub trades_received: u64,
    pub trades_inserted: u64,
    pub batches_inserted: u64,
    pub connections_active: u64,
    pub reconnections: u64,
    pub queue_depth: u64,
    pub drops: u64,
}

impl From<TradeListenerHealth> for TradeListenerHealthView {
    fn from(h: TradeListenerHealth) -> Self {
        Self {
            trades_received: h.trades_received,
            trades_inserted: h.trades_inserted,
            batches_inserted: h.batches_inserted,
            connections_active: h.connections_active,
            reconnections: h.reconnections,
            queue_depth: h.queue_depth,
            drops: h.drops,
        }
    }
}

/// "Xh Ym" once uptime reaches an hour, otherwise "Ym Zs".
pub fn format_uptime(uptime: Duration) -> String {
    let total_secs = uptime.as_secs();
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;

    if hours >= 1 {
        format!("{hours}h {minutes}m")
    } else {
        format!("{minutes}m {seconds}s")
    }
}

impl Daemon {
    pub fn new(db: Arc<DbPool>) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            pollers: Vec::new(),
            trade_listener: None,
            trade_listener_state: Mutex::new(TaskState::NotStarted),
            db,
            started_at: Utc::now(),
            shutdown_tx,
            shutdown_rx,
            shutting_down: AtomicBool::new(false),
        }
    }

    pub fn register_collector(&mut self, collector: Arc<dyn Collector>, interval: Duration) {
        self.pollers.push(Arc::new(PollingEntry {
            collector,
            interval,
            state: Mutex::new(TaskState::NotStarted),
        }));
    }

    pub fn register_trade_listener(&mut self, listener: Arc<TradeListener>) {
        self.trade_listener = Some(listener);
    }

    /// Runs every registered task concurrently until `stop()` is called (or
    /// the process receives an external shutdown signal that the caller
    /// translates into `stop()`). Returns once the shutdown budget has
    /// either drained everything or been exceeded.
    pub async fn run(self: &Arc<Self>) {
        let mut poller_handles = Vec::new();

        for entry in &self.pollers {
            let entry = entry.clone();
            let this = self.clone();
            poller_handles.push(tokio::spawn(async move {
                this.run_polling_loop(entry).await;
            }));
        }

        let trade_listener_handle = self.trade_listener.clone().map(|listener| {
            let this = self.clone();
            tokio::spawn(async move {
                this.run_trade_listener_loop(listener).await;
            })
        });

        let health_handle = {
            let this = self.clone();
            tokio::spawn(async move {
                this.run_health_log_loop().await;
            })
        };

        wait_for_shutdown(&mut self.shutdown_rx.clone()).await;

        info!(target: "supervisor", "shutdown requested, cancelling tasks");

        let deadline = tokio::time::sleep(SHUTDOWN_BUDGET);
        tokio::pin!(deadline);

        // Cancellation order: trade listener -> polling collectors -> health
        // loop -> (pool close happens in the caller, after run() returns).
        // The trade listener is stopped and joined *before* anything is
        // aborted: aborting its task alongside the pollers would cancel
        // `TradeListener::run()` at its next await, skipping the
        // `shutdown.notified()` arm that performs the guaranteed final
        // flush.
        if let Some(listener) = &self.trade_listener {
            listener.stop();
        }
        if let Some(mut handle) = trade_listener_handle {
            tokio::select! {
                _ = &mut handle => {}
                _ = &mut deadline => {
                    handle.abort();
                    if let Some(listener) = &self.trade_listener {
                        let health = listener.get_health();
                        warn!(
                            target: "supervisor",
                            queue_depth = health.queue_depth,
                            trades_received = health.trades_received,
                            trades_inserted = health.trades_inserted,
                            "shutdown budget exceeded before trade listener's final flush completed, force-cutting with trades still unflushed"
                        );
                    }
                }
            }
        }

        for handle in &poller_handles {
            handle.abort();
        }

        let joins = futures::future::join_all(poller_handles);
        tokio::select! {
            _ = joins => {}
            _ = &mut deadline => {
                warn!(target: "supervisor", "shutdown budget exceeded, forcing exit");
            }
        }

        health_handle.abort();
        self.db.close().await;
    }

    pub fn stop(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown_tx.send(true);
    }

    /// Ticks `entry.collector.collect_once()` on its configured interval
    /// forever, until the shared shutdown signal fires. `collect_once` is
    /// contractually infallible, so the only way this task ever stops short
    /// of shutdown is a panic inside the collector itself — which surfaces
    /// to `run_polling_loop` as a `JoinError`, not a return from this
    /// function.
    async fn poll_forever(self: &Arc<Self>, entry: &Arc<PollingEntry>) {
        let mut shutdown_rx = self.shutdown_rx.clone();
        loop {
            let name = entry.collector.name();
            let produced = entry.collector.collect_once().await;
            info!(target: "supervisor", collector = name, produced, "collect_once completed");

            tokio::select! {
                _ = tokio::time::sleep(entry.interval) => {}
                _ = wait_for_shutdown(&mut shutdown_rx) => return,
            }
        }
    }

    /// Supervises one collector's polling task: spawns [`Self::poll_forever`],
    /// and if it ever dies unexpectedly (panics), restarts it with capped
    /// exponential backoff rather than letting the whole daemon go quiet on
    /// that one collector.
    async fn run_polling_loop(self: &Arc<Self>, entry: Arc<PollingEntry>) {
        let mut attempt: u32 = 0;
        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            *entry.state.lock().unwrap() = TaskState::Running;

            let this = self.clone();
            let inner_entry = entry.clone();
            let handle = tokio::spawn(async move { this.poll_forever(&inner_entry).await });

            tokio::select! {
                result = handle => {
                    if self.shutdown_requested() {
                        *entry.state.lock().unwrap() = TaskState::Stopped;
                        return;
                    }
                    if let Err(join_err) = result {
                        warn!(target: "supervisor", collector = entry.collector.name(), error = %join_err, attempt, "polling task panicked, restarting");
                    }
                }
                _ = wait_for_shutdown(&mut shutdown_rx) => {
                    *entry.state.lock().unwrap() = TaskState::Stopped;
                    return;
                }
            }

            let delay = Self::backoff_delay(attempt);
            attempt = attempt.saturating_add(1);
            *entry.state.lock().unwrap() = TaskState::Backoff { delay, attempt };

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = wait_for_shutdown(&mut shutdown_rx) => {
                    *entry.state.lock().unwrap() = TaskState::Stopped;
                    return;
                }
            }
        }
    }

    fn shutdown_requested(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Capped exponential backoff shared by polling-collector restarts and
    /// the trade-listener restart loop.
    pub fn backoff_delay(attempt: u32) -> Duration {
        let shift = attempt.min(6);
        (BACKOFF_BASE * (1u32 << shift)).min(BACKOFF_CAP)
    }

    async fn run_trade_listener_loop(self: &Arc<Self>, listener: Arc<TradeListener>) {
        let mut attempt: u32 = 0;
        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            *self.trade_listener_state.lock().unwrap() = TaskState::Running;
            listener.run().await;

            if self.shutting_down.load(Ordering::SeqCst) {
                *self.trade_listener_state.lock().unwrap() = TaskState::Stopped;
                return;
            }

            let delay = Self::backoff_delay(attempt);
            attempt = attempt.saturating_add(1);
            warn!(target: "supervisor", delay_secs = delay.as_secs(), attempt, "trade listener exited, restarting");
            *self.trade_listener_state.lock().unwrap() = TaskState::Backoff { delay, attempt };

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = wait_for_shutdown(&mut shutdown_rx) => {
                    *self.trade_listener_state.lock().unwrap() = TaskState::Stopped;
                    return;
                }
            }
        }
    }

    /// Non-critical: if this loop itself dies, nothing restarts it.
    async fn run_health_log_loop(self: &Arc<Self>) {
        let mut ticker = tokio::time::interval(HEALTH_LOG_INTERVAL);
        loop {
            ticker.tick().await;
            let snapshot = self.get_health();
            info!(
                target: "supervisor",
                uptime = %snapshot.uptime_human,
                collectors = ?snapshot.collectors,
                "health snapshot"
            );
        }
    }

    /// Deep-copied snapshot: every field is owned data, not a reference into
    /// live atomics, so a consumer can hold onto it indefinitely.
    pub fn get_health(&self) -> HealthSnapshot {
        let uptime = Utc::now()
            .signed_duration_since(self.started_at)
            .to_std()
            .unwrap_or_default();

        let collectors = self
            .pollers
            .iter()
            .map(|entry| {
                let snap: CollectorStatsSnapshot = entry.collector.stats().snapshot();
                CollectorHealth {
                    name: entry.collector.name().to_string(),
                    total_items: snap.total_items,
                    error_count: snap.error_count,
                    last_collect_ts: snap.last_collect_ts,
                    last_error: snap.last_error,
                }
            })
            .collect();

        let trade_listener = self
            .trade_listener
            .as_ref()
            .map(|l| TradeListenerHealthView::from(l.get_health()));

        HealthSnapshot {
            started_at: self.started_at,
            uptime_seconds: uptime.as_secs() as i64,
            uptime_human: format_uptime(uptime),
            collectors,
            trade_listener,
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uptime_formats_minutes_and_seconds_below_an_hour() {
        assert_eq!(format_uptime(Duration::from_secs(65)), "1m 5s");
        assert_eq!(format_uptime(Duration::from_secs(0)), "0m 0s");
    }

    #[test]
    fn uptime_formats_hours_and_minutes_at_or_above_an_hour() {
        assert_eq!(format_uptime(Duration::from_secs(3600)), "1h 0m");
        assert_eq!(format_uptime(Duration::from_secs(3725)), "1h 2m");
    }

    #[test]
    fn backoff_delay_is_monotonically_capped() {
        assert!(Daemon::backoff_delay(0) < Daemon::backoff_delay(3));
        assert_eq!(Daemon::backoff_delay(10), BACKOFF_CAP);
    }
}
