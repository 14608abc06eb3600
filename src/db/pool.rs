use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use sqlx::postgres::PgPoolOptions;
use sqlx::{Pool, Postgres};
use thiserror::Error;
use tracing::{info, warn};

use crate::config::DatabaseConfig;

pub type PgConn = sqlx::pool::PoolConnection<Postgres>;

const CONNECT_MAX_ATTEMPTS: u32 = 5;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("pool is closed")]
    PoolClosed,

    #[error("sqlx error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("migration not applied: {0}")]
    MigrationMissing(String),
}

pub type DbResult<T> = Result<T, DbError>;

/// Process-wide PostgreSQL/TimescaleDB connection pool.
///
/// Carries an explicit closed flag and a bounded, jittered retry loop around
/// initial connection establishment: misconfiguration or a cold database
/// should fail fast but not on the very first blip.
#[derive(Clone)]
pub struct DbPool {
    pool: Pool<Postgres>,
    closed: Arc<AtomicBool>,
}

impl DbPool {
    pub async fn connect(cfg: &DatabaseConfig) -> DbResult<Self> {
        let mut attempt = 0u32;
        loop {
            let result = PgPoolOptions::new()
                .min_connections(cfg.min_pool_size)
                .max_connections(cfg.max_pool_size)
                .acquire_timeout(Duration::from_secs(15))
                .idle_timeout(Some(Duration::from_secs(cfg.max_inactive_lifetime_seconds)))
                .connect(&cfg.dsn)
                .await;

            match result {
                Ok(pool) => {
                    info!(target: "db", max_connections = cfg.max_pool_size, "postgres pool established");
                    return Ok(Self {
                        pool,
                        closed: Arc::new(AtomicBool::new(false)),
                    });
                }
                Err(err) if attempt < CONNECT_MAX_ATTEMPTS => {
                    attempt += 1;
                    let backoff_ms = 200u64.saturating_mul(1u64 << attempt.min(5));
                    let jitter_ms = rand::thread_rng().gen_range(0..=100u64);
                    warn!(
                        target: "db",
                        attempt,
                        error = %err,
                        "failed to connect to postgres, retrying"
                    );
                    tokio::time::sleep(Duration::from_millis(backoff_ms + jitter_ms)).await;
                }
                Err(err) => return Err(DbError::Sqlx(err)),
            }
        }
    }

    /// Scoped acquisition: the returned connection is released back to the
    /// pool on every exit path (drop, error, cancellation) because
    /// `PoolConnection` releases on `Drop`.
    pub async fn acquire(&self) -> DbResult<PgConn> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(DbError::PoolClosed);
        }
        Ok(self.pool.acquire().await?)
    }

    pub fn raw(&self) -> &Pool<Postgres> {
        &self.pool
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Idempotent. Rejects further `acquire()` calls immediately, then waits
    /// a small grace period for in-flight work before force-closing.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(target: "db", "closing postgres pool");
        let grace = Duration::from_secs(5);
        let deadline = tokio::time::Instant::now() + grace;
        while self.pool.size() > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        self.pool.close().await;
    }
}
