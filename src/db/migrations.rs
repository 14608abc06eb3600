use std::collections::BTreeMap;

use sqlx::{Pool, Postgres};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("sqlx error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("migration file name {0:?} does not start with a numeric prefix")]
    BadFileName(String),

    #[error("migration versions are not dense: have {applied:?}, missing {missing}")]
    NotDense { applied: Vec<i32>, missing: i32 },
}

pub type MigrationResult<T> = Result<T, MigrationError>;

/// One migration file discovered on disk, parsed from its numeric prefix.
#[derive(Debug, Clone)]
struct MigrationFile {
    version: i32,
    filename: String,
    sql: String,
    /// True for files containing statements that cannot run inside an
    /// explicit transaction block (extension creation, continuous
    /// aggregates) — these run directly on the pool in autocommit mode
    /// instead of inside `begin()`/`commit()`.
    autocommit: bool,
}

/// Embeds the repo's `migrations/*.sql` at compile time so the binary never
/// depends on a runtime filesystem layout matching the source tree.
fn embedded_migrations() -> Vec<MigrationFile> {
    macro_rules! m {
        ($path:literal) => {
            (
                $path,
                include_str!(concat!("../../migrations/", $path)),
            )
        };
    }

    // (filename, sql, autocommit) — autocommit files run outside an explicit
    // transaction: `CREATE EXTENSION` and `CREATE MATERIALIZED VIEW ...
    // WITH (timescaledb.continuous)` both error inside a `BEGIN`/`COMMIT`
    // block under TimescaleDB, `WITH NO DATA` or not.
    let raw = [
        (m!("001_timescaledb_extension.sql"), true),
        (m!("002_markets.sql"), false),
        (m!("003_price_snapshots.sql"), false),
        (m!("004_orderbook_snapshots.sql"), false),
        (m!("005_trades.sql"), false),
        (m!("006_resolutions.sql"), false),
        (m!("007_continuous_aggregates.sql"), true),
        (m!("008_compression_retention_policies.sql"), false),
    ];

    raw.into_iter()
        .map(|((filename, sql), autocommit)| {
            let version = parse_version(filename).expect("embedded migration file name is well-formed");
            MigrationFile {
                version,
                filename: filename.to_string(),
                sql: sql.to_string(),
                autocommit,
            }
        })
        .collect()
}

fn parse_version(filename: &str) -> MigrationResult<i32> {
    let stem = filename.strip_suffix(".sql").unwrap_or(filename);
    let prefix = stem
        .split('_')
        .next()
        .ok_or_else(|| MigrationError::BadFileName(filename.to_string()))?;
    prefix
        .parse::<i32>()
        .map_err(|_| MigrationError::BadFileName(filename.to_string()))
}

async fn ensure_tracking_table(pool: &Pool<Postgres>) -> MigrationResult<()> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INT PRIMARY KEY,
            filename TEXT NOT NULL,
            applied_at TIMESTAMPTZ NOT NULL DEFAULT now()
        )",
    )
    .execute(pool)
    .await?;
    Ok(())
}

async fn applied_versions(pool: &Pool<Postgres>) -> MigrationResult<BTreeMap<i32, String>> {
    let rows: Vec<(i32, String)> =
        sqlx::query_as("SELECT version, filename FROM schema_migrations")
            .fetch_all(pool)
            .await?;
    Ok(rows.into_iter().collect())
}

/// Applies every unapplied migration in ascending version order. Most files
/// run their DDL in their own transaction with the tracking insert issued
/// afterwards on a separate statement; files marked `autocommit` run
/// directly on the pool instead, since their statements (extension
/// creation, continuous aggregates) implicitly commit and cannot live
/// inside a `BEGIN`/`COMMIT` block.
///
/// Idempotent: a second call with nothing new to apply returns an empty
/// list and makes no writes.
pub async fn run_migrations(pool: &Pool<Postgres>) -> MigrationResult<Vec<String>> {
    ensure_tracking_table(pool).await?;

    let applied = applied_versions(pool).await?;
    let files = embedded_migrations();

    let mut expected_next = 1;
    for f in &files {
        if f.version != expected_next {
            warn!(target: "db", version = f.version, expected = expected_next, "migration file version gap");
        }
        expected_next = f.version + 1;
    }

    let mut newly_applied = Vec::new();

    for file in files.into_iter().filter(|f| !applied.contains_key(&f.version)) {
        if file.version > 1 {
            for v in 1..file.version {
                if !applied.contains_key(&v) && !newly_applied_versions(&newly_applied).contains(&v) {
                    return Err(MigrationError::NotDense {
                        applied: applied.keys().copied().collect(),
                        missing: v,
                    });
                }
            }
        }

        info!(target: "db", version = file.version, filename = %file.filename, "applying migration");

        if file.autocommit {
            // Runs directly on the pool in autocommit mode: extension
            // creation and continuous-aggregate creation both implicitly
            // commit and cannot appear inside an explicit transaction block.
            sqlx::raw_sql(&file.sql).execute(pool).await?;
        } else {
            let mut tx = pool.begin().await?;
            sqlx::raw_sql(&file.sql).execute(&mut *tx).await?;
            tx.commit().await?;
        }

        sqlx::query("INSERT INTO schema_migrations (version, filename) VALUES ($1, $2)")
            .bind(file.version)
            .bind(&file.filename)
            .execute(pool)
            .await?;

        newly_applied.push(file.filename);
    }

    Ok(newly_applied)
}

fn newly_applied_versions(filenames: &[String]) -> Vec<i32> {
    filenames
        .iter()
        .filter_map(|f| parse_version(f).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_zero_padded_version_prefix() {
        assert_eq!(parse_version("001_timescaledb_extension.sql").unwrap(), 1);
        assert_eq!(parse_version("008_compression_retention_policies.sql").unwrap(), 8);
    }

    #[test]
    fn rejects_missing_prefix() {
        assert!(parse_version("no_prefix_here.sql").is_err());
    }

    #[test]
    fn embedded_migrations_are_dense_from_one() {
        let files = embedded_migrations();
        let versions: Vec<i32> = files.iter().map(|f| f.version).collect();
        assert_eq!(versions, (1..=8).collect::<Vec<i32>>());
    }
}
