use std::fmt::Write as _;

use sqlx::{Pool, Postgres, QueryBuilder};

use crate::db::models::Trade;
use crate::db::pool::DbResult;

const BATCH_SIZE: usize = 500;

fn copy_text_escape(s: &str) -> String {
    s.replace('\\', "\\\\")
        .replace('\t', "\\t")
        .replace('\n', "\\n")
        .replace('\r', "\\r")
}

fn opt_text(v: &Option<String>) -> String {
    match v {
        Some(s) => copy_text_escape(s),
        None => "\\N".to_string(),
    }
}

/// Attempts COPY first (the hot path for the websocket drain loop); on a
/// unique-violation against `(trade_id, ts)` falls back to a parameterised
/// batch `INSERT ... ON CONFLICT DO NOTHING` so duplicate trade ids collapse
/// to a no-op instead of failing the whole batch.
/// Empty input is a fast no-op.
pub async fn insert_trades(pool: &Pool<Postgres>, trades: &[Trade]) -> DbResult<u64> {
    if trades.is_empty() {
        return Ok(0);
    }

    match copy_insert(pool, trades).await {
        Ok(n) => Ok(n),
        Err(crate::db::pool::DbError::Sqlx(e)) if is_unique_violation(&e) => {
            fallback_insert(pool, trades).await
        }
        Err(e) => Err(e),
    }
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.code().as_deref() == Some("23505"))
}

async fn copy_insert(pool: &Pool<Postgres>, trades: &[Trade]) -> DbResult<u64> {
    let mut buf = String::new();
    for t in trades {
        let _ = writeln!(
            buf,
            "{}\t{}\t{}\t{}\t{}\t{}",
            t.ts.to_rfc3339(),
            copy_text_escape(&t.token_id),
            t.side,
            t.price,
            t.size,
            opt_text(&t.trade_id),
        );
    }

    let mut conn = pool.acquire().await?;
    let mut copy = conn
        .copy_in_raw("COPY trades (ts, token_id, side, price, size, trade_id) FROM STDIN WITH (FORMAT text)")
        .await?;
    copy.send(buf.as_bytes()).await?;
    copy.finish().await?;
    Ok(trades.len() as u64)
}

async fn fallback_insert(pool: &Pool<Postgres>, trades: &[Trade]) -> DbResult<u64> {
    let mut total = 0u64;
    for chunk in trades.chunks(BATCH_SIZE) {
        let mut qb: QueryBuilder<Postgres> =
            QueryBuilder::new("INSERT INTO trades (ts, token_id, side, price, size, trade_id) ");

        qb.push_values(chunk, |mut b, t| {
            b.push_bind(t.ts)
                .push_bind(&t.token_id)
                .push_bind(&t.side)
                .push_bind(t.price)
                .push_bind(t.size)
                .push_bind(&t.trade_id);
        });

        qb.push(" ON CONFLICT (trade_id, ts) WHERE trade_id IS NOT NULL DO NOTHING");

        let result = qb.build().execute(pool).await?;
        total += result.rows_affected();
    }
    Ok(total)
}

pub async fn get_recent_trades(pool: &Pool<Postgres>, token_id: Option<&str>, limit: i64) -> DbResult<Vec<Trade>> {
    let rows = match token_id {
        Some(token_id) => {
            sqlx::query_as::<_, Trade>(
                "SELECT * FROM trades WHERE token_id = $1 ORDER BY ts DESC LIMIT $2",
            )
            .bind(token_id)
            .bind(limit)
            .fetch_all(pool)
            .await?
        }
        None => {
            sqlx::query_as::<_, Trade>("SELECT * FROM trades ORDER BY ts DESC LIMIT $1")
                .bind(limit)
                .fetch_all(pool)
                .await?
        }
    };
    Ok(rows)
}

pub async fn get_trade_count(pool: &Pool<Postgres>, token_id: Option<&str>) -> DbResult<i64> {
    let (count,): (i64,) = match token_id {
        Some(token_id) => {
            sqlx::query_as("SELECT count(*) FROM trades WHERE token_id = $1")
                .bind(token_id)
                .fetch_one(pool)
                .await?
        }
        None => sqlx::query_as("SELECT count(*) FROM trades").fetch_one(pool).await?,
    };
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copy_text_escape_roundtrips_plain_ids() {
        assert_eq!(copy_text_escape("0xabc123"), "0xabc123");
    }
}
