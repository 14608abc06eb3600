use sqlx::{Pool, Postgres};

use crate::db::models::Market;
use crate::db::pool::{DbError, DbResult};

/// `INSERT ... ON CONFLICT (market_id) DO UPDATE SET <mutable cols>, updated_at = now()`.
/// `created_at` is left untouched on conflict.
pub async fn upsert_market(pool: &Pool<Postgres>, m: &Market) -> DbResult<()> {
    sqlx::query(
        "INSERT INTO markets (
            market_id, event_id, condition_id, slug, question, outcomes, clob_token_ids,
            neg_risk, tick_size, active, closed, accepting_orders, volume_total, liquidity,
            created_at, updated_at
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, now(), now())
        ON CONFLICT (market_id) DO UPDATE SET
            event_id = EXCLUDED.event_id,
            condition_id = EXCLUDED.condition_id,
            slug = EXCLUDED.slug,
            question = EXCLUDED.question,
            outcomes = EXCLUDED.outcomes,
            clob_token_ids = EXCLUDED.clob_token_ids,
            neg_risk = EXCLUDED.neg_risk,
            tick_size = EXCLUDED.tick_size,
            active = EXCLUDED.active,
            closed = markets.closed OR EXCLUDED.closed,
            accepting_orders = EXCLUDED.accepting_orders,
            volume_total = EXCLUDED.volume_total,
            liquidity = EXCLUDED.liquidity,
            updated_at = now()",
    )
    .bind(&m.market_id)
    .bind(&m.event_id)
    .bind(&m.condition_id)
    .bind(&m.slug)
    .bind(&m.question)
    .bind(&m.outcomes)
    .bind(&m.clob_token_ids)
    .bind(m.neg_risk)
    .bind(m.tick_size)
    .bind(m.active)
    .bind(m.closed)
    .bind(m.accepting_orders)
    .bind(m.volume_total)
    .bind(m.liquidity)
    .execute(pool)
    .await
    .map_err(DbError::from)?;

    Ok(())
}

/// Batch upsert. Loops single upserts: this runs at the 5-minute market
/// metadata cadence, not a hot path.
pub async fn upsert_markets(pool: &Pool<Postgres>, markets: &[Market]) -> DbResult<usize> {
    for m in markets {
        upsert_market(pool, m).await?;
    }
    Ok(markets.len())
}

pub async fn get_market(pool: &Pool<Postgres>, market_id: &str) -> DbResult<Option<Market>> {
    let row = sqlx::query_as::<_, Market>("SELECT * FROM markets WHERE market_id = $1")
        .bind(market_id)
        .fetch_optional(pool)
        .await?;
    Ok(row)
}

/// `active AND NOT closed AND accepting_orders`.
pub async fn get_active_markets(pool: &Pool<Postgres>) -> DbResult<Vec<Market>> {
    let rows = sqlx::query_as::<_, Market>(
        "SELECT * FROM markets WHERE active AND NOT closed AND accepting_orders",
    )
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

pub async fn get_markets_by_ids(pool: &Pool<Postgres>, ids: &[String]) -> DbResult<Vec<Market>> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    let rows = sqlx::query_as::<_, Market>("SELECT * FROM markets WHERE market_id = ANY($1)")
        .bind(ids)
        .fetch_all(pool)
        .await?;
    Ok(rows)
}

/// Markets closed but without a row in `resolutions` yet, used by the
/// resolution tracker to know which `condition_id`s still need inference.
pub async fn get_unresolved_closed_markets(pool: &Pool<Postgres>) -> DbResult<Vec<String>> {
    let rows: Vec<(String,)> = sqlx::query_as(
        "SELECT m.condition_id
         FROM markets m
         LEFT JOIN resolutions r ON r.condition_id = m.condition_id
         WHERE m.closed AND r.condition_id IS NULL",
    )
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(|(c,)| c).collect())
}

/// Sets `closed = true` for a market by `condition_id`. Monotonic: never
/// clears the bit back to false.
pub async fn mark_condition_closed(pool: &Pool<Postgres>, condition_id: &str) -> DbResult<()> {
    sqlx::query("UPDATE markets SET closed = true, updated_at = now() WHERE condition_id = $1 AND NOT closed")
        .bind(condition_id)
        .execute(pool)
        .await?;
    Ok(())
}
