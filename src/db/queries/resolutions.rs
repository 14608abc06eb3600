use sqlx::{Pool, Postgres};

use crate::db::models::Resolution;
use crate::db::pool::DbResult;

/// Upsert: a resolution may be written once and later updated if detection
/// becomes more authoritative.
pub async fn upsert_resolution(pool: &Pool<Postgres>, r: &Resolution) -> DbResult<()> {
    sqlx::query(
        "INSERT INTO resolutions (condition_id, outcome, winner_token_id, resolved_at, payout_price, detection_method)
         VALUES ($1, $2, $3, $4, $5, $6)
         ON CONFLICT (condition_id) DO UPDATE SET
            outcome = EXCLUDED.outcome,
            winner_token_id = EXCLUDED.winner_token_id,
            resolved_at = EXCLUDED.resolved_at,
            payout_price = EXCLUDED.payout_price,
            detection_method = EXCLUDED.detection_method",
    )
    .bind(&r.condition_id)
    .bind(&r.outcome)
    .bind(&r.winner_token_id)
    .bind(r.resolved_at)
    .bind(r.payout_price)
    .bind(&r.detection_method)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn get_resolution(pool: &Pool<Postgres>, condition_id: &str) -> DbResult<Option<Resolution>> {
    let row = sqlx::query_as::<_, Resolution>("SELECT * FROM resolutions WHERE condition_id = $1")
        .bind(condition_id)
        .fetch_optional(pool)
        .await?;
    Ok(row)
}

/// Returns the subset of `condition_ids` that already have a resolution row,
/// used by the resolution tracker to avoid reprocessing already-resolved
/// markets within a page of closed markets.
pub async fn get_resolved_condition_ids(pool: &Pool<Postgres>, condition_ids: &[String]) -> DbResult<Vec<String>> {
    if condition_ids.is_empty() {
        return Ok(Vec::new());
    }
    let rows: Vec<(String,)> =
        sqlx::query_as("SELECT condition_id FROM resolutions WHERE condition_id = ANY($1)")
            .bind(condition_ids)
            .fetch_all(pool)
            .await?;
    Ok(rows.into_iter().map(|(c,)| c).collect())
}
