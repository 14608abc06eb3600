use sqlx::{Pool, Postgres, QueryBuilder};

use crate::db::models::OrderbookSnapshot;
use crate::db::pool::DbResult;

const BATCH_SIZE: usize = 200;

/// Parameterised batch insert with an explicit `::jsonb` cast on the bound
/// parameter.
/// Empty input is a fast no-op.
pub async fn insert_orderbook_snapshots(pool: &Pool<Postgres>, snapshots: &[OrderbookSnapshot]) -> DbResult<u64> {
    if snapshots.is_empty() {
        return Ok(0);
    }

    let mut total = 0u64;
    for chunk in snapshots.chunks(BATCH_SIZE) {
        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
            "INSERT INTO orderbook_snapshots (ts, token_id, side, bids, asks, bid_depth_usd, ask_depth_usd) ",
        );

        qb.push_values(chunk, |mut b, s| {
            b.push_bind(s.ts)
                .push_bind(&s.token_id)
                .push_bind(&s.side)
                .push_bind(serde_json::to_value(&s.bids.0).unwrap_or(serde_json::Value::Null))
                .push("::jsonb")
                .push_bind(serde_json::to_value(&s.asks.0).unwrap_or(serde_json::Value::Null))
                .push("::jsonb")
                .push_bind(s.bid_depth_usd)
                .push_bind(s.ask_depth_usd);
        });

        let query = qb.build();
        query.execute(pool).await?;
        total += chunk.len() as u64;
    }

    Ok(total)
}

/// Reads decode JSONB straight into `OrderbookLevels` via `sqlx::types::Json`;
/// without it the driver would hand back raw strings instead of structured
/// levels.
pub async fn get_latest_orderbook(
    pool: &Pool<Postgres>,
    token_id: &str,
    side: &str,
) -> DbResult<Option<OrderbookSnapshot>> {
    let row = sqlx::query_as::<_, OrderbookSnapshot>(
        "SELECT * FROM orderbook_snapshots WHERE token_id = $1 AND side = $2 ORDER BY ts DESC LIMIT 1",
    )
    .bind(token_id)
    .bind(side)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

pub async fn get_orderbook_history(
    pool: &Pool<Postgres>,
    token_id: &str,
    side: &str,
    limit: i64,
) -> DbResult<Vec<OrderbookSnapshot>> {
    let rows = sqlx::query_as::<_, OrderbookSnapshot>(
        "SELECT * FROM orderbook_snapshots WHERE token_id = $1 AND side = $2 ORDER BY ts DESC LIMIT $3",
    )
    .bind(token_id)
    .bind(side)
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}
