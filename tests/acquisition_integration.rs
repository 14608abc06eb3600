//! End-to-end scenarios against a live Postgres/TimescaleDB instance.
//!
//! These exercise the literal S1-S6 scenarios and the quantified properties
//! from the spec against a real database. They are `#[ignore]`d by default
//! since CI here has no TimescaleDB instance available; run them locally
//! with:
//!
//! ```text
//! DATABASE_URL=postgres://localhost/acquisition_test cargo test --test acquisition_integration -- --ignored
//! ```

use chrono::Utc;
use sqlx::postgres::PgPoolOptions;
use sqlx::{Pool, Postgres};

use polymarket_acquisition_daemon::db::models::{Market, OrderbookLevels, OrderbookSnapshot, PriceSnapshot, Trade};
use polymarket_acquisition_daemon::db::queries::{markets, orderbooks, prices, trades};
use polymarket_acquisition_daemon::db::run_migrations;

async fn test_pool() -> Pool<Postgres> {
    let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set for integration tests");
    PgPoolOptions::new()
        .max_connections(5)
        .connect(&url)
        .await
        .expect("failed to connect to test database")
}

fn sample_market(id: &str) -> Market {
    let now = Utc::now();
    Market {
        market_id: id.to_string(),
        event_id: None,
        condition_id: format!("cond-{id}"),
        slug: Some(format!("slug-{id}")),
        question: "Will it happen?".to_string(),
        outcomes: vec!["Yes".to_string(), "No".to_string()],
        clob_token_ids: vec![format!("{id}-tA"), format!("{id}-tB")],
        neg_risk: false,
        tick_size: 0.01,
        active: true,
        closed: false,
        accepting_orders: true,
        volume_total: Some(1000.0),
        liquidity: Some(500.0),
        created_at: now,
        updated_at: now,
    }
}

#[tokio::test]
#[ignore]
async fn migrations_are_idempotent() {
    let pool = test_pool().await;

    let first = run_migrations(&pool).await.expect("first run must succeed");
    assert_eq!(first.len(), 8, "all eight migrations should apply on an empty database");

    let second = run_migrations(&pool).await.expect("second run must succeed");
    assert!(second.is_empty(), "a second run must be a no-op");
}

#[tokio::test]
#[ignore]
async fn market_upsert_round_trips_and_advances_updated_at() {
    let pool = test_pool().await;
    run_migrations(&pool).await.unwrap();

    let mut m = sample_market("s6-market");
    markets::upsert_market(&pool, &m).await.unwrap();

    let fetched = markets::get_market(&pool, &m.market_id).await.unwrap().expect("market must exist");
    assert_eq!(fetched.question, m.question);
    assert_eq!(fetched.clob_token_ids, m.clob_token_ids);
    let first_updated_at = fetched.updated_at;

    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    m.question = "Did it happen?".to_string();
    markets::upsert_market(&pool, &m).await.unwrap();

    let refetched = markets::get_market(&pool, &m.market_id).await.unwrap().unwrap();
    assert_eq!(refetched.question, "Did it happen?");
    assert!(refetched.updated_at > first_updated_at);
}

#[tokio::test]
#[ignore]
async fn empty_batch_inserts_are_no_ops() {
    let pool = test_pool().await;
    run_migrations(&pool).await.unwrap();

    assert_eq!(prices::insert_price_snapshots(&pool, &[]).await.unwrap(), 0);
    assert_eq!(trades::insert_trades(&pool, &[]).await.unwrap(), 0);
}

#[tokio::test]
#[ignore]
async fn price_snapshot_bulk_insert_row_count_matches_input() {
    let pool = test_pool().await;
    run_migrations(&pool).await.unwrap();

    let ts = Utc::now();
    let snapshots: Vec<PriceSnapshot> = (0..50)
        .map(|i| PriceSnapshot {
            ts,
            token_id: format!("tok-{i}"),
            price: 0.5,
            volume_24h: None,
            liquidity: None,
            spread: None,
            last_trade_price: None,
        })
        .collect();

    let inserted = prices::insert_price_snapshots(&pool, &snapshots).await.unwrap();
    assert_eq!(inserted as usize, snapshots.len());
}

/// S5 — duplicate trade_id collapses to one row after a second insert of the
/// same tuple.
#[tokio::test]
#[ignore]
async fn s5_duplicate_trade_id_collapses_to_one_row() {
    let pool = test_pool().await;
    run_migrations(&pool).await.unwrap();

    let trade = Trade {
        ts: Utc::now(),
        token_id: "t1".to_string(),
        side: "BUY".to_string(),
        price: 0.5,
        size: 10.0,
        trade_id: Some("x1".to_string()),
    };

    trades::insert_trades(&pool, &[trade.clone()]).await.unwrap();
    trades::insert_trades(&pool, &[trade]).await.unwrap();

    let count = trades::get_trade_count(&pool, Some("t1")).await.unwrap();
    assert_eq!(count, 1);
}

/// S6 — orderbook levels round-trip exactly through the JSONB codec.
#[tokio::test]
#[ignore]
async fn s6_orderbook_round_trip_is_exact() {
    let pool = test_pool().await;
    run_migrations(&pool).await.unwrap();

    let bids = OrderbookLevels { levels: vec![(0.49, 100.0), (0.48, 200.0)] };
    let asks = OrderbookLevels { levels: vec![(0.51, 150.0)] };
    let snapshot = OrderbookSnapshot {
        ts: Utc::now(),
        token_id: "t1".to_string(),
        side: "yes".to_string(),
        bids: sqlx::types::Json(bids.clone()),
        asks: sqlx::types::Json(asks),
        bid_depth_usd: Some(145.0),
        ask_depth_usd: Some(76.5),
    };

    orderbooks::insert_orderbook_snapshots(&pool, &[snapshot]).await.unwrap();

    let fetched = orderbooks::get_latest_orderbook(&pool, "t1", "yes").await.unwrap().expect("row must exist");
    assert_eq!(fetched.bids.0, bids);
}

#[tokio::test]
#[ignore]
async fn concurrent_price_pollers_lose_no_rows() {
    let pool = test_pool().await;
    run_migrations(&pool).await.unwrap();

    let make_batch = |offset: i64| -> Vec<PriceSnapshot> {
        (0..25)
            .map(|i| PriceSnapshot {
                ts: Utc::now() + chrono::Duration::milliseconds(offset + i),
                token_id: "concurrent-tok".to_string(),
                price: 0.33,
                volume_24h: None,
                liquidity: None,
                spread: None,
                last_trade_price: None,
            })
            .collect()
    };

    let pool_a = pool.clone();
    let pool_b = pool.clone();
    let a = tokio::spawn(async move { prices::insert_price_snapshots(&pool_a, &make_batch(0)).await.unwrap() });
    let b = tokio::spawn(async move { prices::insert_price_snapshots(&pool_b, &make_batch(1_000_000)).await.unwrap() });

    let (ra, rb) = tokio::join!(a, b);
    assert_eq!(ra.unwrap() + rb.unwrap(), 50);

    let count = prices::get_price_count(&pool).await.unwrap();
    assert!(count >= 50);
}
