//! Staged upsert and run audit against a real PostgreSQL
//!
//! Run with `cargo test -- --ignored` on a machine with Docker.

mod common;

use chrono::{NaiveDate, Utc};
use common::{TestPostgres, SCHEMA};
use dra_ingest::sources::LandedData;
use dra_ingest::store::{BatchLoader, PgRunRecorder, PgStagedUpsertLoader, RunRecorder};
use dra_ingest::{Batch, IngestError, Provenance, Row, RunRecord, RunStatus, Value};
use sqlx::types::BigDecimal;
use std::str::FromStr;

fn price(token: &str, day: u32, usd: &str) -> Row {
    Row::new()
        .with("token_id", token)
        .with("token_symbol", token.to_uppercase())
        .with("date", NaiveDate::from_ymd_opt(2024, 1, day).unwrap())
        .with("price_usd", Value::decimal_str(usd))
        .with("market_cap_usd", Value::decimal_str("0"))
        .with("volume_24h_usd", Value::Null)
}

fn prices(rows: Vec<Row>) -> Batch {
    Batch::new("token_prices", &["token_id", "date"], rows, Provenance::Sourced).unwrap()
}

async fn price_of(pg: &TestPostgres, token: &str, day: u32) -> BigDecimal {
    sqlx::query_scalar("SELECT price_usd FROM raw.token_prices WHERE token_id = $1 AND date = $2")
        .bind(token)
        .bind(NaiveDate::from_ymd_opt(2024, 1, day).unwrap())
        .fetch_one(pg.pool())
        .await
        .unwrap()
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_conflicting_row_updates_in_place() {
    common::init_test_tracing();
    let pg = TestPostgres::start().await.unwrap();
    let loader = PgStagedUpsertLoader::new(pg.pool().clone(), SCHEMA);

    let first = prices(vec![
        price("ethereum", 1, "2200.00"),
        price("aave", 1, "95.10"),
        price("uniswap", 1, "6.25"),
    ]);
    assert_eq!(loader.upsert(&first).await.unwrap(), 3);

    let second = prices(vec![price("aave", 1, "101.50")]);
    assert_eq!(loader.upsert(&second).await.unwrap(), 1);

    assert_eq!(pg.count("token_prices").await, 3);
    assert_eq!(price_of(&pg, "aave", 1).await, BigDecimal::from_str("101.5").unwrap());
    assert_eq!(price_of(&pg, "ethereum", 1).await, BigDecimal::from_str("2200").unwrap());
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_upsert_is_idempotent() {
    let pg = TestPostgres::start().await.unwrap();
    let loader = PgStagedUpsertLoader::new(pg.pool().clone(), SCHEMA);
    let batch = prices(vec![price("ethereum", 1, "2200.00"), price("ethereum", 2, "2300.00")]);

    loader.upsert(&batch).await.unwrap();
    let once: Vec<(String, BigDecimal)> =
        sqlx::query_as("SELECT token_id || date::TEXT, price_usd FROM raw.token_prices ORDER BY 1")
            .fetch_all(pg.pool())
            .await
            .unwrap();

    loader.upsert(&batch).await.unwrap();
    let twice: Vec<(String, BigDecimal)> =
        sqlx::query_as("SELECT token_id || date::TEXT, price_usd FROM raw.token_prices ORDER BY 1")
            .fetch_all(pg.pool())
            .await
            .unwrap();

    assert_eq!(once, twice);
    assert!(pg.staging_tables().await.is_empty());
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_empty_batch_touches_nothing() {
    let pg = TestPostgres::start().await.unwrap();
    // a table that does not exist proves no statement is issued
    let loader = PgStagedUpsertLoader::new(pg.pool().clone(), SCHEMA);
    let empty = Batch::empty("no_such_table", &["id"], Provenance::Sourced);

    assert_eq!(loader.upsert(&empty).await.unwrap(), 0);
    assert!(pg.staging_tables().await.is_empty());
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_failed_staging_leaves_target_unchanged() {
    let pg = TestPostgres::start().await.unwrap();
    let loader = PgStagedUpsertLoader::new(pg.pool().clone(), SCHEMA);
    loader.upsert(&prices(vec![price("dai", 1, "1.00")])).await.unwrap();

    // price_usd is NUMERIC(30, 8); 1e40 overflows it on the staging insert
    let bad = prices(vec![price("dai", 2, "0.99"), price("tether", 1, "1e40")]);
    let err = loader.upsert(&bad).await.unwrap_err();

    assert!(matches!(err, IngestError::StoreWrite { .. }));
    assert_eq!(pg.count("token_prices").await, 1);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_rejected_merge_rolls_back_and_keeps_staging() {
    let pg = TestPostgres::start().await.unwrap();
    let loader = PgStagedUpsertLoader::new(pg.pool().clone(), SCHEMA);
    loader.upsert(&prices(vec![price("dai", 1, "1.00")])).await.unwrap();

    // staging tables copy columns but not CHECK constraints, so this only fires on merge
    sqlx::query("ALTER TABLE raw.token_prices ADD CONSTRAINT price_positive CHECK (price_usd > 0)")
        .execute(pg.pool())
        .await
        .unwrap();

    let bad = prices(vec![price("dai", 1, "2.00"), price("tether", 1, "-1")]);
    let err = loader.upsert(&bad).await.unwrap_err();

    assert!(matches!(err, IngestError::StoreWrite { .. }));
    assert_eq!(pg.count("token_prices").await, 1);
    assert_eq!(price_of(&pg, "dai", 1).await, BigDecimal::from_str("1").unwrap());

    let staging = pg.staging_tables().await;
    assert_eq!(staging.len(), 1);
    assert!(staging[0].starts_with("_stage_token_prices_"));
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_over_length_key_is_rejected_not_truncated() {
    let pg = TestPostgres::start().await.unwrap();
    let loader = PgStagedUpsertLoader::new(pg.pool().clone(), SCHEMA);
    let label = |wallet: String, name: &str| {
        Row::new().with("wallet_address", wallet).with("label", name)
    };
    // wallet_address is VARCHAR(42); both keys share the first 42 characters
    let prefix = format!("0x{}", "1".repeat(40));
    let batch = Batch::new(
        "dune_wallet_labels",
        &["wallet_address"],
        vec![
            label(format!("{}aaaa", prefix), "first"),
            label(format!("{}bbbb", prefix), "second"),
        ],
        Provenance::Sourced,
    )
    .unwrap();

    let err = loader.upsert(&batch).await.unwrap_err();
    assert!(matches!(err, IngestError::StoreWrite { .. }));
    assert!(err.to_string().contains("too long"), "{}", err);
    assert_eq!(pg.count("dune_wallet_labels").await, 0);

    let single = Batch::new(
        "dune_wallet_labels",
        &["wallet_address"],
        vec![label(format!("{}aaaa", prefix), "first")],
        Provenance::Sourced,
    )
    .unwrap();
    assert!(loader.upsert(&single).await.is_err());
    assert_eq!(pg.count("dune_wallet_labels").await, 0);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_unknown_column_is_rejected() {
    let pg = TestPostgres::start().await.unwrap();
    let loader = PgStagedUpsertLoader::new(pg.pool().clone(), SCHEMA);
    let batch = Batch::new(
        "token_prices",
        &["token_id"],
        vec![Row::new().with("token_id", "eth").with("colour", "blue")],
        Provenance::Sourced,
    )
    .unwrap();

    let err = loader.upsert(&batch).await.unwrap_err();
    assert!(matches!(err, IngestError::InvalidBatch { .. }));
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_concurrent_upserts_do_not_collide() {
    let pg = TestPostgres::start().await.unwrap();
    let loader = PgStagedUpsertLoader::new(pg.pool().clone(), SCHEMA);
    let a = prices(vec![price("ethereum", 1, "1")]);
    let b = prices(vec![price("aave", 1, "2")]);

    let (ra, rb) = tokio::join!(loader.upsert(&a), loader.upsert(&b));
    ra.unwrap();
    rb.unwrap();
    assert_eq!(pg.count("token_prices").await, 2);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_landed_data_queries() {
    let pg = TestPostgres::start().await.unwrap();
    let loader = PgStagedUpsertLoader::new(pg.pool().clone(), SCHEMA);

    assert_eq!(loader.high_water_mark("etherscan_transactions", "block_number").await.unwrap(), None);

    let tx = |hash: &str, block: i64, from: &str| {
        Row::new()
            .with("tx_hash", hash)
            .with("block_number", block)
            .with("from_address", from)
    };
    let batch = Batch::new(
        "etherscan_transactions",
        &["tx_hash"],
        vec![tx("0x1", 100, "0xaa"), tx("0x2", 250, "0xbb"), tx("0x3", 120, "0xaa")],
        Provenance::Sourced,
    )
    .unwrap();
    loader.upsert(&batch).await.unwrap();

    assert_eq!(
        LandedData::high_water_mark(&loader, "etherscan_transactions", "block_number")
            .await
            .unwrap(),
        Some(250)
    );
    let mut wallets = LandedData::known_wallets(&loader).await.unwrap();
    wallets.sort();
    assert_eq!(wallets, vec!["0xaa", "0xbb"]);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_full_refresh_replaces_contents() {
    let pg = TestPostgres::start().await.unwrap();
    let loader = PgStagedUpsertLoader::new(pg.pool().clone(), SCHEMA);

    loader
        .upsert(&prices(vec![price("ethereum", 1, "1"), price("aave", 1, "2")]))
        .await
        .unwrap();
    loader.full_refresh(&prices(vec![price("dai", 1, "1")])).await.unwrap();

    assert_eq!(pg.count("token_prices").await, 1);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_recorder_persists_runs() {
    let pg = TestPostgres::start().await.unwrap();
    let recorder = PgRunRecorder::new(pg.pool().clone(), SCHEMA);
    let now = Utc::now();

    recorder
        .log(&RunRecord {
            source_name: "lifi".to_string(),
            status: RunStatus::Success,
            rows_extracted: 100,
            rows_loaded: 100,
            started_at: now,
            completed_at: now,
            error_message: None,
            provenance: Provenance::Synthetic,
        })
        .await;

    let (name, status, provenance): (String, String, String) = sqlx::query_as(
        "SELECT extractor_name, status, provenance FROM raw._pipeline_runs ORDER BY id DESC LIMIT 1",
    )
    .fetch_one(pg.pool())
    .await
    .unwrap();

    assert_eq!(name, "lifi");
    assert_eq!(status, "success");
    assert_eq!(provenance, "synthetic");
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_recorder_failure_is_swallowed() {
    let pg = TestPostgres::start().await.unwrap();
    let recorder = PgRunRecorder::new(pg.pool().clone(), "missing_schema");
    let now = Utc::now();
    let record = RunRecord {
        source_name: "dune".to_string(),
        status: RunStatus::Failed,
        rows_extracted: 0,
        rows_loaded: 0,
        started_at: now,
        completed_at: now,
        error_message: Some("boom".to_string()),
        provenance: Provenance::Sourced,
    };

    assert!(matches!(recorder.try_log(&record).await, Err(IngestError::AuditWrite(_))));
    // returns normally
    recorder.log(&record).await;
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_run_lands_synthetic_sources_and_audits() {
    use dra_ingest::orchestrator::{Orchestrator, SourceState};
    use dra_ingest::sources::{lifi, portfolio};
    use std::sync::Arc;

    let pg = TestPostgres::start().await.unwrap();
    let loader = Arc::new(PgStagedUpsertLoader::new(pg.pool().clone(), SCHEMA));
    let recorder = Arc::new(PgRunRecorder::new(pg.pool().clone(), SCHEMA));

    // one landed sender seeds the wallet-keyed sources
    let seed = Batch::new(
        "etherscan_transactions",
        &["tx_hash"],
        vec![Row::new()
            .with("tx_hash", "0xfeed")
            .with("block_number", 1_i64)
            .with("from_address", "0xabc0000000000000000000000000000000000001")],
        Provenance::Sourced,
    )
    .unwrap();
    loader.upsert(&seed).await.unwrap();

    let ctx = common::context_with_landed(dra_ingest::PipelineConfig::default(), loader.clone());
    let summary = Orchestrator::new(
        vec![lifi::SPEC.build(&ctx).unwrap(), portfolio::SPEC.build(&ctx).unwrap()],
        loader,
        recorder,
    )
    .concurrent(true)
    .run()
    .await;

    assert!(!summary.has_failures());
    assert_eq!(summary.get("lifi").unwrap().state, SourceState::Loaded);
    assert_eq!(pg.count("cross_chain_activity").await, 1);
    assert_eq!(pg.count("wallet_enrichment").await, 1);

    let synthetic_runs: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM raw._pipeline_runs WHERE provenance = 'synthetic' AND status = 'success'",
    )
    .fetch_one(pg.pool())
    .await
    .unwrap();
    assert_eq!(synthetic_runs, 2);
}
