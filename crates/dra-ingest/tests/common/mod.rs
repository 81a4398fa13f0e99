//! Shared helpers for dra-ingest integration tests
//!
//! - PostgreSQL container with the landing schema migrated
//! - Pipeline configuration pointed at a mock HTTP server
//! - Test tracing setup

#![allow(dead_code)]

use anyhow::{Context, Result};
use dra_ingest::config::PipelineConfig;
use dra_ingest::http::build_client;
use dra_ingest::sources::{LandedData, NoLandedData, SourceContext};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use testcontainers::{runners::AsyncRunner, ContainerAsync, ImageExt};
use testcontainers_modules::postgres::Postgres;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub const SCHEMA: &str = "raw";

/// PostgreSQL container with migrations applied. The container stops when
/// this is dropped.
pub struct TestPostgres {
    _container: ContainerAsync<Postgres>,
    pool: PgPool,
}

impl TestPostgres {
    pub async fn start() -> Result<Self> {
        info!("Starting PostgreSQL test container...");

        let container = Postgres::default()
            .with_tag("16-alpine")
            .start()
            .await
            .context("Failed to start PostgreSQL container")?;

        let host = container.get_host().await.context("Failed to get container host")?;
        let port = container
            .get_host_port_ipv4(5432)
            .await
            .context("Failed to get container port")?;

        let connection_string = format!("postgresql://postgres:postgres@{}:{}/postgres", host, port);
        debug!("PostgreSQL connection: {}", connection_string);

        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(30))
            .connect(&connection_string)
            .await
            .context("Failed to connect to PostgreSQL")?;

        sqlx::migrate!("../../migrations")
            .run(&pool)
            .await
            .context("Failed to run migrations")?;

        Ok(Self {
            _container: container,
            pool,
        })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn count(&self, table: &str) -> i64 {
        sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}.{}", SCHEMA, table))
            .fetch_one(&self.pool)
            .await
            .expect("count query failed")
    }

    /// Tables in the landing schema whose names start with `_stage_`
    pub async fn staging_tables(&self) -> Vec<String> {
        sqlx::query_scalar(
            "SELECT tablename::TEXT FROM pg_tables WHERE schemaname = $1 AND tablename LIKE '\\_stage\\_%'",
        )
        .bind(SCHEMA)
        .fetch_all(&self.pool)
        .await
        .expect("staging table query failed")
    }
}

/// Defaults with every upstream pointed at `base_url`, fast retries and
/// no database
pub fn mock_config(base_url: &str) -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.sources.etherscan_base_url = format!("{}/v2/api", base_url);
    config.sources.defillama_base_url = base_url.to_string();
    config.sources.dune_base_url = format!("{}/api/v1", base_url);
    config.sources.coingecko_base_url = format!("{}/api/v3", base_url);
    config.sources.etherscan_api_key = Some("test-key".to_string());
    config.retry.base_delay_ms = 10;
    config.retry.max_delay_ms = 40;
    config
}

pub fn context(config: PipelineConfig) -> SourceContext {
    context_with_landed(config, Arc::new(NoLandedData))
}

pub fn context_with_landed(config: PipelineConfig, landed: Arc<dyn LandedData>) -> SourceContext {
    let client = build_client(&config.http).expect("client");
    SourceContext::new(Arc::new(config), client, CancellationToken::new(), landed)
}

/// Initialize test tracing (call once per test binary if needed)
pub fn init_test_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let _ = fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("info,dra_ingest=debug,sqlx=warn,testcontainers=info")
        }))
        .with_test_writer()
        .try_init();
}
