//! PostgreSQL landing store: pool setup, batch loading and the run audit

pub mod loader;
pub mod recorder;

pub use loader::{BatchLoader, PgStagedUpsertLoader};
pub use recorder::{NoopRecorder, PgRunRecorder, RunRecorder};

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;

use crate::config::DatabaseConfig;
use crate::error::IngestResult;
use crate::sources::LandedData;

pub async fn create_pool(config: &DatabaseConfig) -> IngestResult<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
        .idle_timeout(Duration::from_secs(config.idle_timeout_secs))
        .connect(&config.url)
        .await?;

    tracing::info!(
        max_connections = config.max_connections,
        min_connections = config.min_connections,
        schema = %config.schema,
        "Database connection pool created"
    );

    Ok(pool)
}

pub async fn health_check(pool: &PgPool) -> IngestResult<()> {
    sqlx::query("SELECT 1").execute(pool).await?;
    Ok(())
}

#[async_trait]
impl LandedData for PgStagedUpsertLoader {
    async fn known_wallets(&self) -> IngestResult<Vec<String>> {
        PgStagedUpsertLoader::known_wallets(self).await
    }

    async fn high_water_mark(&self, table: &str, column: &str) -> IngestResult<Option<i64>> {
        PgStagedUpsertLoader::high_water_mark(self, table, column).await
    }
}
