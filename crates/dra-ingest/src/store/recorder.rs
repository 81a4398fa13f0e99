//! Best-effort audit trail of extraction attempts

use async_trait::async_trait;
use sqlx::PgPool;
use tracing::{debug, warn};

use super::loader::quote_ident;
use crate::error::{IngestError, IngestResult};
use crate::model::RunRecord;

/// Persists one [`RunRecord`] per extraction attempt.
///
/// `log` never fails: a write error is logged at warn level and dropped,
/// so the audit trail can never fail the run it describes.
#[async_trait]
pub trait RunRecorder: Send + Sync {
    async fn log(&self, record: &RunRecord);
}

pub struct PgRunRecorder {
    pool: PgPool,
    table: String,
}

impl PgRunRecorder {
    pub fn new(pool: PgPool, schema: &str) -> Self {
        Self {
            pool,
            table: format!("{}.{}", quote_ident(schema), quote_ident("_pipeline_runs")),
        }
    }

    /// Single-row insert; errors surface as [`IngestError::AuditWrite`]
    pub async fn try_log(&self, record: &RunRecord) -> IngestResult<()> {
        let sql = format!(
            r#"
            INSERT INTO {}
                (extractor_name, status, rows_extracted, rows_loaded,
                 started_at, completed_at, error_message, provenance)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
            self.table
        );

        sqlx::query(&sql)
            .bind(&record.source_name)
            .bind(record.status.as_str())
            .bind(record.rows_extracted)
            .bind(record.rows_loaded)
            .bind(record.started_at.naive_utc())
            .bind(record.completed_at.naive_utc())
            .bind(record.error_message.as_deref())
            .bind(record.provenance.as_str())
            .execute(&self.pool)
            .await
            .map_err(IngestError::AuditWrite)?;

        Ok(())
    }
}

#[async_trait]
impl RunRecorder for PgRunRecorder {
    async fn log(&self, record: &RunRecord) {
        match self.try_log(record).await {
            Ok(()) => debug!(
                source = %record.source_name,
                status = record.status.as_str(),
                "Recorded run"
            ),
            Err(e) => warn!(
                source = %record.source_name,
                error = %e,
                "Could not log pipeline run"
            ),
        }
    }
}

/// Discards records; used for dry runs
pub struct NoopRecorder;

#[async_trait]
impl RunRecorder for NoopRecorder {
    async fn log(&self, record: &RunRecord) {
        debug!(source = %record.source_name, "Dry run, audit record not written");
    }
}
