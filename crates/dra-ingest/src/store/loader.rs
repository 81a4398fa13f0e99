//! Stage-then-merge batch loading into PostgreSQL
//!
//! Each upsert creates its own uniquely named staging table, bulk-inserts the
//! batch into it, then merges into the target and drops the staging table in
//! a single transaction. A failed merge rolls back and leaves the staging
//! table in place for inspection.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::query_builder::Separated;
use sqlx::{PgPool, Postgres, QueryBuilder, Row as _};
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::is_identifier;
use crate::error::{IngestError, IngestResult};
use crate::model::{Batch, Row, Value};

/// Postgres caps a single statement at 65535 bind parameters
const MAX_BIND_PARAMS: usize = 65_535;

/// Longest table-name prefix kept in a staging table name
const STAGE_TABLE_PREFIX_CHARS: usize = 24;

#[async_trait]
pub trait BatchLoader: Send + Sync {
    /// Land `batch` in its target table, returning the number of rows
    /// processed (the batch length, zero for an empty batch).
    async fn upsert(&self, batch: &Batch) -> IngestResult<u64>;
}

pub struct PgStagedUpsertLoader {
    pool: PgPool,
    schema: String,
    cancel: CancellationToken,
}

impl PgStagedUpsertLoader {
    pub fn new(pool: PgPool, schema: impl Into<String>) -> Self {
        Self {
            pool,
            schema: schema.into(),
            cancel: CancellationToken::new(),
        }
    }

    /// Abort in-flight writes when `cancel` fires
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn schema(&self) -> &str {
        &self.schema
    }

    /// Replace the entire contents of the target table with `batch`
    pub async fn full_refresh(&self, batch: &Batch) -> IngestResult<u64> {
        if batch.is_empty() {
            warn!(table = batch.table(), "Empty batch, skipping full refresh");
            return Ok(0);
        }
        self.cancellable(self.full_refresh_inner(batch)).await
    }

    /// Largest value of an integer column in a landed table
    pub async fn high_water_mark(&self, table: &str, column: &str) -> IngestResult<Option<i64>> {
        let target = self.qualified(table)?;
        if !is_identifier(column) {
            return Err(IngestError::invalid_batch(table, format!("bad column name '{}'", column)));
        }

        let sql = format!("SELECT MAX({})::BIGINT FROM {}", quote_ident(column), target);
        let mark: Option<i64> = sqlx::query_scalar(&sql).fetch_one(&self.pool).await?;
        Ok(mark)
    }

    /// Distinct senders seen in landed transactions, used to seed
    /// wallet-keyed enrichment sources
    pub async fn known_wallets(&self) -> IngestResult<Vec<String>> {
        let sql = format!(
            "SELECT DISTINCT from_address FROM {} \
             WHERE from_address IS NOT NULL AND from_address <> '' \
             ORDER BY from_address",
            self.qualified("etherscan_transactions")?
        );
        let wallets: Vec<String> = sqlx::query_scalar(&sql).fetch_all(&self.pool).await?;
        Ok(wallets)
    }

    async fn cancellable<T>(
        &self,
        work: impl std::future::Future<Output = IngestResult<T>>,
    ) -> IngestResult<T> {
        // Dropping `work` drops any open transaction, which rolls it back
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(IngestError::Cancelled),
            result = work => result,
        }
    }

    async fn upsert_inner(&self, batch: &Batch) -> IngestResult<u64> {
        let table = batch.table();
        let target = self.qualified(table)?;
        let types = self.column_types(batch).await?;

        let stage_name = staging_table_name(table);
        let stage = format!("{}.{}", quote_ident(&self.schema), quote_ident(&stage_name));

        sqlx::query(&format!(
            "CREATE UNLOGGED TABLE {} (LIKE {} INCLUDING DEFAULTS)",
            stage, target
        ))
        .execute(&self.pool)
        .await
        .map_err(|e| IngestError::store_write(table, e))?;

        debug!(table, stage = %stage_name, rows = batch.len(), "Created staging table");

        {
            let mut conn = self
                .pool
                .acquire()
                .await
                .map_err(|e| IngestError::store_write(table, e))?;
            for chunk in batch.rows().chunks(rows_per_statement(batch.columns().len())) {
                insert_rows(&stage, batch.columns(), &types, chunk)
                    .build()
                    .execute(&mut *conn)
                    .await
                    .map_err(|e| IngestError::store_write(table, e))?;
            }
        }

        let merge = render_merge(&target, &stage, batch);
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| IngestError::store_write(table, e))?;

        let merged = sqlx::query(&merge)
            .execute(&mut *tx)
            .await
            .map_err(|e| IngestError::store_write(table, e))?;

        sqlx::query(&format!("DROP TABLE {}", stage))
            .execute(&mut *tx)
            .await
            .map_err(|e| IngestError::store_write(table, e))?;

        tx.commit()
            .await
            .map_err(|e| IngestError::store_write(table, e))?;

        info!(
            table,
            rows = batch.len(),
            affected = merged.rows_affected(),
            "Upserted batch"
        );

        Ok(batch.len() as u64)
    }

    async fn full_refresh_inner(&self, batch: &Batch) -> IngestResult<u64> {
        let table = batch.table();
        let target = self.qualified(table)?;
        let types = self.column_types(batch).await?;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| IngestError::store_write(table, e))?;

        sqlx::query(&format!("TRUNCATE TABLE {}", target))
            .execute(&mut *tx)
            .await
            .map_err(|e| IngestError::store_write(table, e))?;

        for chunk in batch.rows().chunks(rows_per_statement(batch.columns().len())) {
            insert_rows(&target, batch.columns(), &types, chunk)
                .build()
                .execute(&mut *tx)
                .await
                .map_err(|e| IngestError::store_write(table, e))?;
        }

        tx.commit()
            .await
            .map_err(|e| IngestError::store_write(table, e))?;

        info!(table, rows = batch.len(), "Full-refreshed table");
        Ok(batch.len() as u64)
    }

    /// SQL types of the batch's columns in the target table, without type
    /// modifiers. An explicit cast to `varchar(42)` truncates silently, so
    /// length and precision limits are left to the column assignment.
    async fn column_types(&self, batch: &Batch) -> IngestResult<HashMap<String, String>> {
        let table = batch.table();
        let rows = sqlx::query(
            r#"
            SELECT a.attname::TEXT AS name, format_type(a.atttypid, NULL) AS sql_type
            FROM pg_attribute a
            JOIN pg_class c ON c.oid = a.attrelid
            JOIN pg_namespace n ON n.oid = c.relnamespace
            WHERE n.nspname = $1 AND c.relname = $2 AND a.attnum > 0 AND NOT a.attisdropped
            "#,
        )
        .bind(&self.schema)
        .bind(table)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| IngestError::store_write(table, e))?;

        if rows.is_empty() {
            return Err(IngestError::invalid_batch(
                table,
                format!("target table {}.{} does not exist", self.schema, table),
            ));
        }

        let mut types = HashMap::with_capacity(rows.len());
        for row in rows {
            let name: String = row.try_get("name").map_err(|e| IngestError::store_write(table, e))?;
            let sql_type: String = row
                .try_get("sql_type")
                .map_err(|e| IngestError::store_write(table, e))?;
            types.insert(name, sql_type);
        }

        let missing: Vec<&str> = batch
            .columns()
            .iter()
            .filter(|c| !types.contains_key(c.as_str()))
            .map(String::as_str)
            .collect();
        if !missing.is_empty() {
            return Err(IngestError::invalid_batch(
                table,
                format!("columns not in target table: {}", missing.join(", ")),
            ));
        }

        Ok(types)
    }

    fn qualified(&self, table: &str) -> IngestResult<String> {
        if !is_identifier(&self.schema) || !is_identifier(table) {
            return Err(IngestError::invalid_batch(
                table,
                format!("'{}.{}' is not a plain identifier", self.schema, table),
            ));
        }
        Ok(format!("{}.{}", quote_ident(&self.schema), quote_ident(table)))
    }
}

#[async_trait]
impl BatchLoader for PgStagedUpsertLoader {
    async fn upsert(&self, batch: &Batch) -> IngestResult<u64> {
        if batch.is_empty() {
            return Ok(0);
        }
        self.cancellable(self.upsert_inner(batch)).await
    }
}

/// `_stage_<table>_<micros>_<random>`, unique per call and within the
/// 63-byte identifier limit
pub fn staging_table_name(table: &str) -> String {
    let prefix: String = table.chars().take(STAGE_TABLE_PREFIX_CHARS).collect();
    let suffix = Uuid::new_v4().simple().to_string();
    format!(
        "_stage_{}_{}_{}",
        prefix,
        Utc::now().timestamp_micros(),
        &suffix[..8]
    )
}

pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// `INSERT ... SELECT ... ON CONFLICT` from the staging table into the
/// target. Non-key columns are overwritten; with no non-key columns the
/// conflict is ignored.
pub fn render_merge(target: &str, stage: &str, batch: &Batch) -> String {
    let columns = batch
        .columns()
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ");
    let key = batch
        .conflict_key()
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ");
    let updates = batch
        .update_columns()
        .map(|c| format!("{0} = EXCLUDED.{0}", quote_ident(c)))
        .collect::<Vec<_>>();

    let action = if updates.is_empty() {
        "DO NOTHING".to_string()
    } else {
        format!("DO UPDATE SET {}", updates.join(", "))
    };

    format!(
        "INSERT INTO {target} ({columns}) SELECT {columns} FROM {stage} ON CONFLICT ({key}) {action}"
    )
}

fn rows_per_statement(column_count: usize) -> usize {
    (MAX_BIND_PARAMS / column_count.max(1)).max(1)
}

fn insert_rows<'a>(
    table: &str,
    columns: &[String],
    types: &HashMap<String, String>,
    rows: &'a [Row],
) -> QueryBuilder<'a, Postgres> {
    let column_list = columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ");
    let mut builder: QueryBuilder<Postgres> =
        QueryBuilder::new(format!("INSERT INTO {} ({}) ", table, column_list));

    builder.push_values(rows, |mut b, row| {
        for (column, value) in columns.iter().zip(row.values()) {
            let sql_type = types.get(column).map(String::as_str).unwrap_or("text");
            push_cast(&mut b, value, sql_type);
        }
    });

    builder
}

/// Bind one cell as `CAST($n AS <target type>)` so text, integer and decimal
/// values land in whatever column type the target declares.
fn push_cast<'a>(b: &mut Separated<'_, 'a, Postgres, &'static str>, value: &'a Value, sql_type: &str) {
    b.push("CAST(");
    match value {
        Value::Null => b.push_bind_unseparated(None::<String>),
        Value::Bool(v) => b.push_bind_unseparated(*v),
        Value::Int(v) => b.push_bind_unseparated(*v),
        Value::Decimal(v) => b.push_bind_unseparated(v),
        Value::Text(v) => b.push_bind_unseparated(v.as_str()),
        Value::Date(v) => b.push_bind_unseparated(*v),
        Value::Timestamp(v) => b.push_bind_unseparated(v.naive_utc()),
    };
    b.push_unseparated(format!(" AS {})", sql_type));
}
