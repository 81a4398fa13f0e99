//! Normalized rows, batches and audit records

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::BigDecimal;
use std::collections::{HashMap, HashSet};
use std::str::FromStr;

use crate::error::{IngestError, IngestResult};

/// A single scalar cell
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Decimal(BigDecimal),
    Text(String),
    Date(NaiveDate),
    Timestamp(DateTime<Utc>),
}

impl Value {
    pub fn text(s: impl Into<String>) -> Self {
        Value::Text(s.into())
    }

    /// Empty strings become `Null`
    pub fn text_or_null(s: &str) -> Self {
        if s.is_empty() {
            Value::Null
        } else {
            Value::Text(s.to_string())
        }
    }

    /// Parse an integer-valued decimal string such as a wei amount
    pub fn decimal_str(s: &str) -> Self {
        match BigDecimal::from_str(s.trim()) {
            Ok(d) => Value::Decimal(d),
            Err(_) => Value::Null,
        }
    }

    /// Round a float to `scale` fractional digits. Non-finite input is `Null`.
    pub fn decimal_f64(x: f64, scale: usize) -> Self {
        if !x.is_finite() {
            return Value::Null;
        }
        Value::decimal_str(&format!("{:.*}", scale, x))
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<BigDecimal> for Value {
    fn from(v: BigDecimal) -> Self {
        Value::Decimal(v)
    }
}

impl From<NaiveDate> for Value {
    fn from(v: NaiveDate) -> Self {
        Value::Date(v)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(v: DateTime<Utc>) -> Self {
        Value::Timestamp(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

/// Ordered column → value mapping produced by a source
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Row {
    cells: Vec<(String, Value)>,
}

impl Row {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.cells.push((column.into(), value.into()));
        self
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.cells.iter().find(|(c, _)| c == column).map(|(_, v)| v)
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.cells.iter().map(|(c, _)| c.as_str())
    }

    pub fn values(&self) -> impl Iterator<Item = &Value> {
        self.cells.iter().map(|(_, v)| v)
    }

    fn key<'a>(&'a self, key_columns: &[String]) -> Option<Vec<&'a Value>> {
        key_columns.iter().map(|c| self.get(c)).collect()
    }
}

/// Whether rows came from a real upstream or were generated locally
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    #[default]
    Sourced,
    Synthetic,
}

impl Provenance {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provenance::Sourced => "sourced",
            Provenance::Synthetic => "synthetic",
        }
    }
}

impl std::fmt::Display for Provenance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One extraction's normalized output, ready for loading.
///
/// Invariants checked on construction: every row has the same columns in the
/// same order, the conflict key is a non-empty subset of them, and no two
/// rows share a conflict-key value.
#[derive(Debug, Clone)]
pub struct Batch {
    table: String,
    conflict_key: Vec<String>,
    columns: Vec<String>,
    rows: Vec<Row>,
    provenance: Provenance,
}

impl Batch {
    pub fn empty(table: &str, conflict_key: &[&str], provenance: Provenance) -> Self {
        Self {
            table: table.to_string(),
            conflict_key: conflict_key.iter().map(|c| c.to_string()).collect(),
            columns: Vec::new(),
            rows: Vec::new(),
            provenance,
        }
    }

    pub fn new(
        table: &str,
        conflict_key: &[&str],
        rows: Vec<Row>,
        provenance: Provenance,
    ) -> IngestResult<Self> {
        let mut batch = Self::empty(table, conflict_key, provenance);
        if batch.conflict_key.is_empty() {
            return Err(IngestError::invalid_batch(table, "conflict key is empty"));
        }

        let Some(first) = rows.first() else {
            return Ok(batch);
        };
        let columns: Vec<String> = first.columns().map(str::to_string).collect();

        for key in &batch.conflict_key {
            if !columns.contains(key) {
                return Err(IngestError::invalid_batch(
                    table,
                    format!("conflict key column '{}' missing from rows", key),
                ));
            }
        }

        let mut seen = HashSet::with_capacity(rows.len());
        for (i, row) in rows.iter().enumerate() {
            if !row.columns().eq(columns.iter().map(String::as_str)) {
                return Err(IngestError::invalid_batch(
                    table,
                    format!("row {} has a different column set", i),
                ));
            }
            let key = row.key(&batch.conflict_key).unwrap_or_default();
            if !seen.insert(key) {
                return Err(IngestError::invalid_batch(
                    table,
                    format!("row {} duplicates an earlier conflict key", i),
                ));
            }
        }

        batch.columns = columns;
        batch.rows = rows;
        Ok(batch)
    }

    /// Build a batch after dropping every row whose conflict key reappears
    /// later in `rows`, so the last occurrence wins.
    pub fn dedup_last(
        table: &str,
        conflict_key: &[&str],
        rows: Vec<Row>,
        provenance: Provenance,
    ) -> IngestResult<Self> {
        let key_columns: Vec<String> = conflict_key.iter().map(|c| c.to_string()).collect();

        let mut last_index = HashMap::with_capacity(rows.len());
        for (i, row) in rows.iter().enumerate() {
            if let Some(key) = row.key(&key_columns) {
                last_index.insert(key, i);
            }
        }
        let keep: HashSet<usize> = last_index.into_values().collect();

        let before = rows.len();
        let rows: Vec<Row> = rows
            .into_iter()
            .enumerate()
            .filter(|(i, _)| keep.contains(i))
            .map(|(_, row)| row)
            .collect();

        if rows.len() < before {
            tracing::debug!(
                table,
                dropped = before - rows.len(),
                "Dropped rows superseded by a later duplicate conflict key"
            );
        }

        Self::new(table, conflict_key, rows, provenance)
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn conflict_key(&self) -> &[String] {
        &self.conflict_key
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn provenance(&self) -> Provenance {
        self.provenance
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Columns overwritten on conflict
    pub fn update_columns(&self) -> impl Iterator<Item = &String> {
        self.columns
            .iter()
            .filter(|c| !self.conflict_key.contains(c))
    }
}

/// Audit status persisted in the run table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    Partial,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Success => "success",
            RunStatus::Partial => "partial",
            RunStatus::Failed => "failed",
        }
    }
}

/// One audit row per extraction attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub source_name: String,
    pub status: RunStatus,
    pub rows_extracted: i64,
    pub rows_loaded: i64,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub error_message: Option<String>,
    pub provenance: Provenance,
}
