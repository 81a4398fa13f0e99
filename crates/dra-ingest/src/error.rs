//! Error taxonomy for extraction and loading
//!
//! Retry decisions are made on these variants alone: only
//! [`IngestError::TransientNetwork`] is ever retried.

use thiserror::Error;

/// Result type alias for ingestion operations
pub type IngestResult<T> = std::result::Result<T, IngestError>;

#[derive(Error, Debug)]
pub enum IngestError {
    /// Connection failure, timeout, HTTP 5xx or 429
    #[error("Transient network error for {url}{}: {reason}", fmt_status(*.status))]
    TransientNetwork {
        url: String,
        status: Option<u16>,
        reason: String,
    },

    /// HTTP 4xx other than 429, malformed payload, or an upstream hard error
    #[error("Request to {url} failed permanently{}: {reason}", fmt_status(*.status))]
    PermanentRequest {
        url: String,
        status: Option<u16>,
        reason: String,
    },

    /// Staging or merge into a target table failed; the target is unchanged
    #[error("Store write to '{table}' failed: {source}")]
    StoreWrite {
        table: String,
        #[source]
        source: sqlx::Error,
    },

    /// Audit insert failed. Logged, never propagated past the recorder.
    #[error("Audit write failed: {0}")]
    AuditWrite(#[source] sqlx::Error),

    /// Read from the landed store failed
    #[error("Store read failed: {0}")]
    StoreRead(#[from] sqlx::Error),

    #[error("Invalid batch for '{table}': {reason}")]
    InvalidBatch { table: String, reason: String },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Configuration error: {0}. Check your environment variables or .env file.")]
    Config(String),

    #[error("Unknown source '{0}'. Run with --list-sources to see registered sources.")]
    UnknownSource(String),
}

fn fmt_status(status: Option<u16>) -> String {
    status.map(|s| format!(" (HTTP {})", s)).unwrap_or_default()
}

impl IngestError {
    pub fn transient(url: impl Into<String>, status: Option<u16>, reason: impl ToString) -> Self {
        Self::TransientNetwork {
            url: url.into(),
            status,
            reason: reason.to_string(),
        }
    }

    pub fn permanent(url: impl Into<String>, status: Option<u16>, reason: impl ToString) -> Self {
        Self::PermanentRequest {
            url: url.into(),
            status,
            reason: reason.to_string(),
        }
    }

    pub fn store_write(table: impl Into<String>, source: sqlx::Error) -> Self {
        Self::StoreWrite {
            table: table.into(),
            source,
        }
    }

    pub fn invalid_batch(table: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidBatch {
            table: table.into(),
            reason: reason.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, IngestError::TransientNetwork { .. })
    }
}
