//! DRA Ingest Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Extraction and load engine for the DeFi revenue-attribution pipeline.
//! Pulls raw blockchain transactions, protocol metrics, wallet labels and
//! token prices from public APIs and lands them idempotently in PostgreSQL.
//!
//! # Layout
//!
//! - [`http`]: rate limiting, retry with backoff, the JSON fetcher
//! - [`pagination`]: cursor-driven page iteration with upstream-specific protocols
//! - [`sources`]: one [`sources::Source`] per upstream, registered in [`sources::REGISTRY`]
//! - [`store`]: staged upserts and the run audit trail
//! - [`orchestrator`]: runs sources and aggregates a [`orchestrator::RunSummary`]
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use dra_ingest::{
//!     config::PipelineConfig,
//!     http::build_client,
//!     orchestrator::Orchestrator,
//!     sources::{self, SourceContext},
//!     store::{create_pool, PgRunRecorder, PgStagedUpsertLoader},
//! };
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Arc::new(PipelineConfig::load()?);
//!     let pool = create_pool(&config.database).await?;
//!     let loader = Arc::new(PgStagedUpsertLoader::new(pool.clone(), &config.database.schema));
//!     let cancel = CancellationToken::new();
//!
//!     let ctx = SourceContext::new(config.clone(), build_client(&config.http)?, cancel, loader.clone());
//!     let selected = sources::select(&["coingecko".to_string()])?;
//!     let summary = Orchestrator::new(
//!         selected
//!             .iter()
//!             .map(|spec| spec.build(&ctx))
//!             .collect::<Result<Vec<_>, _>>()?,
//!         loader,
//!         Arc::new(PgRunRecorder::new(pool, &config.database.schema)),
//!     )
//!     .run()
//!     .await;
//!
//!     assert!(!summary.has_failures());
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod http;
pub mod model;
pub mod orchestrator;
pub mod pagination;
pub mod sources;
pub mod store;

pub use config::PipelineConfig;
pub use error::{IngestError, IngestResult};
pub use model::{Batch, Provenance, Row, RunRecord, RunStatus, Value};
pub use orchestrator::{Orchestrator, RunSummary, SourceOutcome, SourceState};
