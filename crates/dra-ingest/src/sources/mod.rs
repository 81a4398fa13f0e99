//! Extraction sources
//!
//! Every source is registered once in [`REGISTRY`] with its target table,
//! conflict key, default request rate and factory. The orchestrator and the
//! loader read the conflict key from the same [`SourceSpec`] the source
//! builds its batches with, so the two can never disagree.

pub mod coingecko;
pub mod defillama;
pub mod dune;
pub mod etherscan;
pub mod lifi;
pub mod portfolio;
pub mod synthetic;

use async_trait::async_trait;
use reqwest::Client;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::config::PipelineConfig;
use crate::error::{IngestError, IngestResult};
use crate::http::{RateLimiter, RetryPolicy, RetryingFetcher};
use crate::model::{Batch, Provenance, Row};

pub type SourceFactory = fn(&SourceContext) -> IngestResult<Box<dyn Source>>;

/// Static description of one registered source
pub struct SourceSpec {
    pub name: &'static str,
    pub target_table: &'static str,
    pub conflict_key: &'static [&'static str],
    pub rate_limit_rps: f64,
    pub description: &'static str,
    pub factory: SourceFactory,
}

impl SourceSpec {
    pub fn build(&self, ctx: &SourceContext) -> IngestResult<Box<dyn Source>> {
        (self.factory)(ctx)
    }

    /// Deduplicate `rows` on this source's conflict key (last occurrence
    /// wins) and wrap them in a batch for the target table
    pub fn batch(&self, rows: Vec<Row>, provenance: Provenance) -> IngestResult<Batch> {
        Batch::dedup_last(self.target_table, self.conflict_key, rows, provenance)
    }

    pub fn empty_batch(&self, provenance: Provenance) -> Batch {
        Batch::empty(self.target_table, self.conflict_key, provenance)
    }
}

impl std::fmt::Debug for SourceSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceSpec")
            .field("name", &self.name)
            .field("target_table", &self.target_table)
            .field("conflict_key", &self.conflict_key)
            .field("rate_limit_rps", &self.rate_limit_rps)
            .finish()
    }
}

/// Registered sources in default run order. Etherscan comes first so the
/// wallet-keyed sources can seed from freshly landed senders.
pub static REGISTRY: &[SourceSpec] = &[
    etherscan::SPEC,
    defillama::TVL_SPEC,
    defillama::FEES_SPEC,
    dune::SPEC,
    coingecko::SPEC,
    lifi::SPEC,
    portfolio::SPEC,
];

pub fn lookup(name: &str) -> IngestResult<&'static SourceSpec> {
    REGISTRY
        .iter()
        .find(|spec| spec.name == name)
        .ok_or_else(|| IngestError::UnknownSource(name.to_string()))
}

/// Resolve CLI selections to specs in registry order. An empty selection or
/// `all` selects every source.
pub fn select(names: &[String]) -> IngestResult<Vec<&'static SourceSpec>> {
    if names.is_empty() || names.iter().any(|n| n.eq_ignore_ascii_case("all")) {
        return Ok(REGISTRY.iter().collect());
    }

    for name in names {
        lookup(name)?;
    }
    Ok(REGISTRY
        .iter()
        .filter(|spec| names.iter().any(|n| n == spec.name))
        .collect())
}

/// Normalizes one upstream API into a [`Batch`].
///
/// `extract` returns an empty batch, never an error, when the upstream has
/// no usable rows. Errors are reserved for fetch failures and hard API
/// errors.
#[async_trait]
pub trait Source: Send + Sync {
    fn spec(&self) -> &'static SourceSpec;

    async fn extract(&self) -> IngestResult<Batch>;

    fn name(&self) -> &'static str {
        self.spec().name
    }
}

/// Read access to already-landed data. Sources treat every call as best
/// effort.
#[async_trait]
pub trait LandedData: Send + Sync {
    async fn known_wallets(&self) -> IngestResult<Vec<String>>;

    async fn high_water_mark(&self, table: &str, column: &str) -> IngestResult<Option<i64>>;
}

/// Used when no store is reachable, e.g. a dry run without a database
pub struct NoLandedData;

#[async_trait]
impl LandedData for NoLandedData {
    async fn known_wallets(&self) -> IngestResult<Vec<String>> {
        Err(IngestError::config("no landed store available"))
    }

    async fn high_water_mark(&self, _table: &str, _column: &str) -> IngestResult<Option<i64>> {
        Ok(None)
    }
}

/// Everything a source factory needs
#[derive(Clone)]
pub struct SourceContext {
    pub config: Arc<PipelineConfig>,
    pub client: Client,
    pub cancel: CancellationToken,
    pub landed: Arc<dyn LandedData>,
}

impl SourceContext {
    pub fn new(
        config: Arc<PipelineConfig>,
        client: Client,
        cancel: CancellationToken,
        landed: Arc<dyn LandedData>,
    ) -> Self {
        Self {
            config,
            client,
            cancel,
            landed,
        }
    }

    /// A fetcher with its own rate limiter at the source's registered rate
    pub fn fetcher(&self, spec: &SourceSpec) -> IngestResult<RetryingFetcher> {
        Ok(RetryingFetcher::new(
            spec.name,
            self.client.clone(),
            Arc::new(RateLimiter::new(spec.rate_limit_rps)?),
            RetryPolicy::from_config(&self.config.retry),
            self.cancel.clone(),
        ))
    }
}
