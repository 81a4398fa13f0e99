//! Runs selected sources through extraction, loading and the audit trail
//!
//! Each source moves `pending → extracting → {loaded | empty | failed}`, or
//! to `extracted` in a dry run. A failing source never stops its siblings.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{IngestError, IngestResult};
use crate::model::{Batch, Provenance, RunRecord, RunStatus};
use crate::sources::Source;
use crate::store::{BatchLoader, NoopRecorder, RunRecorder};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceState {
    Pending,
    Extracting,
    /// Upsert succeeded, even if it changed nothing
    Loaded,
    /// Extraction produced zero rows; the store was not touched
    Empty,
    /// Dry run: extracted and validated, not loaded
    Extracted,
    Failed,
}

impl SourceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceState::Pending => "pending",
            SourceState::Extracting => "extracting",
            SourceState::Loaded => "loaded",
            SourceState::Empty => "empty",
            SourceState::Extracted => "extracted",
            SourceState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, SourceState::Pending | SourceState::Extracting)
    }

    /// Audit status for a terminal state. Dry runs are not audited.
    pub fn run_status(&self) -> Option<RunStatus> {
        match self {
            SourceState::Loaded => Some(RunStatus::Success),
            SourceState::Empty => Some(RunStatus::Partial),
            SourceState::Failed => Some(RunStatus::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for SourceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one source within a run
#[derive(Debug, Clone)]
pub struct SourceOutcome {
    pub source: String,
    pub target_table: String,
    pub state: SourceState,
    pub rows_extracted: usize,
    pub rows_loaded: u64,
    pub provenance: Provenance,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

impl SourceOutcome {
    fn pending(source: &dyn Source) -> Self {
        let now = Utc::now();
        Self {
            source: source.name().to_string(),
            target_table: source.spec().target_table.to_string(),
            state: SourceState::Pending,
            rows_extracted: 0,
            rows_loaded: 0,
            provenance: Provenance::default(),
            error: None,
            started_at: now,
            completed_at: now,
        }
    }

    fn transition(&mut self, next: SourceState) {
        debug!(source = %self.source, from = %self.state, to = %next, "Source state change");
        self.state = next;
        if next.is_terminal() {
            self.completed_at = Utc::now();
        }
    }

    fn fail(&mut self, err: &IngestError) {
        self.error = Some(err.to_string());
        self.transition(SourceState::Failed);
    }

    pub fn run_record(&self) -> Option<RunRecord> {
        Some(RunRecord {
            source_name: self.source.clone(),
            status: self.state.run_status()?,
            rows_extracted: self.rows_extracted as i64,
            rows_loaded: self.rows_loaded as i64,
            started_at: self.started_at,
            completed_at: self.completed_at,
            error_message: self.error.clone(),
            provenance: self.provenance,
        })
    }
}

/// Aggregated result of a run, in source order
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub outcomes: Vec<SourceOutcome>,
    pub dry_run: bool,
    pub elapsed_ms: u128,
}

impl RunSummary {
    pub fn has_failures(&self) -> bool {
        self.outcomes.iter().any(|o| o.state == SourceState::Failed)
    }

    pub fn count(&self, state: SourceState) -> usize {
        self.outcomes.iter().filter(|o| o.state == state).count()
    }

    pub fn total_rows_loaded(&self) -> u64 {
        self.outcomes.iter().map(|o| o.rows_loaded).sum()
    }

    pub fn get(&self, source: &str) -> Option<&SourceOutcome> {
        self.outcomes.iter().find(|o| o.source == source)
    }
}

pub struct Orchestrator {
    sources: Vec<Box<dyn Source>>,
    loader: Option<Arc<dyn BatchLoader>>,
    recorder: Arc<dyn RunRecorder>,
    concurrent: bool,
    cancel: CancellationToken,
}

impl Orchestrator {
    pub fn new(
        sources: Vec<Box<dyn Source>>,
        loader: Arc<dyn BatchLoader>,
        recorder: Arc<dyn RunRecorder>,
    ) -> Self {
        Self {
            sources,
            loader: Some(loader),
            recorder,
            concurrent: false,
            cancel: CancellationToken::new(),
        }
    }

    /// Extraction and validation only: no loader and no audit writes
    pub fn dry_run(sources: Vec<Box<dyn Source>>) -> Self {
        Self {
            sources,
            loader: None,
            recorder: Arc::new(NoopRecorder),
            concurrent: false,
            cancel: CancellationToken::new(),
        }
    }

    pub fn concurrent(mut self, concurrent: bool) -> Self {
        self.concurrent = concurrent;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn is_dry_run(&self) -> bool {
        self.loader.is_none()
    }

    pub async fn run(&self) -> RunSummary {
        let started = Instant::now();
        info!(
            sources = self.sources.len(),
            concurrent = self.concurrent,
            dry_run = self.is_dry_run(),
            "Starting extraction run"
        );

        let outcomes = if self.concurrent {
            join_all(self.sources.iter().map(|s| self.run_source(s.as_ref()))).await
        } else {
            let mut outcomes = Vec::with_capacity(self.sources.len());
            for source in &self.sources {
                outcomes.push(self.run_source(source.as_ref()).await);
            }
            outcomes
        };

        let summary = RunSummary {
            outcomes,
            dry_run: self.is_dry_run(),
            elapsed_ms: started.elapsed().as_millis(),
        };

        info!(
            loaded = summary.count(SourceState::Loaded),
            empty = summary.count(SourceState::Empty),
            extracted = summary.count(SourceState::Extracted),
            failed = summary.count(SourceState::Failed),
            rows_loaded = summary.total_rows_loaded(),
            elapsed_ms = summary.elapsed_ms as u64,
            "Extraction run finished"
        );
        summary
    }

    async fn run_source(&self, source: &dyn Source) -> SourceOutcome {
        let mut outcome = SourceOutcome::pending(source);
        outcome.transition(SourceState::Extracting);
        info!(source = source.name(), table = %outcome.target_table, "Extracting");

        match self.extract(source).await {
            Ok(batch) => {
                outcome.rows_extracted = batch.len();
                outcome.provenance = batch.provenance();
                if batch.is_empty() {
                    info!(source = source.name(), "No rows extracted");
                    outcome.transition(SourceState::Empty);
                } else {
                    self.load(source, &batch, &mut outcome).await;
                }
            }
            Err(e) => {
                error!(source = source.name(), error = %e, "Extraction failed");
                outcome.fail(&e);
            }
        }

        if let Some(record) = outcome.run_record() {
            self.recorder.log(&record).await;
        }
        outcome
    }

    async fn extract(&self, source: &dyn Source) -> IngestResult<Batch> {
        if self.cancel.is_cancelled() {
            return Err(IngestError::Cancelled);
        }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(IngestError::Cancelled),
            result = source.extract() => result,
        }
    }

    async fn load(&self, source: &dyn Source, batch: &Batch, outcome: &mut SourceOutcome) {
        let Some(loader) = &self.loader else {
            info!(source = source.name(), rows = batch.len(), "Dry run, skipping load");
            outcome.transition(SourceState::Extracted);
            return;
        };

        if self.cancel.is_cancelled() {
            warn!(source = source.name(), "Run cancelled before load");
            outcome.fail(&IngestError::Cancelled);
            return;
        }

        match loader.upsert(batch).await {
            Ok(loaded) => {
                info!(source = source.name(), rows = loaded, "Loaded");
                outcome.rows_loaded = loaded;
                outcome.transition(SourceState::Loaded);
            }
            Err(e) => {
                error!(source = source.name(), error = %e, "Load failed");
                outcome.fail(&e);
            }
        }
    }
}
