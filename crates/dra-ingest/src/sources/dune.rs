//! Wallet labels from saved Dune queries
//!
//! With an API key each query is executed (`POST /query/{id}/execute`) and
//! its results polled (`GET /execution/{id}/results`) until the execution
//! reaches `QUERY_STATE_COMPLETED`. Failed or cancelled executions and poll
//! timeouts are hard errors. Without a key, and only if synthetic data is
//! allowed, labels are generated for the known wallet set and marked
//! synthetic.

use async_trait::async_trait;
use chrono::{Days, NaiveDate};
use serde_json::Value as Json;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::synthetic::{hashed_addresses, seed_wallets, WalletDraw};
use super::{Source, SourceContext, SourceSpec};
use crate::error::{IngestError, IngestResult};
use crate::http::{FetchRequest, RetryingFetcher};
use crate::model::{Batch, Provenance, Row};

pub const SPEC: SourceSpec = SourceSpec {
    name: "dune",
    target_table: "dune_wallet_labels",
    conflict_key: &["wallet_address"],
    rate_limit_rps: 0.5,
    description: "Wallet classification labels",
    factory: build,
};

/// Saved community queries: Uniswap user labels, Aave user segments
pub const QUERIES: &[(&str, u64)] = &[("uniswap_user_labels", 2_486_554), ("aave_user_segments", 2_595_727)];

const API_KEY_HEADER: &str = "X-Dune-API-Key";

const FALLBACK_WALLET_COUNT: usize = 500;

const SYNTHETIC_LABELS: &[&str] = &[
    "airdrop_hunter",
    "governance_voter",
    "liquidity_provider",
    "whale",
    "retail_trader",
    "defi_power_user",
];

const SYNTHETIC_PROJECTS: &[&str] = &["uniswap", "aave"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionState {
    Completed(Vec<Json>),
    Pending(String),
    Failed(String),
}

/// Read the state of an execution-results response
pub fn execution_state(body: &Json) -> ExecutionState {
    let state = body.get("state").and_then(Json::as_str).unwrap_or_default();
    match state {
        "QUERY_STATE_COMPLETED" => ExecutionState::Completed(
            body.pointer("/result/rows")
                .and_then(Json::as_array)
                .cloned()
                .unwrap_or_default(),
        ),
        "QUERY_STATE_FAILED" | "QUERY_STATE_CANCELLED" | "QUERY_STATE_EXPIRED" => {
            ExecutionState::Failed(state.to_string())
        }
        other => ExecutionState::Pending(other.to_string()),
    }
}

/// Map one result row to the label table shape. Column names are matched
/// case-insensitively; rows without a wallet address are dropped.
pub fn label_row(raw: &Json) -> Option<Row> {
    let obj = raw.as_object()?;
    let field = |name: &str| {
        obj.iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v)
    };
    let text = |name: &str| field(name).and_then(Json::as_str).map(str::to_string);

    let wallet = text("wallet_address")?.trim().to_lowercase();
    if wallet.is_empty() {
        return None;
    }

    let first_activity = text("first_activity_date").and_then(|s| {
        s.get(..10)
            .and_then(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok())
    });
    let total_txs = field("total_txs").and_then(|v| v.as_i64().or_else(|| v.as_f64().map(|f| f as i64)));

    Some(
        Row::new()
            .with("wallet_address", wallet)
            .with("label", text("label"))
            .with("label_type", text("label_type"))
            .with("project", text("project"))
            .with("first_activity_date", first_activity)
            .with("total_txs", total_txs)
            .with("data_provenance", Provenance::Sourced.as_str()),
    )
}

/// Deterministic behavioral label for `wallet`
pub fn synthetic_label_row(wallet: &str) -> Row {
    let wallet = wallet.to_lowercase();
    let mut draw = WalletDraw::new(SPEC.name, &wallet);
    let offset = Days::new(draw.range_i64(0, 365) as u64);
    let first_activity =
        NaiveDate::from_ymd_opt(2023, 1, 1).and_then(|base| base.checked_add_days(offset));

    Row::new()
        .with("wallet_address", wallet)
        .with("label", *draw.pick(SYNTHETIC_LABELS))
        .with("label_type", "behavioral")
        .with("project", *draw.pick(SYNTHETIC_PROJECTS))
        .with("first_activity_date", first_activity)
        .with("total_txs", draw.range_i64(1, 5000))
        .with("data_provenance", Provenance::Synthetic.as_str())
}

pub struct DuneSource {
    fetcher: RetryingFetcher,
    ctx: SourceContext,
}

fn build(ctx: &SourceContext) -> IngestResult<Box<dyn Source>> {
    Ok(Box::new(DuneSource::new(ctx)?))
}

impl DuneSource {
    pub fn new(ctx: &SourceContext) -> IngestResult<Self> {
        Ok(Self {
            fetcher: ctx.fetcher(&SPEC)?,
            ctx: ctx.clone(),
        })
    }

    fn base_url(&self) -> &str {
        self.ctx.config.sources.dune_base_url.trim_end_matches('/')
    }

    async fn execute(&self, api_key: &str, query_id: u64) -> IngestResult<String> {
        let url = format!("{}/query/{}/execute", self.base_url(), query_id);
        let body = self
            .fetcher
            .fetch(&FetchRequest::post(&url).header(API_KEY_HEADER, api_key))
            .await?;

        body.get("execution_id")
            .and_then(Json::as_str)
            .map(str::to_string)
            .ok_or_else(|| IngestError::permanent(&url, None, "response has no execution_id"))
    }

    async fn poll(&self, api_key: &str, execution_id: &str) -> IngestResult<Vec<Json>> {
        let url = format!("{}/execution/{}/results", self.base_url(), execution_id);
        let request = FetchRequest::get(&url).header(API_KEY_HEADER, api_key);
        let interval = Duration::from_secs(self.ctx.config.sources.dune_poll_interval_secs);
        let deadline = Instant::now() + Duration::from_secs(self.ctx.config.sources.dune_max_wait_secs);

        loop {
            let body = self.fetcher.fetch(&request).await?;
            match execution_state(&body) {
                ExecutionState::Completed(rows) => return Ok(rows),
                ExecutionState::Failed(state) => {
                    return Err(IngestError::permanent(
                        &url,
                        None,
                        format!("execution {} ended in {}", execution_id, state),
                    ))
                }
                ExecutionState::Pending(state) => {
                    debug!(source = SPEC.name, execution_id, state = %state, "Execution pending");
                }
            }

            if Instant::now() + interval > deadline {
                return Err(IngestError::permanent(
                    &url,
                    None,
                    format!(
                        "execution {} did not complete within {}s",
                        execution_id, self.ctx.config.sources.dune_max_wait_secs
                    ),
                ));
            }

            tokio::select! {
                _ = self.ctx.cancel.cancelled() => return Err(IngestError::Cancelled),
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }

    async fn extract_sourced(&self, api_key: &str) -> IngestResult<Batch> {
        let mut rows = Vec::new();
        for (name, query_id) in QUERIES {
            info!(source = SPEC.name, query = *name, query_id, "Executing saved query");
            let execution_id = self.execute(api_key, *query_id).await?;
            let results = self.poll(api_key, &execution_id).await?;
            let labels: Vec<Row> = results.iter().filter_map(label_row).collect();
            info!(source = SPEC.name, query = *name, labels = labels.len(), "Fetched wallet labels");
            rows.extend(labels);
        }
        SPEC.batch(rows, Provenance::Sourced)
    }

    async fn extract_synthetic(&self) -> IngestResult<Batch> {
        let wallets = seed_wallets(SPEC.name, self.ctx.landed.as_ref(), || {
            hashed_addresses(FALLBACK_WALLET_COUNT)
        })
        .await;
        let rows = wallets.iter().map(|w| synthetic_label_row(w)).collect();
        info!(source = SPEC.name, wallets = wallets.len(), "Generated synthetic wallet labels");
        SPEC.batch(rows, Provenance::Synthetic)
    }
}

#[async_trait]
impl Source for DuneSource {
    fn spec(&self) -> &'static SourceSpec {
        &SPEC
    }

    async fn extract(&self) -> IngestResult<Batch> {
        match &self.ctx.config.sources.dune_api_key {
            Some(key) => self.extract_sourced(key).await,
            None if self.ctx.config.run.allow_synthetic => {
                warn!(source = SPEC.name, "No API key, generating synthetic labels");
                self.extract_synthetic().await
            }
            None => {
                warn!(source = SPEC.name, "No API key and synthetic data disabled, nothing to extract");
                Ok(SPEC.empty_batch(Provenance::Sourced))
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::model::Value;
    use serde_json::json;

    #[test]
    fn test_execution_states() {
        let done = json!({"state": "QUERY_STATE_COMPLETED", "result": {"rows": [{"a": 1}]}});
        assert_eq!(execution_state(&done), ExecutionState::Completed(vec![json!({"a": 1})]));

        let failed = json!({"state": "QUERY_STATE_FAILED"});
        assert!(matches!(execution_state(&failed), ExecutionState::Failed(_)));

        let running = json!({"state": "QUERY_STATE_EXECUTING"});
        assert!(matches!(execution_state(&running), ExecutionState::Pending(_)));
    }

    #[test]
    fn test_label_row_normalizes() {
        let row = label_row(&json!({
            "WALLET_ADDRESS": "0xAbC0000000000000000000000000000000000001",
            "Label": "whale",
            "label_type": "behavioral",
            "project": "aave",
            "first_activity_date": "2023-04-05 00:00:00.000 UTC",
            "total_txs": 42
        }))
        .unwrap();

        assert_eq!(
            row.get("wallet_address"),
            Some(&Value::text("0xabc0000000000000000000000000000000000001"))
        );
        assert_eq!(row.get("label"), Some(&Value::text("whale")));
        assert_eq!(
            row.get("first_activity_date"),
            Some(&Value::Date(NaiveDate::from_ymd_opt(2023, 4, 5).unwrap()))
        );
        assert_eq!(row.get("total_txs"), Some(&Value::Int(42)));
        assert_eq!(row.get("data_provenance"), Some(&Value::text("sourced")));
    }

    #[test]
    fn test_label_row_requires_wallet() {
        assert!(label_row(&json!({"label": "whale"})).is_none());
        assert!(label_row(&json!({"wallet_address": ""})).is_none());
        assert!(label_row(&json!([1, 2])).is_none());
    }

    #[test]
    fn test_synthetic_labels_are_deterministic_and_marked() {
        let a = synthetic_label_row("0xABC");
        let b = synthetic_label_row("0xabc");
        assert_eq!(a, b);
        assert_eq!(a.get("data_provenance"), Some(&Value::text("synthetic")));

        match a.get("total_txs") {
            Some(Value::Int(n)) => assert!((1..=5000).contains(n)),
            other => panic!("unexpected total_txs {:?}", other),
        }
        match a.get("first_activity_date") {
            Some(Value::Date(d)) => {
                assert!(*d >= NaiveDate::from_ymd_opt(2023, 1, 1).unwrap());
                assert!(*d <= NaiveDate::from_ymd_opt(2024, 1, 1).unwrap());
            }
            other => panic!("unexpected date {:?}", other),
        }
    }
}
