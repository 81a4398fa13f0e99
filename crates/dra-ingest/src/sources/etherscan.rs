//! Transaction ledger from the Etherscan `txlist` endpoint
//!
//! Status convention: `status == "1"` carries a result page. `status == "0"`
//! with "No transactions found" (or an empty result) means no results; any
//! other `status == "0"` is a hard error whose `result` field holds the
//! reason ("Invalid API Key", "Max rate limit reached", ...).

use async_trait::async_trait;
use chrono::DateTime;
use serde::Deserialize;
use serde_json::Value as Json;
use tracing::{info, warn};

use super::{Source, SourceContext, SourceSpec};
use crate::error::{IngestError, IngestResult};
use crate::http::{FetchRequest, RetryingFetcher};
use crate::model::{Batch, Provenance, Row, Value};
use crate::pagination::{CursorProtocol, PageOutcome, Paginator};

pub const SPEC: SourceSpec = SourceSpec {
    name: "etherscan",
    target_table: "etherscan_transactions",
    conflict_key: &["tx_hash"],
    rate_limit_rps: 4.0,
    description: "Transactions sent to tracked DeFi contracts",
    factory: build,
};

/// Last block Etherscan accepts as `endblock`
const END_BLOCK: u64 = 99_999_999;

/// Placeholder Etherscan accepts for keyless, heavily throttled access
const ANONYMOUS_API_KEY: &str = "YourApiKeyToken";

pub struct TrackedContract {
    pub address: &'static str,
    pub protocol_name: &'static str,
}

pub const TRACKED_CONTRACTS: &[TrackedContract] = &[
    TrackedContract {
        address: "0xE592427A0AEce92De3Edee1F18E0157C05861564",
        protocol_name: "Uniswap V3",
    },
    TrackedContract {
        address: "0x87870Bca3F3fD6335C3F4ce8392D69350B4fA4E2",
        protocol_name: "Aave V3",
    },
];

/// Four-byte selectors of the DeFi calls we care about
const METHOD_NAMES: &[(&str, &str)] = &[
    ("0x414bf389", "exactInputSingle"),
    ("0xc04b8d59", "exactInput"),
    ("0x617ba037", "supply"),
    ("0xa415bcad", "borrow"),
    ("0x573ade81", "repay"),
    ("0x69328dec", "withdraw"),
];

pub fn method_name(method_id: &str) -> Option<&'static str> {
    METHOD_NAMES
        .iter()
        .find(|(id, _)| id.eq_ignore_ascii_case(method_id))
        .map(|(_, name)| *name)
}

/// One `txlist` entry. Etherscan encodes every field as a string.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RawTransaction {
    pub hash: String,
    pub block_number: String,
    pub time_stamp: String,
    pub from: String,
    pub to: String,
    pub contract_address: String,
    pub value: String,
    pub gas_used: String,
    pub gas_price: String,
    pub method_id: String,
    pub function_name: String,
    pub is_error: String,
}

impl RawTransaction {
    fn block(&self) -> Option<u64> {
        self.block_number.trim().parse().ok()
    }

    pub fn into_row(self, protocol_name: &str) -> Row {
        let method_id: String = self.method_id.chars().take(10).collect::<String>().to_lowercase();
        let function_name = self
            .function_name
            .split('(')
            .next()
            .map(str::trim)
            .filter(|f| !f.is_empty())
            .map(str::to_string)
            .or_else(|| method_name(&method_id).map(str::to_string))
            .unwrap_or_else(|| "unknown".to_string());

        let timestamp = self
            .time_stamp
            .trim()
            .parse::<i64>()
            .ok()
            .and_then(|secs| DateTime::from_timestamp(secs, 0));

        Row::new()
            .with("tx_hash", self.hash.to_lowercase())
            .with("block_number", self.block().map(|b| b as i64))
            .with("block_timestamp", timestamp)
            .with("from_address", self.from.to_lowercase())
            .with("to_address", Value::text_or_null(&self.to.to_lowercase()))
            .with("contract_address", Value::text_or_null(&self.contract_address.to_lowercase()))
            .with("value_wei", wei(&self.value))
            .with("gas_used", self.gas_used.trim().parse::<i64>().unwrap_or(0))
            .with("gas_price_wei", wei(&self.gas_price))
            .with("method_id", method_id)
            .with("function_name", function_name)
            .with("is_error", self.is_error.trim() == "1")
            .with("protocol_name", protocol_name)
            .with("chain", "ethereum")
    }
}

fn wei(raw: &str) -> Value {
    if raw.trim().is_empty() {
        Value::decimal_str("0")
    } else {
        Value::decimal_str(raw)
    }
}

/// `txlist` paging for one contract. The cursor is the start block.
pub struct TxListProtocol {
    pub base_url: String,
    pub api_key: String,
    pub address: String,
}

/// "Max rate limit reached", "Max calls per sec rate limit reached (5/sec)"
fn is_rate_limited(detail: &str) -> bool {
    detail.to_ascii_lowercase().contains("rate limit")
}

impl CursorProtocol for TxListProtocol {
    type Cursor = u64;
    type Item = RawTransaction;

    fn request(&self, start_block: &u64, page_size: usize) -> FetchRequest {
        FetchRequest::get(&self.base_url)
            .query("chainid", 1)
            .query("module", "account")
            .query("action", "txlist")
            .query("address", &self.address)
            .query("startblock", start_block)
            .query("endblock", END_BLOCK)
            .query("page", 1)
            .query("offset", page_size)
            .query("sort", "asc")
            .query("apikey", &self.api_key)
    }

    fn interpret(&self, body: Json) -> IngestResult<PageOutcome<RawTransaction>> {
        let status = body.get("status").and_then(Json::as_str).unwrap_or_default();
        let message = body.get("message").and_then(Json::as_str).unwrap_or_default();
        let result = body.get("result").cloned().unwrap_or(Json::Null);

        if status == "1" {
            let txs: Vec<RawTransaction> = serde_json::from_value(result).map_err(|e| {
                IngestError::permanent(&self.base_url, None, format!("malformed txlist result: {}", e))
            })?;
            return Ok(PageOutcome::Items(txs));
        }

        let result_is_empty = match &result {
            Json::Null => true,
            Json::Array(items) => items.is_empty(),
            Json::String(s) => s.is_empty(),
            _ => false,
        };
        if message.contains("No transactions found") || result_is_empty {
            return Ok(PageOutcome::NoResults);
        }

        let detail = result.as_str().map(str::to_string).unwrap_or_else(|| result.to_string());
        if is_rate_limited(&detail) {
            return Err(IngestError::transient(
                &self.base_url,
                None,
                format!("Etherscan rate limit: {}", detail),
            ));
        }
        Err(IngestError::permanent(
            &self.base_url,
            None,
            format!("Etherscan error: {} ({})", message, detail),
        ))
    }

    fn advance(&self, _start_block: &u64, page: &[RawTransaction]) -> Option<u64> {
        page.iter().filter_map(RawTransaction::block).max().map(|b| b + 1)
    }
}

pub struct EtherscanSource {
    fetcher: RetryingFetcher,
    ctx: SourceContext,
}

fn build(ctx: &SourceContext) -> IngestResult<Box<dyn Source>> {
    Ok(Box::new(EtherscanSource::new(ctx)?))
}

impl EtherscanSource {
    pub fn new(ctx: &SourceContext) -> IngestResult<Self> {
        Ok(Self {
            fetcher: ctx.fetcher(&SPEC)?,
            ctx: ctx.clone(),
        })
    }

    fn api_key(&self) -> String {
        match &self.ctx.config.sources.etherscan_api_key {
            Some(key) => key.clone(),
            None => {
                warn!(source = SPEC.name, "No API key provided, using anonymous access");
                ANONYMOUS_API_KEY.to_string()
            }
        }
    }

    /// Configured start block, or one past the landed high-water mark in
    /// incremental mode
    async fn start_block(&self) -> u64 {
        let configured = self.ctx.config.sources.etherscan_start_block;
        if !self.ctx.config.run.incremental {
            return configured;
        }

        match self
            .ctx
            .landed
            .high_water_mark(SPEC.target_table, "block_number")
            .await
        {
            Ok(Some(mark)) if mark >= 0 && (mark as u64) >= configured => {
                info!(source = SPEC.name, block = mark, "Resuming after landed high-water mark");
                mark as u64 + 1
            }
            Ok(_) => configured,
            Err(e) => {
                warn!(source = SPEC.name, error = %e, "Could not read high-water mark, starting from configured block");
                configured
            }
        }
    }
}

#[async_trait]
impl Source for EtherscanSource {
    fn spec(&self) -> &'static SourceSpec {
        &SPEC
    }

    async fn extract(&self) -> IngestResult<Batch> {
        let api_key = self.api_key();
        let start = self.start_block().await;
        let page_size = self.ctx.config.sources.etherscan_page_size as usize;

        let mut rows = Vec::new();
        for contract in TRACKED_CONTRACTS {
            let protocol = TxListProtocol {
                base_url: self.ctx.config.sources.etherscan_base_url.clone(),
                api_key: api_key.clone(),
                address: contract.address.to_string(),
            };

            let txs = Paginator::new(self.fetcher.clone(), protocol, start, page_size)
                .collect_all()
                .await?;

            info!(
                source = SPEC.name,
                protocol = contract.protocol_name,
                transactions = txs.len(),
                "Fetched contract transactions"
            );

            rows.extend(
                txs.into_iter()
                    .filter(|tx| !tx.hash.is_empty())
                    .map(|tx| tx.into_row(contract.protocol_name)),
            );
        }

        SPEC.batch(rows, Provenance::Sourced)
    }
}
