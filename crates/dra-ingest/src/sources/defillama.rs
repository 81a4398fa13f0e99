//! Protocol metrics from DefiLlama: TVL history and daily fees
//!
//! No API key and no pagination. A body without the expected array means no
//! results for that protocol; HTTP failures surface as errors.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate};
use serde_json::Value as Json;
use tracing::info;

use super::{Source, SourceContext, SourceSpec};
use crate::error::IngestResult;
use crate::http::{FetchRequest, RetryingFetcher};
use crate::model::{Batch, Provenance, Row, Value};

pub const TVL_SPEC: SourceSpec = SourceSpec {
    name: "defillama",
    target_table: "defillama_tvl",
    conflict_key: &["protocol_slug", "chain", "date"],
    rate_limit_rps: 2.0,
    description: "Daily TVL history per protocol",
    factory: build_tvl,
};

pub const FEES_SPEC: SourceSpec = SourceSpec {
    name: "defillama_fees",
    target_table: "defillama_fees",
    conflict_key: &["protocol_slug", "date"],
    rate_limit_rps: 2.0,
    description: "Daily protocol fees",
    factory: build_fees,
};

pub struct TrackedProtocol {
    pub slug: &'static str,
    pub name: &'static str,
    pub chain: &'static str,
}

pub const TRACKED_PROTOCOLS: &[TrackedProtocol] = &[
    TrackedProtocol {
        slug: "uniswap-v3",
        name: "Uniswap V3",
        chain: "ethereum",
    },
    TrackedProtocol {
        slug: "aave-v3",
        name: "Aave V3",
        chain: "ethereum",
    },
];

fn day_of(unix_secs: i64) -> Option<NaiveDate> {
    DateTime::from_timestamp(unix_secs, 0).map(|dt| dt.date_naive())
}

fn as_i64(v: &Json) -> Option<i64> {
    v.as_i64().or_else(|| v.as_f64().map(|f| f as i64))
}

/// `tvl` entries of `/protocol/{slug}`: `{"date": <unix secs>, "totalLiquidityUSD": <f64>}`
pub fn parse_tvl(protocol: &TrackedProtocol, body: &Json) -> Vec<Row> {
    let Some(history) = body.get("tvl").and_then(Json::as_array) else {
        return Vec::new();
    };

    history
        .iter()
        .filter_map(|entry| {
            let date = entry.get("date").and_then(as_i64).and_then(day_of)?;
            let tvl = entry
                .get("totalLiquidityUSD")
                .and_then(Json::as_f64)
                .filter(|v| *v != 0.0)
                .map(|v| Value::decimal_f64(v, 2))
                .unwrap_or(Value::Null);

            Some(
                Row::new()
                    .with("protocol_slug", protocol.slug)
                    .with("protocol_name", protocol.name)
                    .with("chain", protocol.chain)
                    .with("date", date)
                    .with("tvl_usd", tvl),
            )
        })
        .collect()
}

/// `totalDataChart` of `/summary/fees/{slug}`: `[[<unix secs>, <usd>], ...]`
pub fn parse_fees(protocol: &TrackedProtocol, body: &Json) -> Vec<Row> {
    let Some(chart) = body.get("totalDataChart").and_then(Json::as_array) else {
        return Vec::new();
    };

    chart
        .iter()
        .filter_map(|entry| match entry.as_array().map(Vec::as_slice) {
            Some([ts, value]) => {
                let date = as_i64(ts).and_then(day_of)?;
                Some(
                    Row::new()
                        .with("protocol_slug", protocol.slug)
                        .with("date", date)
                        .with("total_fees_usd", Value::decimal_f64(value.as_f64()?, 2))
                        // revenue needs the paid endpoint
                        .with("revenue_usd", Value::Null),
                )
            }
            _ => None,
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Metric {
    Tvl,
    Fees,
}

pub struct DefiLlamaSource {
    metric: Metric,
    fetcher: RetryingFetcher,
    base_url: String,
}

fn build_tvl(ctx: &SourceContext) -> IngestResult<Box<dyn Source>> {
    Ok(Box::new(DefiLlamaSource::new(ctx, Metric::Tvl)?))
}

fn build_fees(ctx: &SourceContext) -> IngestResult<Box<dyn Source>> {
    Ok(Box::new(DefiLlamaSource::new(ctx, Metric::Fees)?))
}

impl DefiLlamaSource {
    fn new(ctx: &SourceContext, metric: Metric) -> IngestResult<Self> {
        let spec = match metric {
            Metric::Tvl => &TVL_SPEC,
            Metric::Fees => &FEES_SPEC,
        };
        Ok(Self {
            metric,
            fetcher: ctx.fetcher(spec)?,
            base_url: ctx.config.sources.defillama_base_url.trim_end_matches('/').to_string(),
        })
    }

    fn request(&self, protocol: &TrackedProtocol) -> FetchRequest {
        match self.metric {
            Metric::Tvl => FetchRequest::get(format!("{}/protocol/{}", self.base_url, protocol.slug)),
            Metric::Fees => {
                FetchRequest::get(format!("{}/summary/fees/{}", self.base_url, protocol.slug))
                    .query("dataType", "dailyFees")
            }
        }
    }
}

#[async_trait]
impl Source for DefiLlamaSource {
    fn spec(&self) -> &'static SourceSpec {
        match self.metric {
            Metric::Tvl => &TVL_SPEC,
            Metric::Fees => &FEES_SPEC,
        }
    }

    async fn extract(&self) -> IngestResult<Batch> {
        let mut rows = Vec::new();
        for protocol in TRACKED_PROTOCOLS {
            let body = self.fetcher.fetch(&self.request(protocol)).await?;
            let parsed = match self.metric {
                Metric::Tvl => parse_tvl(protocol, &body),
                Metric::Fees => parse_fees(protocol, &body),
            };
            info!(
                source = self.name(),
                protocol = protocol.slug,
                records = parsed.len(),
                "Fetched daily records"
            );
            rows.extend(parsed);
        }

        self.spec().batch(rows, Provenance::Sourced)
    }
}
