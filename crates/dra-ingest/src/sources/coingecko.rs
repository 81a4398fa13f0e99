//! Daily token prices from CoinGecko `market_chart`
//!
//! One request per tracked token. Prices, market caps and volumes arrive as
//! three `[[<unix ms>, <value>], ...]` series joined on timestamp. A body
//! without a `prices` series means no results for that token.

use async_trait::async_trait;
use chrono::DateTime;
use serde_json::Value as Json;
use std::collections::HashMap;
use tracing::info;

use super::{Source, SourceContext, SourceSpec};
use crate::error::IngestResult;
use crate::http::{FetchRequest, RetryingFetcher};
use crate::model::{Batch, Provenance, Row, Value};

pub const SPEC: SourceSpec = SourceSpec {
    name: "coingecko",
    target_table: "token_prices",
    conflict_key: &["token_id", "date"],
    rate_limit_rps: 0.4,
    description: "Daily USD prices for tracked tokens",
    factory: build,
};

const TOKEN_SYMBOLS: &[(&str, &str)] = &[
    ("ethereum", "ETH"),
    ("wrapped-ether", "WETH"),
    ("uniswap", "UNI"),
    ("aave", "AAVE"),
    ("usd-coin", "USDC"),
    ("tether", "USDT"),
    ("dai", "DAI"),
];

pub fn token_symbol(token_id: &str) -> String {
    TOKEN_SYMBOLS
        .iter()
        .find(|(id, _)| *id == token_id)
        .map(|(_, symbol)| symbol.to_string())
        .unwrap_or_else(|| token_id.to_uppercase())
}

fn series(body: &Json, key: &str) -> Vec<(i64, f64)> {
    body.get(key)
        .and_then(Json::as_array)
        .map(|points| {
            points
                .iter()
                .filter_map(|p| match p.as_array().map(Vec::as_slice) {
                    Some([ts, value]) => Some((ts.as_f64()? as i64, value.as_f64()?)),
                    _ => None,
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Rows for one token, in upstream order. Missing market cap or volume
/// points default to zero. The token id is stored lowercased.
pub fn parse_market_chart(token_id: &str, body: &Json) -> Vec<Row> {
    let token_id = token_id.trim().to_lowercase();
    let market_caps: HashMap<i64, f64> = series(body, "market_caps").into_iter().collect();
    let volumes: HashMap<i64, f64> = series(body, "total_volumes").into_iter().collect();
    let symbol = token_symbol(&token_id);

    series(body, "prices")
        .into_iter()
        .filter_map(|(ts_ms, price)| {
            let date = DateTime::from_timestamp_millis(ts_ms)?.date_naive();
            Some(
                Row::new()
                    .with("token_id", token_id.as_str())
                    .with("token_symbol", symbol.as_str())
                    .with("date", date)
                    .with("price_usd", Value::decimal_f64(price, 8))
                    .with(
                        "market_cap_usd",
                        Value::decimal_f64(market_caps.get(&ts_ms).copied().unwrap_or(0.0), 2),
                    )
                    .with(
                        "volume_24h_usd",
                        Value::decimal_f64(volumes.get(&ts_ms).copied().unwrap_or(0.0), 2),
                    ),
            )
        })
        .collect()
}

pub struct CoinGeckoSource {
    fetcher: RetryingFetcher,
    ctx: SourceContext,
}

fn build(ctx: &SourceContext) -> IngestResult<Box<dyn Source>> {
    Ok(Box::new(CoinGeckoSource::new(ctx)?))
}

impl CoinGeckoSource {
    pub fn new(ctx: &SourceContext) -> IngestResult<Self> {
        Ok(Self {
            fetcher: ctx.fetcher(&SPEC)?,
            ctx: ctx.clone(),
        })
    }

    fn request(&self, token_id: &str) -> FetchRequest {
        let sources = &self.ctx.config.sources;
        let request = FetchRequest::get(format!(
            "{}/coins/{}/market_chart",
            sources.coingecko_base_url.trim_end_matches('/'),
            token_id
        ))
        .query("vs_currency", "usd")
        .query("days", sources.coingecko_history_days)
        .query("interval", "daily");

        match &sources.coingecko_api_key {
            Some(key) => request.header("x-cg-demo-api-key", key),
            None => request,
        }
    }
}

#[async_trait]
impl Source for CoinGeckoSource {
    fn spec(&self) -> &'static SourceSpec {
        &SPEC
    }

    async fn extract(&self) -> IngestResult<Batch> {
        let mut rows = Vec::new();
        for token_id in &self.ctx.config.sources.tracked_tokens {
            let body = self.fetcher.fetch(&self.request(token_id)).await?;
            let prices = parse_market_chart(token_id, &body);
            info!(source = SPEC.name, token = %token_id, prices = prices.len(), "Fetched daily prices");
            rows.extend(prices);
        }

        SPEC.batch(rows, Provenance::Sourced)
    }
}
