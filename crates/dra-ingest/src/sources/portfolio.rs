//! Trading profitability per wallet (synthetic)

use async_trait::async_trait;
use tracing::{info, warn};

use super::synthetic::{seed_wallets, sequential_addresses, WalletDraw};
use super::{Source, SourceContext, SourceSpec};
use crate::error::IngestResult;
use crate::model::{Batch, Provenance, Row, Value};

pub const SPEC: SourceSpec = SourceSpec {
    name: "portfolio",
    target_table: "wallet_enrichment",
    conflict_key: &["wallet_address"],
    rate_limit_rps: 1.0,
    description: "Wallet win rate and realized profit (synthetic)",
    factory: build,
};

const FALLBACK_WALLET_COUNT: usize = 100;

/// Deterministic profitability tier for `wallet`: 5% smart money, 25%
/// break-even, the rest losing.
pub fn synthetic_enrichment_row(wallet: &str) -> Row {
    let wallet = wallet.to_lowercase();
    let mut draw = WalletDraw::new(SPEC.name, &wallet);

    let tier = draw.unit();
    let (win_rate, profit) = if tier < 0.05 {
        (draw.range_f64(0.60, 0.85), draw.range_f64(10_000.0, 500_000.0))
    } else if tier < 0.30 {
        (draw.range_f64(0.40, 0.59), draw.range_f64(-5_000.0, 10_000.0))
    } else {
        (draw.range_f64(0.10, 0.39), draw.range_f64(-50_000.0, -100.0))
    };

    Row::new()
        .with("wallet_address", wallet)
        .with("historical_win_rate", Value::decimal_f64(win_rate, 4))
        .with("realized_profit_usd", Value::decimal_f64(profit, 2))
        .with("data_provenance", Provenance::Synthetic.as_str())
}

pub struct PortfolioSource {
    ctx: SourceContext,
}

fn build(ctx: &SourceContext) -> IngestResult<Box<dyn Source>> {
    Ok(Box::new(PortfolioSource { ctx: ctx.clone() }))
}

#[async_trait]
impl Source for PortfolioSource {
    fn spec(&self) -> &'static SourceSpec {
        &SPEC
    }

    async fn extract(&self) -> IngestResult<Batch> {
        if !self.ctx.config.run.allow_synthetic {
            warn!(source = SPEC.name, "Synthetic data disabled, nothing to extract");
            return Ok(SPEC.empty_batch(Provenance::Synthetic));
        }

        let wallets = seed_wallets(SPEC.name, self.ctx.landed.as_ref(), || {
            sequential_addresses(FALLBACK_WALLET_COUNT)
        })
        .await;
        let rows = wallets.iter().map(|w| synthetic_enrichment_row(w)).collect();
        info!(source = SPEC.name, wallets = wallets.len(), "Generated synthetic wallet enrichment");
        SPEC.batch(rows, Provenance::Synthetic)
    }
}
