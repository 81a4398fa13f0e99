//! Deterministic stand-in data for sources without a usable upstream
//!
//! Values are drawn from SHA-256 of a salt, the wallet address and a draw
//! counter, so re-running over the same wallets produces the same rows.

use sha2::{Digest, Sha256};
use tracing::{info, warn};

use super::LandedData;

/// Fallback key space: `0x` + first 40 hex chars of `sha256(i)`
pub fn hashed_addresses(count: usize) -> Vec<String> {
    (0..count)
        .map(|i| {
            let digest = hex::encode(Sha256::digest(i.to_string().as_bytes()));
            format!("0x{}", &digest[..40])
        })
        .collect()
}

/// Fallback key space: `0x000...001` through `count`
pub fn sequential_addresses(count: usize) -> Vec<String> {
    (1..=count).map(|i| format!("0x{:040x}", i)).collect()
}

/// Wallets to enrich: landed etherscan senders, or `fallback()` when they
/// cannot be read
pub async fn seed_wallets(
    source: &str,
    landed: &dyn LandedData,
    fallback: impl FnOnce() -> Vec<String>,
) -> Vec<String> {
    match landed.known_wallets().await {
        Ok(wallets) => {
            info!(source, wallets = wallets.len(), "Seeded wallets from landed transactions");
            wallets.into_iter().map(|w| w.to_lowercase()).collect()
        }
        Err(e) => {
            let wallets = fallback();
            warn!(
                source,
                error = %e,
                fallback = wallets.len(),
                "Could not read landed wallets, using deterministic fallback addresses"
            );
            wallets
        }
    }
}

/// Per-wallet stream of deterministic pseudo-random draws
pub struct WalletDraw {
    seed: String,
    counter: u64,
}

impl WalletDraw {
    pub fn new(salt: &str, wallet: &str) -> Self {
        Self {
            seed: format!("{}:{}", salt, wallet),
            counter: 0,
        }
    }

    /// Uniform in `[0, 1)`
    pub fn unit(&mut self) -> f64 {
        let mut hasher = Sha256::new();
        hasher.update(self.seed.as_bytes());
        hasher.update(self.counter.to_be_bytes());
        self.counter += 1;

        let digest = hasher.finalize();
        let mut word = [0u8; 8];
        word.copy_from_slice(&digest[..8]);
        // top 53 bits fill an f64 mantissa exactly
        (u64::from_be_bytes(word) >> 11) as f64 / (1u64 << 53) as f64
    }

    /// Uniform in `[low, high)`
    pub fn range_f64(&mut self, low: f64, high: f64) -> f64 {
        low + (high - low) * self.unit()
    }

    /// Uniform in `[low, high]`
    pub fn range_i64(&mut self, low: i64, high: i64) -> i64 {
        let span = (high - low + 1) as f64;
        (low + (self.unit() * span) as i64).min(high)
    }

    pub fn pick<'a, T>(&mut self, items: &'a [T]) -> &'a T {
        let idx = (self.unit() * items.len() as f64) as usize;
        &items[idx.min(items.len() - 1)]
    }
}
