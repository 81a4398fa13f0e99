//! Network layer: per-source throttling, retry policy and the JSON fetcher

pub mod fetcher;
pub mod rate_limit;
pub mod retry;

pub use fetcher::{build_client, FetchRequest, Method, RetryingFetcher};
pub use rate_limit::RateLimiter;
pub use retry::{RetryClassifier, RetryDecision, RetryPolicy};
