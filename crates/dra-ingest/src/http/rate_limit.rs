//! Minimum-interval request throttle

use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep_until, Instant};

use crate::error::{IngestError, IngestResult};

/// Enforces a minimum spacing between requests to one source.
///
/// `acquire` never rejects, it only waits. The last-call timestamp is held
/// behind an async mutex for the whole wait, so concurrent callers queue up
/// and are released one interval apart.
#[derive(Debug)]
pub struct RateLimiter {
    min_interval: Duration,
    last_acquired: Mutex<Option<Instant>>,
}

impl RateLimiter {
    /// `rate_per_sec` must be positive and finite, and its interval must
    /// fit in a [`Duration`].
    pub fn new(rate_per_sec: f64) -> IngestResult<Self> {
        if !(rate_per_sec.is_finite() && rate_per_sec > 0.0) {
            return Err(IngestError::config(format!(
                "Request rate must be a positive number, got {}",
                rate_per_sec
            )));
        }
        let min_interval = Duration::try_from_secs_f64(1.0 / rate_per_sec).map_err(|e| {
            IngestError::config(format!("Request rate {} is out of range: {}", rate_per_sec, e))
        })?;
        Ok(Self::with_interval(min_interval))
    }

    pub fn with_interval(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_acquired: Mutex::new(None),
        }
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    pub async fn acquire(&self) {
        let mut last = self.last_acquired.lock().await;
        if let Some(previous) = *last {
            let ready_at = previous + self.min_interval;
            if ready_at > Instant::now() {
                sleep_until(ready_at).await;
            }
        }
        *last = Some(Instant::now());
    }
}
