use crate::config::{PipelineConfig, ProviderSettings};
use crate::providers::Provider;
use std::sync::{Mutex, MutexGuard};
use tokio::time::{Duration, Instant, sleep};
use tracing::trace;

/// Process-wide outbound limiter: one token bucket per provider.
///
/// Buckets are fixed at construction, so callers for different providers never
/// contend on the same lock. Waiting callers sleep outside the lock and retry.
pub struct RateLimiter {
    keepa: Bucket,
    spapi: Bucket,
}

struct Bucket {
    rate_per_sec: f64,
    capacity: f64,
    state: Mutex<BucketState>,
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl RateLimiter {
    pub fn new(keepa: &ProviderSettings, spapi: &ProviderSettings) -> Self {
        Self {
            keepa: Bucket::new(keepa.rate_per_sec, keepa.burst),
            spapi: Bucket::new(spapi.rate_per_sec, spapi.burst),
        }
    }

    pub fn from_config(config: &PipelineConfig) -> Self {
        Self::new(&config.keepa, &config.spapi)
    }

    /// Waits until a token for `provider` is available and spends it.
    pub async fn acquire(&self, provider: Provider) {
        let bucket = self.bucket(provider);
        loop {
            match bucket.take() {
                Ok(()) => return,
                Err(wait) => {
                    trace!(
                        target = "sourcing.ratelimit",
                        provider = provider.as_str(),
                        wait_ms = wait.as_millis() as u64,
                        "rate_limit_wait"
                    );
                    sleep(wait).await;
                }
            }
        }
    }

    /// Spends a token if one is available right now.
    pub fn try_acquire(&self, provider: Provider) -> bool {
        self.bucket(provider).take().is_ok()
    }

    fn bucket(&self, provider: Provider) -> &Bucket {
        match provider {
            Provider::Keepa => &self.keepa,
            Provider::SpApi => &self.spapi,
        }
    }
}

impl Bucket {
    fn new(rate_per_sec: f64, capacity: f64) -> Self {
        let rate_per_sec = if rate_per_sec > 0.0 { rate_per_sec } else { 1.0 };
        let capacity = capacity.max(1.0);
        Self {
            rate_per_sec,
            capacity,
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BucketState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Takes one token, or returns how long until one accrues.
    fn take(&self) -> Result<(), Duration> {
        let mut state = self.lock();
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            state.tokens = (state.tokens + elapsed * self.rate_per_sec).min(self.capacity);
            state.last_refill = now;
        }

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            Ok(())
        } else {
            let deficit = 1.0 - state.tokens;
            let wait = (deficit / self.rate_per_sec).max(0.001);
            Err(Duration::from_secs_f64(wait))
        }
    }
}
