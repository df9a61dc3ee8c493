pub mod config;
pub mod keepa;
pub mod simulated;
pub mod spapi;

#[cfg(test)]
pub mod fake;

use crate::cache::ResponseCache;
use crate::config::{CacheSettings, ProviderSettings};
use crate::models::{KeyType, Marketplace};
use crate::ratelimit::RateLimiter;
use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::{
    collections::{HashMap, HashSet},
    fmt,
    future::Future,
    sync::Arc,
    time::{Duration, Instant},
};
use thiserror::Error;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    /// Cheap, high batch ceiling. Drives Stage 1.
    Keepa,
    /// Expensive, low batch ceiling. Drives Stage 2.
    SpApi,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Keepa => "keepa",
            Provider::SpApi => "sp_api",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Catalog and pricing fields for one key. Prices are in marketplace currency.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CatalogData {
    pub asin: Option<String>,
    pub title: Option<String>,
    pub brand: Option<String>,
    pub image_url: Option<String>,
    pub category: Option<String>,
    pub buy_box_price: Option<f64>,
    pub new_price: Option<f64>,
    pub seller_count: Option<u32>,
    pub fba_seller_count: Option<u32>,
    pub amazon_sells: Option<bool>,
    pub bsr: Option<u64>,
    pub referral_fee_pct: Option<f64>,
    pub fba_fee: Option<f64>,
}

impl CatalogData {
    /// Buy box first, then the lowest new offer.
    pub fn best_price(&self) -> Option<f64> {
        self.buy_box_price
            .filter(|price| *price > 0.0)
            .or(self.new_price.filter(|price| *price > 0.0))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct FeeBreakdown {
    pub total: f64,
    pub referral: Option<f64>,
    pub fba: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FeeRequest {
    pub key: String,
    pub price: f64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyError {
    pub key: String,
    pub message: String,
}

/// Partial result of one batched call: successes plus per-key failures.
#[derive(Debug, Clone)]
pub struct BatchResponse<T> {
    pub items: HashMap<String, T>,
    pub errors: Vec<KeyError>,
}

impl<T> Default for BatchResponse<T> {
    fn default() -> Self {
        Self {
            items: HashMap::new(),
            errors: Vec::new(),
        }
    }
}

impl<T> BatchResponse<T> {
    fn absorb(&mut self, other: BatchResponse<T>) {
        self.items.extend(other.items);
        self.errors.extend(other.errors);
    }

    pub fn error_for(&self, key: &str) -> Option<&str> {
        self.errors
            .iter()
            .find(|err| err.key == key)
            .map(|err| err.message.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderErrorKind {
    /// Timeouts, 5xx, throttling. Retried within the call.
    Transient,
    /// Bad credentials or exhausted quota. Never retried.
    Hard,
    /// Unusable request or response.
    Malformed,
}

#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("{provider} request timed out after {after_ms}ms")]
    Timeout { provider: Provider, after_ms: u64 },
    #[error("{provider} returned HTTP {status}: {message}")]
    Http {
        provider: Provider,
        status: u16,
        message: String,
    },
    #[error("{provider} rejected credentials: {message}")]
    Unauthorized { provider: Provider, message: String },
    #[error("{provider} quota exhausted: {message}")]
    QuotaExhausted { provider: Provider, message: String },
    #[error("{provider} request failed: {message}")]
    Request { provider: Provider, message: String },
    #[error("{provider} invalid response: {message}")]
    Deserialize { provider: Provider, message: String },
    #[error("{provider} batch of {size} exceeds ceiling {ceiling}")]
    BatchTooLarge {
        provider: Provider,
        size: usize,
        ceiling: usize,
    },
}

impl ProviderError {
    pub fn kind(&self) -> ProviderErrorKind {
        match self {
            ProviderError::Timeout { .. } | ProviderError::Request { .. } => {
                ProviderErrorKind::Transient
            }
            ProviderError::Http { status, .. } if *status == 429 || *status >= 500 => {
                ProviderErrorKind::Transient
            }
            ProviderError::Http { .. } => ProviderErrorKind::Malformed,
            ProviderError::Unauthorized { .. } | ProviderError::QuotaExhausted { .. } => {
                ProviderErrorKind::Hard
            }
            ProviderError::Deserialize { .. } | ProviderError::BatchTooLarge { .. } => {
                ProviderErrorKind::Malformed
            }
        }
    }

    pub fn is_hard(&self) -> bool {
        self.kind() == ProviderErrorKind::Hard
    }

    /// Maps a non-success HTTP status onto the error taxonomy.
    pub fn from_status(provider: Provider, status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            401 | 403 => ProviderError::Unauthorized { provider, message },
            402 => ProviderError::QuotaExhausted { provider, message },
            _ => ProviderError::Http {
                provider,
                status,
                message,
            },
        }
    }
}

/// Raw transport to one external provider. Implementations issue exactly the
/// request they are given; batching, caching, and retries live in
/// [`ProviderAdapter`].
#[async_trait]
pub trait ProviderClient: Send + Sync {
    fn provider(&self) -> Provider;

    async fn catalog(
        &self,
        keys: &[String],
        marketplace: Marketplace,
    ) -> Result<BatchResponse<CatalogData>, ProviderError>;

    async fn fees(
        &self,
        requests: &[FeeRequest],
        marketplace: Marketplace,
    ) -> Result<BatchResponse<FeeBreakdown>, ProviderError>;

    /// Splits keys into groups that each go out as exactly one request.
    fn request_groups(&self, keys: &[String]) -> Vec<Vec<String>> {
        vec![keys.to_vec()]
    }
}

/// Rate-limited, cache-backed, retrying front for one provider.
#[derive(Clone)]
pub struct ProviderAdapter {
    client: Arc<dyn ProviderClient>,
    limiter: Arc<RateLimiter>,
    cache: Arc<ResponseCache>,
    settings: ProviderSettings,
    catalog_ttl: Duration,
    fee_ttl: Duration,
}

impl ProviderAdapter {
    pub fn new(
        client: Arc<dyn ProviderClient>,
        limiter: Arc<RateLimiter>,
        cache: Arc<ResponseCache>,
        settings: ProviderSettings,
        cache_settings: &CacheSettings,
    ) -> Self {
        Self {
            client,
            limiter,
            cache,
            settings,
            catalog_ttl: cache_settings.catalog_ttl,
            fee_ttl: cache_settings.fee_ttl,
        }
    }

    pub fn provider(&self) -> Provider {
        self.settings.provider
    }

    pub fn batch_ceiling(&self) -> usize {
        self.settings.batch_ceiling
    }

    pub async fn fetch_catalog_batch(
        &self,
        keys: &[String],
        marketplace: Marketplace,
    ) -> Result<BatchResponse<CatalogData>, ProviderError> {
        let keys = dedupe(keys.iter().cloned());
        self.check_ceiling(keys.len())?;

        let mut response = BatchResponse::default();
        let mut misses = Vec::new();
        for key in keys {
            match self.cached::<CatalogData>(&key, marketplace).await {
                Some(data) => {
                    response.items.insert(key, data);
                }
                None => misses.push(key),
            }
        }
        if misses.is_empty() {
            return Ok(response);
        }

        let mut fresh = BatchResponse::default();
        for group in self.client.request_groups(&misses) {
            let part = self
                .call_with_retry("catalog", || self.client.catalog(&group, marketplace))
                .await?;
            for (key, data) in &part.items {
                self.store(key, marketplace, data, self.catalog_ttl).await;
            }
            fresh.absorb(part);
        }
        merge_fresh(&mut response, fresh, &misses);
        Ok(response)
    }

    pub async fn fetch_fee_batch(
        &self,
        requests: &[FeeRequest],
        marketplace: Marketplace,
    ) -> Result<BatchResponse<FeeBreakdown>, ProviderError> {
        let mut seen = HashSet::new();
        let requests: Vec<FeeRequest> = requests
            .iter()
            .filter(|req| seen.insert(req.key.clone()))
            .cloned()
            .collect();
        self.check_ceiling(requests.len())?;

        let mut response = BatchResponse::default();
        let mut misses = Vec::new();
        for request in requests {
            if !(request.price.is_finite() && request.price > 0.0) {
                response.errors.push(KeyError {
                    key: request.key.clone(),
                    message: "no_price_for_fee_estimate".into(),
                });
                continue;
            }
            let cache_key = fee_cache_key(&request);
            match self.cached::<FeeBreakdown>(&cache_key, marketplace).await {
                Some(fees) => {
                    response.items.insert(request.key, fees);
                }
                None => misses.push(request),
            }
        }
        if misses.is_empty() {
            return Ok(response);
        }

        let miss_keys: Vec<String> = misses.iter().map(|req| req.key.clone()).collect();
        let mut fresh = BatchResponse::default();
        for group in self.client.request_groups(&miss_keys) {
            let batch: Vec<FeeRequest> = misses
                .iter()
                .filter(|req| group.contains(&req.key))
                .cloned()
                .collect();
            let part = self
                .call_with_retry("fees", || self.client.fees(&batch, marketplace))
                .await?;
            for request in &batch {
                if let Some(fees) = part.items.get(&request.key) {
                    self.store(&fee_cache_key(request), marketplace, fees, self.fee_ttl)
                        .await;
                }
            }
            fresh.absorb(part);
        }
        merge_fresh(&mut response, fresh, &miss_keys);
        Ok(response)
    }

    fn check_ceiling(&self, size: usize) -> Result<(), ProviderError> {
        if size > self.settings.batch_ceiling {
            return Err(ProviderError::BatchTooLarge {
                provider: self.provider(),
                size,
                ceiling: self.settings.batch_ceiling,
            });
        }
        Ok(())
    }

    async fn cached<T: DeserializeOwned>(&self, key: &str, marketplace: Marketplace) -> Option<T> {
        let payload = self.cache.get(self.provider(), key, marketplace).await?;
        serde_json::from_value(payload).ok()
    }

    async fn store<T: Serialize>(&self, key: &str, marketplace: Marketplace, value: &T, ttl: Duration) {
        if let Ok(payload) = serde_json::to_value(value) {
            self.cache
                .put(self.provider(), key, marketplace, payload, ttl)
                .await;
        }
    }

    /// Every attempt spends a rate-limit token; failed attempts are not refunded.
    async fn call_with_retry<T, F, Fut>(
        &self,
        operation: &'static str,
        call: F,
    ) -> Result<T, ProviderError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let provider = self.provider();
        let mut attempt = 0u32;
        loop {
            self.limiter.acquire(provider).await;
            let started = Instant::now();
            let outcome = match timeout(self.settings.timeout, call()).await {
                Ok(result) => result,
                Err(_) => Err(ProviderError::Timeout {
                    provider,
                    after_ms: self.settings.timeout.as_millis() as u64,
                }),
            };
            crate::metrics::provider_call(
                provider,
                operation,
                started.elapsed().as_millis(),
                outcome.is_ok(),
            );

            match outcome {
                Ok(value) => return Ok(value),
                Err(err)
                    if err.kind() == ProviderErrorKind::Transient
                        && attempt < self.settings.max_retries =>
                {
                    attempt += 1;
                    let delay = backoff_delay(attempt);
                    warn!(
                        target = "sourcing.provider",
                        provider = provider.as_str(),
                        operation,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "provider_call_retry"
                    );
                    sleep(delay).await;
                }
                Err(err) => {
                    debug!(
                        target = "sourcing.provider",
                        provider = provider.as_str(),
                        operation,
                        error = %err,
                        "provider_call_failed"
                    );
                    return Err(err);
                }
            }
        }
    }
}

/// ASINs first, then UPC/EAN codes, dropping empty groups.
pub fn split_by_key_type(keys: &[String]) -> Vec<Vec<String>> {
    let (codes, asins): (Vec<String>, Vec<String>) = keys
        .iter()
        .cloned()
        .partition(|key| KeyType::detect(key) == Some(KeyType::Upc));
    [asins, codes]
        .into_iter()
        .filter(|group| !group.is_empty())
        .collect()
}

/// Fee estimates depend on the price point, so it is part of the cache key.
fn fee_cache_key(request: &FeeRequest) -> String {
    format!("{}@{:.2}", request.key, request.price)
}

fn dedupe(keys: impl Iterator<Item = String>) -> Vec<String> {
    let mut seen = HashSet::new();
    keys.filter(|key| seen.insert(key.clone())).collect()
}

/// Folds a fresh response into `response`; requested keys the provider
/// neither answered nor rejected are reported as `not_found`.
fn merge_fresh<T>(response: &mut BatchResponse<T>, fresh: BatchResponse<T>, requested: &[String]) {
    let BatchResponse { mut items, errors } = fresh;
    let requested_set: HashSet<&String> = requested.iter().collect();
    for key in requested {
        if let Some(value) = items.remove(key) {
            response.items.insert(key.clone(), value);
        } else if !errors.iter().any(|err| &err.key == key) {
            response.errors.push(KeyError {
                key: key.clone(),
                message: "not_found".into(),
            });
        }
    }
    response
        .errors
        .extend(errors.into_iter().filter(|err| requested_set.contains(&err.key)));
}

fn backoff_delay(attempt: u32) -> Duration {
    let base = 250u64.saturating_mul(1 << attempt.saturating_sub(1).min(5));
    let jitter = rand::rng().random_range(0..=100u64);
    Duration::from_millis(base + jitter)
}

#[cfg(test)]
mod tests {
    use super::fake::{Failure, ScriptedClient};
    use super::*;
    use crate::config::PipelineConfig;

    fn adapter(client: Arc<ScriptedClient>, max_retries: u32) -> ProviderAdapter {
        let config = PipelineConfig::default();
        let mut settings = config.provider(client.provider()).clone();
        settings.max_retries = max_retries;
        settings.timeout = Duration::from_millis(200);
        ProviderAdapter::new(
            client,
            Arc::new(RateLimiter::from_config(&config)),
            Arc::new(ResponseCache::new(&config.cache)),
            settings,
            &config.cache,
        )
    }

    fn keys(values: &[&str]) -> Vec<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    #[tokio::test]
    async fn cache_hits_skip_the_outbound_call() {
        let client = Arc::new(
            ScriptedClient::new(Provider::Keepa)
                .with_price("B000000001", 20.0)
                .with_price("B000000002", 30.0),
        );
        let adapter = adapter(client.clone(), 0);

        let first = adapter
            .fetch_catalog_batch(&keys(&["B000000001"]), Marketplace::Us)
            .await
            .unwrap();
        assert_eq!(first.items.len(), 1);

        let second = adapter
            .fetch_catalog_batch(&keys(&["B000000001", "B000000002"]), Marketplace::Us)
            .await
            .unwrap();
        assert_eq!(second.items.len(), 2);
        assert_eq!(
            client.catalog_calls(),
            vec![keys(&["B000000001"]), keys(&["B000000002"])]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn each_outbound_request_spends_one_token() {
        let config = PipelineConfig::default();
        let mut settings = config.keepa.clone();
        settings.rate_per_sec = 0.001;
        settings.burst = 3.0;
        settings.max_retries = 0;
        let limiter = Arc::new(RateLimiter::new(&settings, &config.spapi));
        let client = Arc::new(
            ScriptedClient::new(Provider::Keepa)
                .splitting_key_types()
                .with_price("B000000001", 20.0)
                .with_price("012345678905", 20.0),
        );
        let adapter = ProviderAdapter::new(
            client.clone(),
            limiter.clone(),
            Arc::new(ResponseCache::new(&config.cache)),
            settings,
            &config.cache,
        );

        let response = adapter
            .fetch_catalog_batch(&keys(&["B000000001", "012345678905"]), Marketplace::Us)
            .await
            .unwrap();
        assert_eq!(response.items.len(), 2);
        assert_eq!(
            client.catalog_calls(),
            vec![keys(&["B000000001"]), keys(&["012345678905"])]
        );
        // burst of three, two requests sent
        assert!(limiter.try_acquire(Provider::Keepa));
        assert!(!limiter.try_acquire(Provider::Keepa));
    }

    #[tokio::test]
    async fn partial_failure_keeps_successful_keys() {
        let client = Arc::new(
            ScriptedClient::new(Provider::SpApi)
                .with_price("B000000001", 20.0)
                .with_key_error("B000000002", "InvalidInput"),
        );
        let adapter = adapter(client, 0);
        let response = adapter
            .fetch_catalog_batch(
                &keys(&["B000000001", "B000000002", "B000000003"]),
                Marketplace::Us,
            )
            .await
            .unwrap();
        assert_eq!(response.items.len(), 1);
        assert_eq!(response.error_for("B000000002"), Some("InvalidInput"));
        assert_eq!(response.error_for("B000000003"), Some("not_found"));
    }

    #[tokio::test]
    async fn rejects_batches_over_ceiling() {
        let client = Arc::new(ScriptedClient::new(Provider::SpApi));
        let adapter = adapter(client.clone(), 0);
        let too_many: Vec<String> = (0..21).map(|idx| format!("B{idx:09}")).collect();
        let err = adapter
            .fetch_catalog_batch(&too_many, Marketplace::Us)
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::BatchTooLarge { size: 21, ceiling: 20, .. }));
        assert!(client.catalog_calls().is_empty());
    }

    #[tokio::test]
    async fn transient_errors_are_retried_within_bound() {
        let client = Arc::new(
            ScriptedClient::new(Provider::Keepa)
                .with_price("B000000001", 20.0)
                .with_catalog_failure(Failure::TransientTimes(2)),
        );
        let adapter = adapter(client.clone(), 2);
        let response = adapter
            .fetch_catalog_batch(&keys(&["B000000001"]), Marketplace::Us)
            .await
            .unwrap();
        assert_eq!(response.items.len(), 1);
        assert_eq!(client.catalog_calls().len(), 3);
    }

    #[tokio::test]
    async fn hard_errors_are_not_retried() {
        let client = Arc::new(
            ScriptedClient::new(Provider::SpApi).with_catalog_failure(Failure::Hard),
        );
        let adapter = adapter(client.clone(), 3);
        let err = adapter
            .fetch_catalog_batch(&keys(&["B000000001"]), Marketplace::Us)
            .await
            .unwrap_err();
        assert!(err.is_hard());
        assert_eq!(client.catalog_calls().len(), 1);
    }

    #[tokio::test]
    async fn slow_calls_time_out() {
        let client = Arc::new(
            ScriptedClient::new(Provider::SpApi)
                .with_price("B000000001", 20.0)
                .with_catalog_failure(Failure::Stall(Duration::from_secs(5))),
        );
        let adapter = adapter(client, 0);
        let err = adapter
            .fetch_catalog_batch(&keys(&["B000000001"]), Marketplace::Us)
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Timeout { .. }));
        assert_eq!(err.kind(), ProviderErrorKind::Transient);
    }

    #[tokio::test]
    async fn fee_cache_is_keyed_by_price_point() {
        let client = Arc::new(ScriptedClient::new(Provider::SpApi));
        let adapter = adapter(client.clone(), 0);
        let at = |price: f64| {
            vec![FeeRequest {
                key: "B000000001".into(),
                price,
            }]
        };
        adapter.fetch_fee_batch(&at(20.0), Marketplace::Us).await.unwrap();
        adapter.fetch_fee_batch(&at(20.0), Marketplace::Us).await.unwrap();
        adapter.fetch_fee_batch(&at(25.0), Marketplace::Us).await.unwrap();
        assert_eq!(client.fee_calls().len(), 2);
    }

    #[tokio::test]
    async fn fee_requests_without_price_are_rejected_per_key() {
        let client = Arc::new(ScriptedClient::new(Provider::SpApi));
        let adapter = adapter(client.clone(), 0);
        let response = adapter
            .fetch_fee_batch(
                &[
                    FeeRequest {
                        key: "B000000001".into(),
                        price: 0.0,
                    },
                    FeeRequest {
                        key: "B000000002".into(),
                        price: 10.0,
                    },
                ],
                Marketplace::Us,
            )
            .await
            .unwrap();
        assert!(response.items.contains_key("B000000002"));
        assert_eq!(
            response.error_for("B000000001"),
            Some("no_price_for_fee_estimate")
        );
        assert_eq!(client.fee_calls().len(), 1);
    }

    #[test]
    fn status_codes_map_to_error_kinds() {
        let kind = |status| ProviderError::from_status(Provider::Keepa, status, "x").kind();
        assert_eq!(kind(401), ProviderErrorKind::Hard);
        assert_eq!(kind(402), ProviderErrorKind::Hard);
        assert_eq!(kind(429), ProviderErrorKind::Transient);
        assert_eq!(kind(503), ProviderErrorKind::Transient);
        assert_eq!(kind(400), ProviderErrorKind::Malformed);
    }
}
