use crate::models::Marketplace;
use crate::providers::Provider;
use std::{env, str::FromStr, time::Duration};

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Minimum ROI (percent) an item needs to be flagged as meeting threshold.
    pub min_roi_percent: f64,
    /// Percentage points below `min_roi_percent` that Stage 1 still lets through.
    pub stage1_guard_band_pct: f64,
    /// Referral fee used for the Stage-1 rough estimate when the catalog has none.
    pub default_referral_pct: f64,
    pub worker_pool_size: usize,
    pub max_job_errors: usize,
    pub marketplace: Marketplace,
    pub keepa: ProviderSettings,
    pub spapi: ProviderSettings,
    pub cache: CacheSettings,
}

#[derive(Debug, Clone)]
pub struct ProviderSettings {
    pub provider: Provider,
    pub rate_per_sec: f64,
    pub burst: f64,
    pub batch_ceiling: usize,
    pub timeout: Duration,
    pub max_retries: u32,
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub catalog_ttl: Duration,
    pub fee_ttl: Duration,
    pub max_entries: u64,
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        let timeout = Duration::from_secs(env_or("PROVIDER_TIMEOUT_SECS", 20u64).max(1));
        let max_retries = env_or("PROVIDER_MAX_RETRIES", 2u32);
        Self {
            min_roi_percent: env_or("MIN_ROI_PERCENT", 30.0),
            stage1_guard_band_pct: env_or("STAGE1_GUARD_BAND_PCT", 10.0f64).max(0.0),
            default_referral_pct: env_or("DEFAULT_REFERRAL_PCT", 15.0f64).clamp(0.0, 100.0),
            worker_pool_size: env_or("WORKER_POOL_SIZE", 4usize).max(1),
            max_job_errors: env_or("MAX_JOB_ERRORS", 100usize).max(1),
            marketplace: env::var("MARKETPLACE")
                .ok()
                .and_then(|value| Marketplace::from_code(&value))
                .unwrap_or_default(),
            keepa: ProviderSettings {
                provider: Provider::Keepa,
                rate_per_sec: positive_or("KEEPA_RATE_PER_SEC", 20.0),
                burst: env_or("KEEPA_BURST", 20.0f64).max(1.0),
                batch_ceiling: env_or("KEEPA_BATCH_CEILING", 100usize).clamp(1, 100),
                timeout,
                max_retries,
            },
            spapi: ProviderSettings {
                provider: Provider::SpApi,
                rate_per_sec: positive_or("SPAPI_RATE_PER_SEC", 2.0),
                burst: env_or("SPAPI_BURST", 2.0f64).max(1.0),
                batch_ceiling: env_or("SPAPI_BATCH_CEILING", 20usize).clamp(1, 20),
                timeout,
                max_retries,
            },
            cache: CacheSettings {
                catalog_ttl: Duration::from_secs(env_or("CATALOG_CACHE_TTL_SECS", 86_400u64)),
                fee_ttl: Duration::from_secs(env_or("FEE_CACHE_TTL_SECS", 604_800u64)),
                max_entries: env_or("CACHE_MAX_ENTRIES", 100_000u64).max(1),
            },
        }
    }

    pub fn provider(&self, provider: Provider) -> &ProviderSettings {
        match provider {
            Provider::Keepa => &self.keepa,
            Provider::SpApi => &self.spapi,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            min_roi_percent: 30.0,
            stage1_guard_band_pct: 10.0,
            default_referral_pct: 15.0,
            worker_pool_size: 4,
            max_job_errors: 100,
            marketplace: Marketplace::default(),
            keepa: ProviderSettings {
                provider: Provider::Keepa,
                rate_per_sec: 20.0,
                burst: 20.0,
                batch_ceiling: 100,
                timeout: Duration::from_secs(20),
                max_retries: 2,
            },
            spapi: ProviderSettings {
                provider: Provider::SpApi,
                rate_per_sec: 2.0,
                burst: 2.0,
                batch_ceiling: 20,
                timeout: Duration::from_secs(20),
                max_retries: 2,
            },
            cache: CacheSettings {
                catalog_ttl: Duration::from_secs(86_400),
                fee_ttl: Duration::from_secs(604_800),
                max_entries: 100_000,
            },
        }
    }
}

pub fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<T>().ok())
        .unwrap_or(default)
}

fn positive_or(key: &str, default: f64) -> f64 {
    env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<f64>().ok())
        .filter(|value| *value > 0.0)
        .unwrap_or(default)
}

pub fn parse_env_bool(key: &str) -> bool {
    match env::var(key) {
        Ok(value) => matches!(
            value.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => false,
    }
}
