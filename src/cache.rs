use crate::config::CacheSettings;
use crate::models::Marketplace;
use crate::providers::Provider;
use crate::redis_store::RedisHandle;
use chrono::{DateTime, Utc};
use moka::future::Cache;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{sync::Arc, time::Duration};
use tracing::{debug, warn};

/// A cached provider payload. Never mutated; a refresh replaces the entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub provider: Provider,
    pub lookup_key: String,
    pub marketplace: Marketplace,
    pub payload: Value,
    pub fetched_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl CacheEntry {
    fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    provider: Provider,
    lookup_key: String,
    marketplace: Marketplace,
}

impl CacheKey {
    fn redis_key(&self) -> String {
        format!(
            "sourcing:cache:{}:{}:{}",
            self.provider.as_str(),
            self.marketplace.code(),
            self.lookup_key
        )
    }
}

/// Read-through response cache shared by every adapter and worker.
///
/// The in-process tier is a sharded `moka` cache, so lookups for unrelated
/// keys never wait on each other. When a Redis client is attached, entries are
/// also written there with the same TTL so other processes can reuse them.
/// Expired entries read as misses regardless of when the sweep last ran.
pub struct ResponseCache {
    local: Cache<CacheKey, Arc<CacheEntry>>,
    redis: Option<RedisHandle>,
}

impl ResponseCache {
    pub fn new(settings: &CacheSettings) -> Self {
        let ceiling = settings
            .catalog_ttl
            .max(settings.fee_ttl)
            .max(Duration::from_secs(1));
        Self {
            local: Cache::builder()
                .max_capacity(settings.max_entries)
                .time_to_live(ceiling)
                .build(),
            redis: None,
        }
    }

    pub fn with_redis(mut self, redis: Option<RedisHandle>) -> Self {
        self.redis = redis;
        self
    }

    pub async fn get(
        &self,
        provider: Provider,
        lookup_key: &str,
        marketplace: Marketplace,
    ) -> Option<Value> {
        let key = CacheKey {
            provider,
            lookup_key: lookup_key.to_string(),
            marketplace,
        };
        let now = Utc::now();

        if let Some(entry) = self.local.get(&key).await {
            if !entry.is_expired_at(now) {
                crate::metrics::cache_lookup(provider, true);
                return Some(entry.payload.clone());
            }
            self.local.invalidate(&key).await;
        }

        if let Some(entry) = self.redis_get(&key).await
            && !entry.is_expired_at(now)
        {
            let payload = entry.payload.clone();
            self.local.insert(key, Arc::new(entry)).await;
            crate::metrics::cache_lookup(provider, true);
            return Some(payload);
        }

        crate::metrics::cache_lookup(provider, false);
        None
    }

    pub async fn put(
        &self,
        provider: Provider,
        lookup_key: &str,
        marketplace: Marketplace,
        payload: Value,
        ttl: Duration,
    ) {
        let fetched_at = Utc::now();
        let expires_at = fetched_at
            + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(7));
        let key = CacheKey {
            provider,
            lookup_key: lookup_key.to_string(),
            marketplace,
        };
        let entry = CacheEntry {
            provider,
            lookup_key: lookup_key.to_string(),
            marketplace,
            payload,
            fetched_at,
            expires_at,
        };
        self.redis_set(&key, &entry, ttl).await;
        self.local.insert(key, Arc::new(entry)).await;
    }

    /// Drops expired entries from the in-process tier and returns how many.
    pub async fn purge_expired(&self) -> usize {
        let now = Utc::now();
        let expired: Vec<Arc<CacheKey>> = self
            .local
            .iter()
            .filter(|(_, entry)| entry.is_expired_at(now))
            .map(|(key, _)| key)
            .collect();
        for key in &expired {
            self.local.invalidate(key.as_ref()).await;
        }
        if !expired.is_empty() {
            debug!(target = "sourcing.cache", purged = expired.len(), "cache_sweep");
        }
        expired.len()
    }

    async fn redis_get(&self, key: &CacheKey) -> Option<CacheEntry> {
        let redis = self.redis.as_ref()?;
        let mut conn = match redis.connection().await {
            Ok(conn) => conn,
            Err(err) => {
                warn!(target = "sourcing.cache", error = %err, "redis_connect_failed");
                return None;
            }
        };
        let raw: redis::RedisResult<Option<String>> = conn.get(key.redis_key()).await;
        raw.ok()
            .flatten()
            .and_then(|value| serde_json::from_str(&value).ok())
    }

    async fn redis_set(&self, key: &CacheKey, entry: &CacheEntry, ttl: Duration) {
        let Some(redis) = &self.redis else {
            return;
        };
        let ttl_secs = ttl.as_secs();
        if ttl_secs == 0 {
            return;
        }
        if let Ok(mut conn) = redis.connection().await
            && let Ok(json) = serde_json::to_string(entry)
        {
            let result: Result<(), _> = conn.set_ex(key.redis_key(), json, ttl_secs).await;
            if let Err(err) = result {
                warn!(target = "sourcing.cache", error = %err, "redis_set_failed");
            }
        }
    }
}
