use crate::redis_store::RedisHandle;
use std::{
    collections::HashMap,
    time::{Duration, Instant},
};
use tokio::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

/// Result of claiming an `Idempotency-Key` for a new job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    /// The key was free; the candidate job id now owns it.
    New,
    /// The key was already used; this is the job that owns it.
    Existing(Uuid),
}

/// Maps `(owner, Idempotency-Key)` to the job it started. Redis is used when
/// configured so retries that land on another instance still dedupe;
/// otherwise an in-process map with the same TTL.
pub struct IdempotencyStore {
    redis: Option<RedisHandle>,
    local: Mutex<HashMap<String, (Uuid, Instant)>>,
    ttl: Duration,
}

impl IdempotencyStore {
    pub fn new(redis: Option<RedisHandle>, ttl: Duration) -> Self {
        Self {
            redis,
            local: Mutex::new(HashMap::new()),
            ttl: ttl.max(Duration::from_secs(1)),
        }
    }

    fn key(owner_id: &str, key: &str) -> String {
        format!("sourcing:idem:{owner_id}:{key}")
    }

    /// Atomically binds `key` to `candidate` unless it is already bound.
    pub async fn claim(&self, owner_id: &str, key: &str, candidate: Uuid) -> Claim {
        let full = Self::key(owner_id, key);
        if let Some(redis) = &self.redis {
            match redis_claim(redis, &full, candidate, self.ttl).await {
                Ok(claim) => return claim,
                Err(err) => warn!(
                    target = "sourcing.api",
                    error = %err,
                    "idempotency_redis_unavailable_using_local"
                ),
            }
        }

        let mut guard = self.local.lock().await;
        let now = Instant::now();
        guard.retain(|_, (_, expires)| *expires > now);
        match guard.get(&full) {
            Some((existing, _)) => Claim::Existing(*existing),
            None => {
                guard.insert(full, (candidate, now + self.ttl));
                Claim::New
            }
        }
    }
}

async fn redis_claim(
    redis: &RedisHandle,
    key: &str,
    candidate: Uuid,
    ttl: Duration,
) -> redis::RedisResult<Claim> {
    let mut conn = redis.connection().await?;
    let set: Option<String> = redis::cmd("SET")
        .arg(key)
        .arg(candidate.to_string())
        .arg("NX")
        .arg("EX")
        .arg(ttl.as_secs())
        .query_async(&mut conn)
        .await?;
    if set.is_some() {
        return Ok(Claim::New);
    }
    let existing: Option<String> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
    Ok(existing
        .and_then(|value| Uuid::parse_str(&value).ok())
        .map(Claim::Existing)
        .unwrap_or(Claim::New))
}
