use redis::aio::ConnectionManager;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{info, warn};

/// Shared Redis connection, opened on first use and reused by every caller.
/// The connection manager reconnects on its own after a dropped link.
#[derive(Clone)]
pub struct RedisHandle {
    client: redis::Client,
    conn: Arc<OnceCell<ConnectionManager>>,
}

impl RedisHandle {
    pub fn new(client: redis::Client) -> Self {
        Self {
            client,
            conn: Arc::new(OnceCell::new()),
        }
    }

    pub fn open(url: &str) -> Option<Self> {
        match redis::Client::open(url) {
            Ok(client) => {
                info!(target = "sourcing.cache", "redis tier configured");
                Some(Self::new(client))
            }
            Err(err) => {
                warn!(target = "sourcing.cache", error = %err, "invalid REDIS_URL; redis tier disabled");
                None
            }
        }
    }

    /// A failed connect leaves the slot empty so the next call tries again.
    pub async fn connection(&self) -> redis::RedisResult<ConnectionManager> {
        self.conn
            .get_or_try_init(|| ConnectionManager::new(self.client.clone()))
            .await
            .cloned()
    }

    #[cfg(test)]
    fn shares_connection_with(&self, other: &RedisHandle) -> bool {
        Arc::ptr_eq(&self.conn, &other.conn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_one_connection_slot() {
        let handle = RedisHandle::open("redis://127.0.0.1:6379/").unwrap();
        let clone = handle.clone();
        assert!(handle.shares_connection_with(&clone));

        let other = RedisHandle::open("redis://127.0.0.1:6379/").unwrap();
        assert!(!handle.shares_connection_with(&other));
    }

    #[test]
    fn malformed_url_disables_the_tier() {
        assert!(RedisHandle::open("not a redis url").is_none());
    }
}
