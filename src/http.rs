use crate::config::env_or;
use reqwest::Client;
use std::time::Duration;

/// Shared outbound client. Per-call deadlines are enforced by the provider
/// adapter; these are transport-level ceilings.
pub fn build_client() -> Client {
    let timeout = env_or("HTTP_TIMEOUT_SECS", 30u64);
    let connect = env_or("HTTP_CONNECT_TIMEOUT_SECS", 5u64);
    Client::builder()
        .user_agent(concat!("sourcing-pipeline/", env!("CARGO_PKG_VERSION")))
        .timeout(Duration::from_secs(timeout))
        .connect_timeout(Duration::from_secs(connect))
        .pool_idle_timeout(Duration::from_secs(90))
        .gzip(true)
        .build()
        .unwrap_or_else(|_| Client::new())
}
