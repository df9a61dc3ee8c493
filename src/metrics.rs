use crate::providers::Provider;
use tracing::trace;

// Lightweight metrics helpers emitted as trace events.
// The Prometheus recorder is installed in main for the /metrics endpoint.

pub fn inc_requests(route: &'static str) {
    trace!(
        target = "sourcing.metrics",
        route = route,
        "requests_total_inc"
    );
}

pub fn provider_call(provider: Provider, operation: &'static str, elapsed_ms: u128, ok: bool) {
    trace!(
        target = "sourcing.metrics",
        provider = provider.as_str(),
        operation = operation,
        elapsed_ms = elapsed_ms as u64,
        ok = ok,
        "provider_call"
    );
}

pub fn cache_lookup(provider: Provider, hit: bool) {
    trace!(
        target = "sourcing.metrics",
        provider = provider.as_str(),
        hit = hit,
        "cache_lookup"
    );
}

pub fn chunk_elapsed(stage: &'static str, items: usize, elapsed_ms: u128) {
    trace!(
        target = "sourcing.metrics",
        stage = stage,
        items = items as u64,
        elapsed_ms = elapsed_ms as u64,
        "chunk_elapsed"
    );
}
