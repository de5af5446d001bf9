use crate::hash::ConsistentHash;
use crate::types::{Endpoint, SegmentId};
use std::time::{Duration, Instant};
use tokio::time::sleep;

/// Install a fmt subscriber once per test binary. `RUST_LOG` overrides the
/// default filter.
pub(crate) fn init_tracing() {
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

pub(crate) fn ep(name: &str) -> Endpoint {
    Endpoint::new(name, 11222)
}

/// First generated key that hashes into `segment`.
pub(crate) fn key_in_segment(ch: &ConsistentHash, segment: SegmentId) -> Vec<u8> {
    (0..100_000)
        .map(|i| format!("key-{}", i).into_bytes())
        .find(|key| ch.key_to_segment(key) == segment)
        .expect("no key found for segment")
}

/// Wait for a condition with timeout
pub(crate) async fn wait_for<F>(condition: F, timeout: Duration, check_interval: Duration) -> bool
where
    F: Fn() -> bool,
{
    let start = Instant::now();
    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        sleep(check_interval).await;
    }
    condition()
}
