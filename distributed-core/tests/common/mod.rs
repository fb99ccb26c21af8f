use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use distributed_core::kv::{EtcdAdapter, KvConfig};

pub const ETCD_ENDPOINT: &str = "http://localhost:2379";
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(10);
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Connects to a real etcd and hands back an adapter with no namespacing of
/// its own — callers scope keys under a random-prefixed component name so
/// concurrent test runs never collide, matching
/// `personhog-coordination/tests/common::test_store`'s per-test prefix.
pub async fn test_kv() -> Arc<EtcdAdapter> {
    let endpoint = std::env::var("ETCD_ENDPOINT").unwrap_or_else(|_| ETCD_ENDPOINT.to_string());
    let config = KvConfig {
        endpoints: vec![endpoint],
    };
    Arc::new(
        EtcdAdapter::connect(config)
            .await
            .expect("failed to connect to etcd"),
    )
}

/// A name scoped to this test run so multiple `#[tokio::test]`s sharing one
/// etcd instance never read or write each other's component keys.
pub fn test_name(case: &str) -> String {
    format!("{case}-{}", uuid::Uuid::new_v4())
}

pub async fn wait_for_condition<F, Fut>(timeout: Duration, interval: Duration, f: F)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if f().await {
            return;
        }
        tokio::time::sleep(interval).await;
    }
    panic!("condition did not become true within {timeout:?}");
}
