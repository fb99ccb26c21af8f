//! C5 — StateManager.
//!
//! Per-prefix typed K/V store with optional lease TTL and keyed watch
//! fan-out (spec section 4.5).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::SystemTime;

use envconfig::Envconfig;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::kv::{component_config_key, EventKind, SharedKv};

#[derive(Debug, Clone, Envconfig)]
pub struct StateManagerConfig {
    #[envconfig(from = "STATE_TTL", default = "0")]
    pub ttl: i64,
}

impl Default for StateManagerConfig {
    fn default() -> Self {
        Self { ttl: 0 }
    }
}

#[derive(Debug, Clone)]
pub struct StateEvent {
    pub key: String,
    pub value: Vec<u8>,
    pub kind: StateEventKind,
    pub timestamp: SystemTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateEventKind {
    Put,
    Delete,
}

/// Capacity of a single watcher's event channel (spec section 4.5).
const WATCH_CHANNEL_CAPACITY: usize = 100;

/// Per-prefix manager (spec section 3 "State entry").
pub struct StateManager {
    kv: SharedKv,
    prefix: String,
    config: StateManagerConfig,
    cancels: RwLock<HashMap<String, CancellationToken>>,
}

impl StateManager {
    fn config_key(prefix: &str) -> String {
        component_config_key("states", prefix)
    }

    pub fn new_unlocked(kv: SharedKv, prefix: String, config: StateManagerConfig) -> Arc<Self> {
        Arc::new(Self {
            kv,
            prefix,
            config,
            cancels: RwLock::new(HashMap::new()),
        })
    }

    pub async fn create(kv: SharedKv, prefix: String, config: StateManagerConfig) -> Result<Arc<Self>> {
        kv.put(
            &Self::config_key(&prefix),
            serde_json::to_vec(&config.ttl)?,
            None,
        )
        .await?;
        Ok(Self::new_unlocked(kv, prefix, config))
    }

    fn full_key(&self, key: &str) -> String {
        format!("/distributed/state/{}/{}", self.prefix, key)
    }

    /// `Put`: JSON-encodes anything that isn't already `&str`/`&[u8]`;
    /// grants a fresh lease per write when the manager's TTL is set.
    pub async fn put<T: Serialize + Sync>(&self, key: &str, value: &T) -> Result<()> {
        let bytes = serde_json::to_vec(value)?;
        self.put_bytes(key, bytes).await
    }

    pub async fn put_string(&self, key: &str, value: &str) -> Result<()> {
        self.put_bytes(key, value.as_bytes().to_vec()).await
    }

    pub async fn put_bytes(&self, key: &str, value: Vec<u8>) -> Result<()> {
        let lease_id = if self.config.ttl > 0 {
            Some(self.kv.grant_lease(self.config.ttl).await?)
        } else {
            None
        };
        self.kv.put(&self.full_key(key), value, lease_id).await
    }

    /// `Get`: parses the stored bytes into the receiver type.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.kv.get(&self.full_key(key)).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub async fn get_bytes(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.kv.get(&self.full_key(key)).await
    }

    /// `Delete`: removes one key.
    pub async fn delete(&self, key: &str) -> Result<()> {
        self.kv.delete(&self.full_key(key)).await
    }

    /// `ListKeys`: returns keys under a sub-prefix with the manager prefix
    /// stripped.
    pub async fn list_keys(&self, sub_prefix: &str) -> Result<Vec<String>> {
        let full_prefix = self.full_key(sub_prefix);
        let manager_root = format!("/distributed/state/{}/", self.prefix);
        let entries = self.kv.get_prefix(&full_prefix).await?;
        Ok(entries
            .into_iter()
            .map(|(k, _)| k.strip_prefix(&manager_root).unwrap_or(&k).to_string())
            .collect())
    }

    /// `Watch`: registers exactly one cancel function in the manager's
    /// table and returns a bounded channel; events beyond capacity are
    /// dropped with a warning. The channel closes, and the cancel entry is
    /// cleared from the table, whenever either the caller's token or the
    /// watch stream terminates — whichever comes first.
    pub async fn watch(self: &Arc<Self>, key: &str) -> Result<mpsc::Receiver<StateEvent>> {
        let full_key = self.full_key(key);
        let mut stream = self.kv.watch(&full_key, false).await?;
        let (tx, rx) = mpsc::channel(WATCH_CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();
        self.cancels.write().await.insert(key.to_string(), cancel.clone());

        let this = Arc::clone(self);
        let watch_key = key.to_string();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = futures::StreamExt::next(&mut stream) => {
                        match event {
                            Some(Ok(ev)) => {
                                let state_event = StateEvent {
                                    key: ev.key.clone(),
                                    value: ev.value.clone(),
                                    kind: match ev.kind {
                                        EventKind::Put => StateEventKind::Put,
                                        EventKind::Delete => StateEventKind::Delete,
                                    },
                                    timestamp: SystemTime::now(),
                                };
                                if tx.try_send(state_event).is_err() {
                                    tracing::warn!(key = %ev.key, "state watch channel full, dropping event");
                                }
                                continue;
                            }
                            Some(Err(e)) => {
                                tracing::warn!(error = %e, "state watch stream error, closing");
                            }
                            None => {}
                        }
                    }
                }
                break;
            }
            this.cancels.write().await.remove(&watch_key);
        });

        Ok(rx)
    }

    /// Cancels a single watcher started with `watch`, clearing its entry
    /// from the manager's table.
    pub async fn stop_watcher(&self, key: &str) {
        if let Some(cancel) = self.cancels.write().await.remove(key) {
            cancel.cancel();
        }
    }

    /// Invokes every registered cancel function and resets the table.
    pub async fn stop_all_watchers(&self) {
        let mut table = self.cancels.write().await;
        for (_, cancel) in table.drain() {
            cancel.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::test_support::FakeKv;

    #[tokio::test]
    async fn put_then_get_round_trips_through_json() {
        let manager = StateManager::new_unlocked(FakeKv::new(), "svc".into(), StateManagerConfig::default());
        manager.put("cursor", &42u64).await.expect("put succeeds");
        let value: Option<u64> = manager.get("cursor").await.expect("get succeeds");
        assert_eq!(value, Some(42));
    }

    #[tokio::test]
    async fn delete_removes_the_key() {
        let manager = StateManager::new_unlocked(FakeKv::new(), "svc".into(), StateManagerConfig::default());
        manager.put_string("name", "alice").await.expect("put succeeds");
        manager.delete("name").await.expect("delete succeeds");
        let value: Option<String> = manager.get("name").await.expect("get succeeds");
        assert_eq!(value, None);
    }

    #[tokio::test]
    async fn watch_delivers_put_and_delete_events() {
        let manager = StateManager::new_unlocked(FakeKv::new(), "svc".into(), StateManagerConfig::default());
        let mut rx = manager.watch("cursor").await.expect("watch succeeds");

        manager.put_string("cursor", "1").await.expect("put succeeds");
        let first = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("event arrives")
            .expect("channel open");
        assert_eq!(first.kind, StateEventKind::Put);

        manager.delete("cursor").await.expect("delete succeeds");
        let second = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("event arrives")
            .expect("channel open");
        assert_eq!(second.kind, StateEventKind::Delete);
    }

    #[tokio::test]
    async fn stop_watcher_clears_its_entry_from_the_cancel_table() {
        let manager = StateManager::new_unlocked(FakeKv::new(), "svc".into(), StateManagerConfig::default());
        let _rx = manager.watch("cursor").await.expect("watch succeeds");
        assert!(manager.cancels.read().await.contains_key("cursor"));

        manager.stop_watcher("cursor").await;
        assert!(!manager.cancels.read().await.contains_key("cursor"));
    }

    #[tokio::test]
    async fn stop_all_watchers_clears_every_entry() {
        let manager = StateManager::new_unlocked(FakeKv::new(), "svc".into(), StateManagerConfig::default());
        let _a = manager.watch("cursor-a").await.expect("watch succeeds");
        let _b = manager.watch("cursor-b").await.expect("watch succeeds");
        assert_eq!(manager.cancels.read().await.len(), 2);

        manager.stop_all_watchers().await;
        assert!(manager.cancels.read().await.is_empty());
    }

    #[tokio::test]
    async fn list_keys_strips_the_manager_prefix() {
        let manager = StateManager::new_unlocked(FakeKv::new(), "svc".into(), StateManagerConfig::default());
        manager.put_string("a", "1").await.expect("put succeeds");
        manager.put_string("b", "2").await.expect("put succeeds");
        let mut keys = manager.list_keys("").await.expect("list_keys succeeds");
        keys.sort();
        assert_eq!(keys, vec!["a".to_string(), "b".to_string()]);
    }
}
