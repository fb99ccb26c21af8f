//! In-memory [`KvStore`] fake used only by this crate's unit tests.
//!
//! Every primitive in this crate is built against the `KvStore` trait
//! precisely so it can be exercised without a live etcd (see `kv.rs`'s
//! doc comment on the trait). This fake reproduces the handful of
//! semantics the primitives actually depend on: revision-ordered
//! put/delete, prefix reads, CAS create-if-absent, and a watch stream
//! fanned out from a broadcast channel. TTL expiry is not driven by a
//! real clock — tests that need it call [`FakeKv::expire_lease`] to
//! simulate the KV store reaping an expired lease.

#![cfg(test)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::kv::{tokio_stream_from_receiver, EventKind, KvEvent, KvEventStream, KvStore, LeaseRevoke, Session};

#[derive(Clone)]
struct Entry {
    value: Vec<u8>,
    lease_id: Option<i64>,
    create_revision: i64,
    mod_revision: i64,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<String, Entry>,
    revision: i64,
    next_lease: i64,
    live_leases: std::collections::HashSet<i64>,
}

/// An in-process stand-in for [`crate::kv::EtcdAdapter`].
pub struct FakeKv {
    inner: Arc<Mutex<Inner>>,
    events: broadcast::Sender<KvEvent>,
}

impl FakeKv {
    pub fn new() -> Arc<Self> {
        let (events, _rx) = broadcast::channel(1024);
        Arc::new(Self {
            inner: Arc::new(Mutex::new(Inner {
                next_lease: 1,
                ..Default::default()
            })),
            events,
        })
    }

    /// Simulates the KV store reaping an expired (or revoked) lease:
    /// every key attached to `lease_id` is deleted and a delete event is
    /// published for each, exactly as a real TTL expiry would look to a
    /// watcher.
    pub fn expire_lease(&self, lease_id: i64) {
        expire_lease_in(&self.inner, &self.events, lease_id);
    }

    pub fn lease_is_live(&self, lease_id: i64) -> bool {
        self.inner.lock().unwrap().live_leases.contains(&lease_id)
    }
}

fn expire_lease_in(inner: &Arc<Mutex<Inner>>, events: &broadcast::Sender<KvEvent>, lease_id: i64) {
    let mut guard = inner.lock().unwrap();
    guard.live_leases.remove(&lease_id);
    let dead: Vec<String> = guard
        .entries
        .iter()
        .filter(|(_, e)| e.lease_id == Some(lease_id))
        .map(|(k, _)| k.clone())
        .collect();
    let mut published = Vec::with_capacity(dead.len());
    for key in dead {
        guard.entries.remove(&key);
        guard.revision += 1;
        published.push(KvEvent {
            key,
            value: Vec::new(),
            kind: EventKind::Delete,
            mod_revision: guard.revision,
            create_revision: 0,
        });
    }
    drop(guard);
    for event in published {
        let _ = events.send(event);
    }
}

#[async_trait]
impl KvStore for FakeKv {
    async fn put(&self, key: &str, value: Vec<u8>, lease_id: Option<i64>) -> Result<()> {
        let event = {
            let mut guard = self.inner.lock().unwrap();
            guard.revision += 1;
            let rev = guard.revision;
            let create_revision = guard.entries.get(key).map(|e| e.create_revision).unwrap_or(rev);
            guard.entries.insert(
                key.to_string(),
                Entry {
                    value: value.clone(),
                    lease_id,
                    create_revision,
                    mod_revision: rev,
                },
            );
            KvEvent {
                key: key.to_string(),
                value,
                kind: EventKind::Put,
                mod_revision: rev,
                create_revision,
            }
        };
        let _ = self.events.send(event);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.inner.lock().unwrap().entries.get(key).map(|e| e.value.clone()))
    }

    async fn get_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .entries
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, e)| (k.clone(), e.value.clone()))
            .collect())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let event = {
            let mut guard = self.inner.lock().unwrap();
            if guard.entries.remove(key).is_none() {
                None
            } else {
                guard.revision += 1;
                Some(KvEvent {
                    key: key.to_string(),
                    value: Vec::new(),
                    kind: EventKind::Delete,
                    mod_revision: guard.revision,
                    create_revision: 0,
                })
            }
        };
        if let Some(event) = event {
            let _ = self.events.send(event);
        }
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<()> {
        let events = {
            let mut guard = self.inner.lock().unwrap();
            let keys: Vec<String> = guard.entries.keys().filter(|k| k.starts_with(prefix)).cloned().collect();
            let mut events = Vec::with_capacity(keys.len());
            for key in keys {
                guard.entries.remove(&key);
                guard.revision += 1;
                events.push(KvEvent {
                    key,
                    value: Vec::new(),
                    kind: EventKind::Delete,
                    mod_revision: guard.revision,
                    create_revision: 0,
                });
            }
            events
        };
        for event in events {
            let _ = self.events.send(event);
        }
        Ok(())
    }

    async fn watch(&self, key_or_prefix: &str, is_prefix: bool) -> Result<KvEventStream> {
        let mut rx = self.events.subscribe();
        let key_or_prefix = key_or_prefix.to_string();
        let (tx, out_rx) = tokio::sync::mpsc::channel(256);
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        let matches = if is_prefix {
                            event.key.starts_with(&key_or_prefix)
                        } else {
                            event.key == key_or_prefix
                        };
                        if matches && tx.send(Ok(event)).await.is_err() {
                            return;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        });
        Ok(Box::pin(tokio_stream_from_receiver(out_rx)))
    }

    async fn grant_lease(&self, _ttl_secs: i64) -> Result<i64> {
        let mut guard = self.inner.lock().unwrap();
        let id = guard.next_lease;
        guard.next_lease += 1;
        guard.live_leases.insert(id);
        Ok(id)
    }

    async fn revoke_lease(&self, lease_id: i64) -> Result<()> {
        self.expire_lease(lease_id);
        Ok(())
    }

    async fn create_if_absent(&self, key: &str, value: Vec<u8>, lease_id: Option<i64>) -> Result<bool> {
        let event = {
            let mut guard = self.inner.lock().unwrap();
            if guard.entries.contains_key(key) {
                None
            } else {
                guard.revision += 1;
                let rev = guard.revision;
                guard.entries.insert(
                    key.to_string(),
                    Entry {
                        value: value.clone(),
                        lease_id,
                        create_revision: rev,
                        mod_revision: rev,
                    },
                );
                Some(KvEvent {
                    key: key.to_string(),
                    value,
                    kind: EventKind::Put,
                    mod_revision: rev,
                    create_revision: rev,
                })
            }
        };
        match event {
            Some(event) => {
                let _ = self.events.send(event);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn new_session(&self, ttl_secs: i64) -> Result<Session> {
        let lease_id = self.grant_lease(ttl_secs).await?;
        let inner = Arc::clone(&self.inner);
        let events = self.events.clone();
        let revoke: LeaseRevoke = Arc::new(move |lease_id: i64| -> futures::future::BoxFuture<'static, Result<()>> {
            let inner = Arc::clone(&inner);
            let events = events.clone();
            Box::pin(async move {
                expire_lease_in(&inner, &events, lease_id);
                Ok(())
            })
        });
        // Tests drive expiry explicitly via `expire_lease`; there is no
        // background ticker to cancel, so `cancel`/`keepalive` are inert.
        Ok(Session::new(lease_id, revoke, CancellationToken::new(), None))
    }
}
