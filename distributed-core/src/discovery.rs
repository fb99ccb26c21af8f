//! Service discovery.
//!
//! Service registry: register/deregister instances under a service-name
//! prefix, watch service membership, and keep an in-memory snapshot fed by
//! KV events.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use envconfig::Envconfig;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::kv::{EventKind, KvEvent, SharedKv};

#[derive(Debug, Clone, Envconfig)]
pub struct DiscoveryConfig {
    #[envconfig(from = "DISCOVERY_SERVICE_ROOT", default = "/aio/services")]
    pub service_root: String,

    #[envconfig(from = "DISCOVERY_TTL", default = "30")]
    pub ttl: i64,

    #[envconfig(from = "DISCOVERY_HEARTBEAT_PERIOD", default = "10s")]
    pub heartbeat_period: String,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            service_root: "/aio/services".to_string(),
            ttl: 30,
            heartbeat_period: "10s".to_string(),
        }
    }
}

/// `{id, name, address, port, metadata?, registerTime}`. Unknown fields are
/// preserved opaquely via `extra`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceInstance {
    pub id: String,
    pub name: String,
    pub address: String,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, String>>,
    #[serde(rename = "registerTime")]
    pub register_time: String,
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEventKind {
    Add,
    Update,
    Delete,
}

#[derive(Debug, Clone)]
pub struct DiscoveryEvent {
    pub service_name: String,
    pub instance: Option<ServiceInstance>,
    pub instance_id: String,
    pub kind: DiscoveryEventKind,
}

pub type WatcherId = u64;
type WatcherFn = Box<dyn Fn(DiscoveryEvent) + Send + Sync>;

struct WatcherEntry {
    handler: WatcherFn,
    cancel: CancellationToken,
}

/// Registers instances for one service catalog.
pub struct Discovery {
    kv: SharedKv,
    config: DiscoveryConfig,
    /// `name -> id -> instance`, converging to the KV contents within one
    /// watch round-trip.
    cache: RwLock<HashMap<String, HashMap<String, ServiceInstance>>>,
    /// `name -> watcher_id -> entry`.
    watchers: RwLock<HashMap<String, HashMap<WatcherId, WatcherEntry>>>,
}

impl Discovery {
    pub fn new(kv: SharedKv, config: DiscoveryConfig) -> Arc<Self> {
        Arc::new(Self {
            kv,
            config,
            cache: RwLock::new(HashMap::new()),
            watchers: RwLock::new(HashMap::new()),
        })
    }

    fn instance_key(&self, name: &str, id: &str) -> String {
        format!("{}/{}/{}", self.config.service_root.trim_end_matches('/'), name, id)
    }

    fn service_prefix(&self, name: &str) -> String {
        format!("{}/{}/", self.config.service_root.trim_end_matches('/'), name)
    }

    /// `Register`: validates id/name/address, substitutes `0.0.0.0` with
    /// the first non-loopback IPv4 of the host, writes the instance, and
    /// updates the in-memory cache.
    pub async fn register(&self, mut instance: ServiceInstance) -> Result<()> {
        if instance.id.is_empty() {
            return Err(Error::Validation("instance id must not be empty".into()));
        }
        if instance.name.is_empty() {
            return Err(Error::Validation("service name must not be empty".into()));
        }
        if instance.address.is_empty() {
            return Err(Error::Validation("instance address must not be empty".into()));
        }

        if instance.address == "0.0.0.0" {
            if let Ok(local_ip) = local_ip_address::local_ip() {
                instance.address = local_ip.to_string();
            }
        }

        let lease_id = if self.config.ttl > 0 {
            Some(self.kv.grant_lease(self.config.ttl).await?)
        } else {
            None
        };

        let key = self.instance_key(&instance.name, &instance.id);
        let bytes = serde_json::to_vec(&instance)?;
        self.kv.put(&key, bytes, lease_id).await?;

        self.cache
            .write()
            .await
            .entry(instance.name.clone())
            .or_default()
            .insert(instance.id.clone(), instance);
        Ok(())
    }

    /// `Deregister`: unknown ids are an error.
    pub async fn deregister(&self, name: &str, id: &str) -> Result<()> {
        let found = {
            let mut cache = self.cache.write().await;
            match cache.get_mut(name) {
                Some(inner) => inner.remove(id).is_some(),
                None => false,
            }
        };
        if !found {
            return Err(Error::NotFound);
        }
        let key = self.instance_key(name, id);
        self.kv.delete(&key).await
    }

    /// `Discover`: prefix-reads the service's namespace.
    pub async fn discover(&self, name: &str) -> Result<Vec<ServiceInstance>> {
        let prefix = self.service_prefix(name);
        let entries = self.kv.get_prefix(&prefix).await?;
        entries
            .into_iter()
            .map(|(_, v)| serde_json::from_slice(&v).map_err(Error::from))
            .collect()
    }

    /// `GetAllServices`: groups the entire cache by service name.
    pub async fn get_all_services(&self) -> HashMap<String, Vec<ServiceInstance>> {
        self.cache
            .read()
            .await
            .iter()
            .map(|(name, instances)| (name.clone(), instances.values().cloned().collect()))
            .collect()
    }

    /// `AddWatcher`: opens a prefix watch, synchronously replays an ADD for
    /// every current instance, then streams PUT (ADD on create revision,
    /// UPDATE otherwise, see [`crate::kv::KvEvent::is_create`]) and DELETE
    /// events. Runs the handler set for `name` sequentially on the watch
    /// task.
    pub async fn add_watcher<F>(self: &Arc<Self>, name: &str, handler: F) -> Result<WatcherId>
    where
        F: Fn(DiscoveryEvent) + Send + Sync + 'static,
    {
        let prefix = self.service_prefix(name);
        let mut stream = self.kv.watch(&prefix, true).await?;

        let watcher_id = now_nanos();
        let cancel = CancellationToken::new();

        let existing = self.discover(name).await.unwrap_or_default();
        for instance in existing {
            handler(DiscoveryEvent {
                service_name: name.to_string(),
                instance_id: instance.id.clone(),
                instance: Some(instance),
                kind: DiscoveryEventKind::Add,
            });
        }

        let handler: WatcherFn = Box::new(handler);
        {
            let mut watchers = self.watchers.write().await;
            watchers.entry(name.to_string()).or_default().insert(
                watcher_id,
                WatcherEntry {
                    handler,
                    cancel: cancel.clone(),
                },
            );
        }

        let this = Arc::clone(self);
        let service_name = name.to_string();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    event = futures::StreamExt::next(&mut stream) => {
                        match event {
                            Some(Ok(ev)) => this.on_kv_event(&service_name, watcher_id, ev).await,
                            Some(Err(e)) => {
                                tracing::warn!(service = %service_name, error = %e, "discovery watch error, removing watcher");
                                this.remove_watcher(&service_name, watcher_id).await;
                                return;
                            }
                            None => {
                                this.remove_watcher(&service_name, watcher_id).await;
                                return;
                            }
                        }
                    }
                }
            }
        });

        Ok(watcher_id)
    }

    async fn on_kv_event(&self, service_name: &str, watcher_id: WatcherId, event: KvEvent) {
        let id = instance_id_from_key(&event.key);

        let (kind, instance) = match event.kind {
            EventKind::Delete => {
                let mut cache = self.cache.write().await;
                if let Some(inner) = cache.get_mut(service_name) {
                    inner.remove(&id);
                    if inner.is_empty() {
                        cache.remove(service_name);
                    }
                }
                (DiscoveryEventKind::Delete, None)
            }
            EventKind::Put => {
                let instance: ServiceInstance = match serde_json::from_slice(&event.value) {
                    Ok(v) => v,
                    Err(e) => {
                        tracing::warn!(key = %event.key, error = %e, "discovery: malformed instance payload");
                        return;
                    }
                };
                let kind = if event.is_create() {
                    DiscoveryEventKind::Add
                } else {
                    DiscoveryEventKind::Update
                };
                self.cache
                    .write()
                    .await
                    .entry(service_name.to_string())
                    .or_default()
                    .insert(id.clone(), instance.clone());
                (kind, Some(instance))
            }
        };

        let watchers = self.watchers.read().await;
        if let Some(inner) = watchers.get(service_name) {
            if let Some(entry) = inner.get(&watcher_id) {
                (entry.handler)(DiscoveryEvent {
                    service_name: service_name.to_string(),
                    instance_id: id,
                    instance,
                    kind,
                });
            }
        }
    }

    /// `RemoveWatcher`: cancels the watch, removes the cancel/handler
    /// entries, and trims empty inner maps.
    pub async fn remove_watcher(&self, name: &str, watcher_id: WatcherId) {
        let mut watchers = self.watchers.write().await;
        if let Some(inner) = watchers.get_mut(name) {
            if let Some(entry) = inner.remove(&watcher_id) {
                entry.cancel.cancel();
            }
            if inner.is_empty() {
                watchers.remove(name);
            }
        }
    }
}

fn instance_id_from_key(key: &str) -> String {
    key.rsplit('/').next().unwrap_or(key).to_string()
}

fn now_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    use super::*;
    use crate::test_support::FakeKv;

    fn instance(id: &str) -> ServiceInstance {
        ServiceInstance {
            id: id.to_string(),
            name: "orders".to_string(),
            address: "10.0.0.1".to_string(),
            port: 8080,
            metadata: None,
            register_time: "2026-01-01T00:00:00Z".to_string(),
            extra: HashMap::new(),
        }
    }

    async fn wait_until<F: Fn() -> bool>(f: F) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !f() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition did not become true in time");
    }

    #[tokio::test]
    async fn register_then_discover_returns_the_instance() {
        let discovery = Discovery::new(FakeKv::new(), DiscoveryConfig::default());
        discovery.register(instance("i-1")).await.expect("register succeeds");
        let found = discovery.discover("orders").await.expect("discover succeeds");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, "i-1");
    }

    #[tokio::test]
    async fn deregister_unknown_instance_is_not_found() {
        let discovery = Discovery::new(FakeKv::new(), DiscoveryConfig::default());
        let err = discovery.deregister("orders", "missing").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn watcher_sees_add_then_delete_as_the_catalog_changes() {
        let discovery = Discovery::new(FakeKv::new(), DiscoveryConfig::default());
        let events: Arc<StdMutex<Vec<DiscoveryEventKind>>> = Arc::new(StdMutex::new(Vec::new()));
        let events_clone = Arc::clone(&events);
        discovery
            .add_watcher("orders", move |ev| events_clone.lock().unwrap().push(ev.kind))
            .await
            .expect("add_watcher succeeds");

        discovery.register(instance("i-1")).await.expect("register succeeds");
        wait_until(|| events.lock().unwrap().len() == 1).await;

        discovery.deregister("orders", "i-1").await.expect("deregister succeeds");
        wait_until(|| events.lock().unwrap().len() == 2).await;

        let seen = events.lock().unwrap().clone();
        assert_eq!(seen, vec![DiscoveryEventKind::Add, DiscoveryEventKind::Delete]);
    }

    #[tokio::test]
    async fn add_watcher_replays_existing_instances_as_add_events() {
        let discovery = Discovery::new(FakeKv::new(), DiscoveryConfig::default());
        discovery.register(instance("i-1")).await.expect("register succeeds");
        discovery.register(instance("i-2")).await.expect("register succeeds");

        let events: Arc<StdMutex<Vec<String>>> = Arc::new(StdMutex::new(Vec::new()));
        let events_clone = Arc::clone(&events);
        discovery
            .add_watcher("orders", move |ev| events_clone.lock().unwrap().push(ev.instance_id))
            .await
            .expect("add_watcher succeeds");

        let mut seen = events.lock().unwrap().clone();
        seen.sort();
        assert_eq!(seen, vec!["i-1".to_string(), "i-2".to_string()]);
    }

    #[tokio::test]
    async fn remove_watcher_stops_further_delivery() {
        let discovery = Discovery::new(FakeKv::new(), DiscoveryConfig::default());
        let events: Arc<StdMutex<Vec<DiscoveryEventKind>>> = Arc::new(StdMutex::new(Vec::new()));
        let events_clone = Arc::clone(&events);
        let watcher_id = discovery
            .add_watcher("orders", move |ev| events_clone.lock().unwrap().push(ev.kind))
            .await
            .expect("add_watcher succeeds");

        discovery.remove_watcher("orders", watcher_id).await;
        discovery.register(instance("i-1")).await.expect("register succeeds");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(events.lock().unwrap().is_empty());
    }
}
