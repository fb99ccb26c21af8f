//! Leader election.
//!
//! Per-name campaign built directly on [`crate::kv::KvStore`]'s session and
//! CAS primitives, the same way `assignment-coordination::leader_election`
//! builds leadership from a lease plus a CAS transaction rather than a
//! native etcd concurrency client. Generalized here to the full operation
//! set: secondary handlers, `Resign`, `GetLeader`, and a background driver
//! that survives session loss.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use envconfig::Envconfig;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::kv::{component_config_key, EventKind, KvEvent, Session, SharedKv};

#[derive(Debug, Clone, Envconfig)]
pub struct ElectionConfig {
    #[envconfig(from = "ELECTION_PREFIX", default = "aio/election")]
    pub prefix: String,

    #[envconfig(from = "ELECTION_TTL", default = "5")]
    pub ttl: i64,

    #[envconfig(from = "ELECTION_RETRY_INTERVAL_MS", default = "500")]
    pub retry_interval_ms: u64,

    #[envconfig(from = "ELECTION_WATCH_TIMEOUT_SECS", default = "30")]
    pub watch_timeout_secs: u64,

    pub ip: Option<String>,
    pub cache_port: Option<u16>,
    pub protocol_port: Option<u16>,

    #[envconfig(from = "NODE_ID")]
    pub node_id: String,
}

impl ElectionConfig {
    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    pub fn watch_timeout(&self) -> Duration {
        Duration::from_secs(self.watch_timeout_secs)
    }
}

/// Persisted at `/components/elections/{name}/config`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElectionMetadata {
    pub name: String,
    pub prefix: String,
    pub ttl: i64,
    pub node_id: String,
}

#[derive(Debug, Clone)]
pub struct ElectionInfo {
    pub node_id: String,
    pub ip: Option<String>,
    pub protocol_port: Option<u16>,
    pub cache_port: Option<u16>,
    pub last_event_at: Option<SystemTime>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ElectionEvent {
    BecomeLeader,
    BecomeFollower,
    LeaderChanged(String),
}

pub type ElectionHandlerId = u64;
type HandlerFn = Box<dyn Fn(ElectionEvent) + Send + Sync>;

/// One per election name.
pub struct Election {
    kv: SharedKv,
    name: String,
    config: ElectionConfig,
    is_leader: AtomicBool,
    info: RwLock<ElectionInfo>,
    handlers: RwLock<HashMap<ElectionHandlerId, HandlerFn>>,
    next_handler_id: AtomicU64,
    primary_handler: Mutex<Option<HandlerFn>>,
    session: Mutex<Option<Session>>,
    stop: CancellationToken,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl Election {
    fn leader_key(prefix: &str, name: &str) -> String {
        format!("/{prefix}/{name}/leader")
    }

    fn config_key(name: &str) -> String {
        component_config_key("elections", name)
    }

    /// Builds the in-memory object without touching any registry lock and
    /// without persisting metadata — used by [`crate::manager`] restoration
    /// so it never re-enters the service-level `RwLock` the public
    /// constructor takes.
    pub fn new_unlocked(kv: SharedKv, name: String, config: ElectionConfig) -> Arc<Self> {
        Arc::new(Self {
            kv,
            name,
            is_leader: AtomicBool::new(false),
            info: RwLock::new(ElectionInfo {
                node_id: config.node_id.clone(),
                ip: config.ip.clone(),
                protocol_port: config.protocol_port,
                cache_port: config.cache_port,
                last_event_at: None,
            }),
            config,
            handlers: RwLock::new(HashMap::new()),
            next_handler_id: AtomicU64::new(1),
            primary_handler: Mutex::new(None),
            session: Mutex::new(None),
            stop: CancellationToken::new(),
            driver: Mutex::new(None),
        })
    }

    /// `Create(name)`: persists election metadata, then builds the object.
    pub async fn create(kv: SharedKv, name: String, config: ElectionConfig) -> Result<Arc<Self>> {
        let metadata = ElectionMetadata {
            name: name.clone(),
            prefix: config.prefix.clone(),
            ttl: config.ttl,
            node_id: config.node_id.clone(),
        };
        kv.put(
            &Self::config_key(&name),
            serde_json::to_vec(&metadata)?,
            None,
        )
        .await?;
        Ok(Self::new_unlocked(kv, name, config))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::SeqCst)
    }

    pub async fn get_info(&self) -> ElectionInfo {
        self.info.read().await.clone()
    }

    pub async fn add_event_handler<F>(&self, handler: F) -> ElectionHandlerId
    where
        F: Fn(ElectionEvent) + Send + Sync + 'static,
    {
        let id = self.next_handler_id.fetch_add(1, Ordering::SeqCst);
        self.handlers.write().await.insert(id, Box::new(handler));
        id
    }

    pub async fn remove_event_handler(&self, id: ElectionHandlerId) {
        self.handlers.write().await.remove(&id);
    }

    /// `GetLeader`: absence returns `Ok(None)`, never an error.
    pub async fn get_leader(&self) -> Result<Option<String>> {
        let key = Self::leader_key(&self.config.prefix, &self.name);
        match self.kv.get(&key).await? {
            Some(bytes) => Ok(Some(String::from_utf8_lossy(&bytes).into_owned())),
            None => Ok(None),
        }
    }

    /// `Campaign`: opens a session, enters candidacy, returns immediately;
    /// the actual wait runs on the driver task.
    pub async fn campaign<F>(self: &Arc<Self>, primary_handler: F) -> Result<()>
    where
        F: Fn(ElectionEvent) + Send + Sync + 'static,
    {
        *self.primary_handler.lock().await = Some(Box::new(primary_handler));
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move { this.drive().await });
        *self.driver.lock().await = Some(handle);
        Ok(())
    }

    async fn dispatch(&self, event: ElectionEvent) {
        {
            let mut info = self.info.write().await;
            info.last_event_at = Some(SystemTime::now());
        }
        if let Some(primary) = self.primary_handler.lock().await.as_ref() {
            primary(event.clone());
        }
        for handler in self.handlers.read().await.values() {
            handler(event.clone());
        }
    }

    /// The driver loop: selects over (stop, session expiry via the
    /// keepalive task's own cancellation, watch stream on the leader key).
    async fn drive(self: Arc<Self>) {
        loop {
            if self.stop.is_cancelled() {
                return;
            }
            match self.try_campaign_once().await {
                Ok(()) => {}
                Err(e) if self.stop.is_cancelled() => {
                    tracing::debug!(name = %self.name, error = %e, "campaign stopped");
                    return;
                }
                Err(e) => {
                    tracing::warn!(name = %self.name, error = %e, "campaign attempt failed, retrying");
                }
            }
            tokio::select! {
                _ = self.stop.cancelled() => return,
                _ = tokio::time::sleep(self.config.retry_interval()) => {}
            }
        }
    }

    async fn try_campaign_once(self: &Arc<Self>) -> Result<()> {
        let session = self.kv.new_session(self.config.ttl).await?;
        let lease_id = session.lease_id();
        *self.session.lock().await = Some(session);

        let key = Self::leader_key(&self.config.prefix, &self.name);
        let value = self.config.node_id.clone().into_bytes();
        let acquired = self.kv.create_if_absent(&key, value, Some(lease_id)).await?;

        let was_leader = self.is_leader.swap(acquired, Ordering::SeqCst);
        if acquired && !was_leader {
            self.dispatch(ElectionEvent::BecomeLeader).await;
        } else if !acquired {
            match self.get_leader().await? {
                Some(leader) if leader == self.config.node_id => {}
                Some(leader) => self.dispatch(ElectionEvent::LeaderChanged(leader)).await,
                None => {}
            }
        }

        let prefix_key = format!("/{}/{}/", self.config.prefix, self.name);
        let mut stream = self.kv.watch(&prefix_key, true).await?;

        loop {
            tokio::select! {
                _ = self.stop.cancelled() => {
                    self.teardown_session().await;
                    return Ok(());
                }
                event = futures::StreamExt::next(&mut stream) => {
                    match event {
                        Some(Ok(ev)) => self.on_kv_event(ev).await?,
                        Some(Err(e)) => {
                            self.on_session_lost().await;
                            return Err(e);
                        }
                        None => {
                            self.on_session_lost().await;
                            return Err(Error::Unavailable("election watch stream closed".into()));
                        }
                    }
                }
            }
        }
    }

    async fn on_kv_event(self: &Arc<Self>, event: KvEvent) -> Result<()> {
        match event.kind {
            EventKind::Delete => {
                // The leader key expired or was resigned; recampaign.
                self.on_session_lost().await;
                Err(Error::LeadershipLost)
            }
            EventKind::Put => {
                let new_leader = String::from_utf8_lossy(&event.value).into_owned();
                if new_leader == self.config.node_id {
                    if !self.is_leader.swap(true, Ordering::SeqCst) {
                        self.dispatch(ElectionEvent::BecomeLeader).await;
                    }
                } else {
                    let was_leader = self.is_leader.swap(false, Ordering::SeqCst);
                    if was_leader {
                        self.dispatch(ElectionEvent::BecomeFollower).await;
                    } else {
                        self.dispatch(ElectionEvent::LeaderChanged(new_leader)).await;
                    }
                }
                Ok(())
            }
        }
    }

    async fn on_session_lost(self: &Arc<Self>) {
        let was_leader = self.is_leader.swap(false, Ordering::SeqCst);
        if was_leader {
            self.dispatch(ElectionEvent::BecomeFollower).await;
        }
        self.teardown_session().await;
    }

    async fn teardown_session(&self) {
        if let Some(mut session) = self.session.lock().await.take() {
            session.close().await;
        }
    }

    /// `Resign`: relinquishes leadership with up to 3 retries spaced 100ms
    /// apart; `is_leader` is forced false even on final failure.
    pub async fn resign(&self) -> Result<()> {
        if !self.is_leader() {
            return Ok(());
        }
        let key = Self::leader_key(&self.config.prefix, &self.name);
        let mut last_err = None;
        for attempt in 0..3 {
            match self.kv.delete(&key).await {
                Ok(()) => {
                    last_err = None;
                    break;
                }
                Err(e) => {
                    last_err = Some(e);
                    if attempt < 2 {
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        }
        self.is_leader.store(false, Ordering::SeqCst);
        self.teardown_session().await;
        match last_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Idempotent teardown: closes the session, deletes `/elections/{name}`
    /// keys this candidate owns, and clears handlers.
    pub async fn stop_internal(&self) {
        self.stop.cancel();
        if let Some(handle) = self.driver.lock().await.take() {
            let _ = handle.await;
        }
        self.teardown_session().await;
        self.handlers.write().await.clear();
        *self.primary_handler.lock().await = None;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    use super::*;
    use crate::test_support::FakeKv;

    fn config(node_id: &str) -> ElectionConfig {
        ElectionConfig {
            prefix: "aio/election".into(),
            ttl: 5,
            retry_interval_ms: 20,
            watch_timeout_secs: 30,
            ip: None,
            cache_port: None,
            protocol_port: None,
            node_id: node_id.to_string(),
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
    async fn solo_candidate_becomes_leader() {
        let kv = FakeKv::new();
        let election = Election::new_unlocked(kv, "default".into(), config("node-a"));
        election.campaign(|_| {}).await.expect("campaign starts");
        wait_until(|| election.is_leader()).await;
        assert_eq!(election.get_leader().await.unwrap().as_deref(), Some("node-a"));
        election.stop_internal().await;
    }

    #[tokio::test]
    async fn second_candidate_stays_follower_while_first_holds_leadership() {
        let kv = FakeKv::new();
        let a = Election::new_unlocked(kv.clone(), "default".into(), config("node-a"));
        let b = Election::new_unlocked(kv, "default".into(), config("node-b"));

        a.campaign(|_| {}).await.expect("a campaigns");
        wait_until(|| a.is_leader()).await;

        let events: Arc<StdMutex<Vec<ElectionEvent>>> = Arc::new(StdMutex::new(Vec::new()));
        let events_clone = Arc::clone(&events);
        b.campaign(move |e| events_clone.lock().unwrap().push(e))
            .await
            .expect("b campaigns");

        wait_until(|| !events.lock().unwrap().is_empty()).await;
        assert!(!b.is_leader());
        assert!(matches!(
            events.lock().unwrap().last(),
            Some(ElectionEvent::LeaderChanged(leader)) if leader == "node-a"
        ));

        a.stop_internal().await;
        b.stop_internal().await;
    }

    #[tokio::test]
    async fn resign_clears_leadership_and_lets_the_key_be_reclaimed() {
        let kv = FakeKv::new();
        let election = Election::new_unlocked(kv.clone(), "default".into(), config("node-a"));
        election.campaign(|_| {}).await.expect("campaign starts");
        wait_until(|| election.is_leader()).await;

        election.resign().await.expect("resign succeeds");
        assert!(!election.is_leader());
        assert!(election.get_leader().await.unwrap().is_none());
        election.stop_internal().await;
    }

    #[tokio::test]
    async fn session_loss_hands_leadership_to_the_surviving_candidate() {
        let kv = FakeKv::new();
        let a = Election::new_unlocked(kv.clone(), "default".into(), config("node-a"));
        let b = Election::new_unlocked(kv.clone(), "default".into(), config("node-b"));

        a.campaign(|_| {}).await.expect("a campaigns");
        wait_until(|| a.is_leader()).await;
        b.campaign(|_| {}).await.expect("b campaigns");
        wait_until(|| !b.is_leader()).await;

        let lease_id = a
            .session
            .lock()
            .await
            .as_ref()
            .expect("a holds a session while leader")
            .lease_id();
        kv.expire_lease(lease_id);

        wait_until(|| b.is_leader()).await;
        assert!(!a.is_leader());

        a.stop_internal().await;
        b.stop_internal().await;
    }
}
