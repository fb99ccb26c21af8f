//! C7 — Coordinator Manager.
//!
//! Owns one registry per primitive (C2–C5; [`crate::discovery::Discovery`]
//! keeps its own lifecycle per spec section 4.7), starts them in dependency
//! order, restores persisted metadata from KV on boot, and stops them in
//! reverse. Restoration walks the `/components/{kind}/*/config` prefixes
//! directly and builds objects via each primitive's `new_unlocked`
//! constructor so it never re-enters the registry `RwLock` that a concurrent
//! `get_or_create_*` call on the same kind would take (spec section 5's
//! no-reentrancy rule).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use envconfig::Envconfig;
use tokio::sync::{oneshot, RwLock};

use crate::discovery::{Discovery, DiscoveryConfig};
use crate::election::{Election, ElectionConfig, ElectionEvent, ElectionMetadata};
use crate::error::Result;
use crate::idgen::{IdGen, IdGenConfig, IdGenMetadata};
use crate::kv::{component_prefix, SharedKv};
use crate::lock::{Lock, LockConfig, LockMetadata};
use crate::state::{StateManager, StateManagerConfig};

/// How long `Start` waits for the default election to settle into either
/// leader or follower before returning control to the caller (spec section
/// 4.7: "Start waits up to 120s for that signal before continuing").
const DEFAULT_ELECTION_SETTLE_TIMEOUT: Duration = Duration::from_secs(120);

/// Name under which the manager runs its own default campaign, distinct
/// from any application-named election a caller creates via
/// `get_or_create_election`.
const DEFAULT_ELECTION_NAME: &str = "default";

#[derive(Debug, Clone, Envconfig)]
pub struct ManagerConfig {
    #[envconfig(nested = true)]
    pub election: ElectionConfig,
    #[envconfig(nested = true)]
    pub discovery: DiscoveryConfig,
    #[envconfig(nested = true)]
    pub lock: LockConfig,
    #[envconfig(nested = true)]
    pub idgen: IdGenConfig,
}

/// Owns the per-kind registries for C2–C5 plus a standing [`Discovery`]
/// instance (spec section 4.7).
pub struct CoordinatorManager {
    kv: SharedKv,
    config: ManagerConfig,
    elections: RwLock<HashMap<String, Arc<Election>>>,
    locks: RwLock<HashMap<String, Arc<Lock>>>,
    idgens: RwLock<HashMap<String, Arc<IdGen>>>,
    states: RwLock<HashMap<String, Arc<StateManager>>>,
    discovery: Arc<Discovery>,
    default_election: RwLock<Option<Arc<Election>>>,
}

impl CoordinatorManager {
    pub fn new(kv: SharedKv, config: ManagerConfig) -> Arc<Self> {
        let discovery = Discovery::new(kv.clone(), config.discovery.clone());
        Arc::new(Self {
            kv,
            config,
            elections: RwLock::new(HashMap::new()),
            locks: RwLock::new(HashMap::new()),
            idgens: RwLock::new(HashMap::new()),
            states: RwLock::new(HashMap::new()),
            discovery,
            default_election: RwLock::new(None),
        })
    }

    pub fn discovery(&self) -> Arc<Discovery> {
        Arc::clone(&self.discovery)
    }

    /// Ordered start: Election, Lock, IDGen, StateManager (Discovery lives
    /// in its own lifecycle, spec section 4.7). Restores each primitive's
    /// persisted metadata from KV, then drives the manager's own default
    /// campaign, waiting up to [`DEFAULT_ELECTION_SETTLE_TIMEOUT`] for it
    /// to settle before returning — the service remains functional even if
    /// the election is still in progress after that deadline.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        self.restore_elections().await?;
        self.restore_locks().await?;
        self.restore_idgens().await?;
        self.restore_states().await?;

        let default_election = self
            .get_or_create_election(DEFAULT_ELECTION_NAME.to_string())
            .await?;
        *self.default_election.write().await = Some(Arc::clone(&default_election));

        let (tx, rx) = oneshot::channel();
        let tx = std::sync::Mutex::new(Some(tx));
        default_election
            .campaign(move |event| {
                if matches!(
                    event,
                    ElectionEvent::BecomeLeader | ElectionEvent::BecomeFollower
                ) {
                    if let Some(tx) = tx.lock().unwrap().take() {
                        let _ = tx.send(event);
                    }
                }
            })
            .await?;

        match tokio::time::timeout(DEFAULT_ELECTION_SETTLE_TIMEOUT, rx).await {
            Ok(Ok(event)) => {
                tracing::info!(?event, "default election settled");
            }
            Ok(Err(_)) => {
                tracing::warn!("default election handler channel dropped before settling");
            }
            Err(_) => {
                tracing::warn!(
                    timeout_secs = DEFAULT_ELECTION_SETTLE_TIMEOUT.as_secs(),
                    "default election still in progress, continuing startup anyway"
                );
            }
        }
        Ok(())
    }

    /// Stops every primitive in reverse start order. Individual stop
    /// errors are logged but do not abort the sweep (spec section 4.7).
    pub async fn stop(&self) {
        for (name, state) in self.states.write().await.drain() {
            tracing::debug!(name, "stopping state manager");
            state.stop_all_watchers().await;
        }
        for (name, idgen) in self.idgens.write().await.drain() {
            tracing::debug!(name, remaining = idgen.remaining_in_buffer().await, "stopping idgen");
        }
        for (key, lock) in self.locks.write().await.drain() {
            if let Err(e) = lock.unlock().await {
                tracing::warn!(key, error = %e, "error releasing lock during shutdown");
            }
        }
        for (name, election) in self.elections.write().await.drain() {
            election.stop_internal().await;
            tracing::debug!(name, "stopped election");
        }
        *self.default_election.write().await = None;
    }

    // ── Election registry ───────────────────────────────────────

    pub async fn get_or_create_election(&self, name: String) -> Result<Arc<Election>> {
        if let Some(existing) = self.elections.read().await.get(&name) {
            return Ok(Arc::clone(existing));
        }
        let mut guard = self.elections.write().await;
        if let Some(existing) = guard.get(&name) {
            return Ok(Arc::clone(existing));
        }
        let election = Election::create(self.kv.clone(), name.clone(), self.config.election.clone()).await?;
        guard.insert(name, Arc::clone(&election));
        Ok(election)
    }

    async fn restore_elections(&self) -> Result<()> {
        let entries = self.kv.get_prefix(&component_prefix("elections")).await?;
        let mut guard = self.elections.write().await;
        for (key, value) in entries {
            let Some(name) = config_name(&key, "elections") else { continue };
            let metadata: ElectionMetadata = match serde_json::from_slice(&value) {
                Ok(m) => m,
                Err(e) => {
                    tracing::warn!(key, error = %e, "skipping malformed election metadata");
                    continue;
                }
            };
            let mut config = self.config.election.clone();
            config.prefix = metadata.prefix;
            config.ttl = metadata.ttl;
            let election = Election::new_unlocked(self.kv.clone(), name.clone(), config);
            guard.insert(name, election);
        }
        Ok(())
    }

    // ── Lock registry ───────────────────────────────────────────

    pub async fn get_or_create_lock(&self, key: String) -> Result<Arc<Lock>> {
        if let Some(existing) = self.locks.read().await.get(&key) {
            return Ok(Arc::clone(existing));
        }
        let mut guard = self.locks.write().await;
        if let Some(existing) = guard.get(&key) {
            return Ok(Arc::clone(existing));
        }
        let lock = Arc::new(Lock::create(self.kv.clone(), key.clone(), self.config.lock.clone()).await?);
        guard.insert(key, Arc::clone(&lock));
        Ok(lock)
    }

    async fn restore_locks(&self) -> Result<()> {
        let entries = self.kv.get_prefix(&component_prefix("locks")).await?;
        let mut guard = self.locks.write().await;
        for (key, value) in entries {
            let Some(name) = config_name(&key, "locks") else { continue };
            let metadata: LockMetadata = match serde_json::from_slice(&value) {
                Ok(m) => m,
                Err(e) => {
                    tracing::warn!(key, error = %e, "skipping malformed lock metadata");
                    continue;
                }
            };
            let config = LockConfig {
                ttl: metadata.ttl,
                max_retries: metadata.max_retries,
            };
            let lock = Arc::new(Lock::new_unlocked(self.kv.clone(), name.clone(), config));
            guard.insert(name, lock);
        }
        Ok(())
    }

    // ── IDGen registry ───────────────────────────────────────────

    pub async fn get_or_create_idgen(&self, name: String) -> Result<Arc<IdGen>> {
        if let Some(existing) = self.idgens.read().await.get(&name) {
            return Ok(Arc::clone(existing));
        }
        let mut guard = self.idgens.write().await;
        if let Some(existing) = guard.get(&name) {
            return Ok(Arc::clone(existing));
        }
        let idgen = IdGen::create(self.kv.clone(), name.clone(), self.config.idgen.clone()).await?;
        guard.insert(name, Arc::clone(&idgen));
        Ok(idgen)
    }

    async fn restore_idgens(&self) -> Result<()> {
        let entries = self.kv.get_prefix(&component_prefix("idgens")).await?;
        let mut guard = self.idgens.write().await;
        for (key, value) in entries {
            // `/components/idgens/{name}/config` and `/{name}/state` share a
            // prefix; only restore objects from the `config` entries, the
            // `state` entries are read lazily on first claim.
            let Some(name) = config_name(&key, "idgens") else { continue };
            let metadata: IdGenMetadata = match serde_json::from_slice(&value) {
                Ok(m) => m,
                Err(e) => {
                    tracing::warn!(key, error = %e, "skipping malformed idgen metadata");
                    continue;
                }
            };
            let config = IdGenConfig {
                step: metadata.step,
                start_id: self.config.idgen.start_id,
            };
            let idgen = IdGen::new_unlocked(self.kv.clone(), name.clone(), config);
            guard.insert(name, idgen);
        }
        Ok(())
    }

    // ── StateManager registry ───────────────────────────────────

    pub async fn get_or_create_state_manager(&self, prefix: String) -> Result<Arc<StateManager>> {
        if let Some(existing) = self.states.read().await.get(&prefix) {
            return Ok(Arc::clone(existing));
        }
        let mut guard = self.states.write().await;
        if let Some(existing) = guard.get(&prefix) {
            return Ok(Arc::clone(existing));
        }
        let manager =
            StateManager::create(self.kv.clone(), prefix.clone(), self.config.idgen_state_default()).await?;
        guard.insert(prefix, Arc::clone(&manager));
        Ok(manager)
    }

    async fn restore_states(&self) -> Result<()> {
        let entries = self.kv.get_prefix(&component_prefix("states")).await?;
        let mut guard = self.states.write().await;
        for (key, value) in entries {
            let Some(prefix) = config_name(&key, "states") else { continue };
            let ttl: i64 = match serde_json::from_slice(&value) {
                Ok(t) => t,
                Err(e) => {
                    tracing::warn!(key, error = %e, "skipping malformed state manager metadata");
                    continue;
                }
            };
            let manager =
                StateManager::new_unlocked(self.kv.clone(), prefix.clone(), StateManagerConfig { ttl });
            guard.insert(prefix, manager);
        }
        Ok(())
    }
}

impl ManagerConfig {
    /// `StateManager` instances created ad hoc through
    /// `get_or_create_state_manager` default to no lease TTL, matching spec
    /// section 6's per-instance default; callers that need a TTL build
    /// their own `StateManager` via `StateManager::create` directly.
    fn idgen_state_default(&self) -> StateManagerConfig {
        StateManagerConfig::default()
    }
}

/// Extracts `{name}` from a `/components/{kind}/{name}/config` key.
fn config_name(key: &str, kind: &str) -> Option<String> {
    let prefix = component_prefix(kind);
    let rest = key.strip_prefix(&prefix)?;
    let name = rest.strip_suffix("/config")?;
    if name.is_empty() {
        None
    } else {
        Some(name.to_string())
    }
}
