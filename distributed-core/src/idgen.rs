//! Monotonic ID allocation.
//!
//! Per-name monotonic allocator. A bare CAS-placeholder protocol does not by
//! itself prevent two nodes from computing overlapping `H' = max(H,
//! local_current)`, so every range claim is serialized by holding a
//! [`crate::lock::Lock`] named after the allocator for the claim's
//! duration.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use envconfig::Envconfig;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::{Error, Result};
use crate::kv::{component_config_key, component_state_key, SharedKv};
use crate::lock::{Lock, LockConfig};

#[derive(Debug, Clone, Envconfig)]
pub struct IdGenConfig {
    #[envconfig(from = "IDGEN_STEP", default = "1000")]
    pub step: u64,

    #[envconfig(from = "IDGEN_START_ID", default = "0")]
    pub start_id: u64,
}

impl Default for IdGenConfig {
    fn default() -> Self {
        Self {
            step: 1000,
            start_id: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdGenMetadata {
    pub name: String,
    pub step: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IdGenState {
    #[serde(rename = "currentID")]
    current_id: u64,
    #[serde(rename = "updateTime")]
    update_time: i64,
}

struct Buffer {
    /// Next unused id in the reserved range.
    current: u64,
    /// One past the last id of the reserved range.
    limit: u64,
}

impl Buffer {
    fn empty() -> Self {
        Self {
            current: 0,
            limit: 0,
        }
    }

    fn remaining(&self) -> u64 {
        self.limit.saturating_sub(self.current)
    }

    fn take(&mut self) -> Option<u64> {
        if self.current < self.limit {
            let id = self.current;
            self.current += 1;
            Some(id)
        } else {
            None
        }
    }
}

/// One per allocator name.
pub struct IdGen {
    kv: SharedKv,
    name: String,
    config: IdGenConfig,
    claim_lock: Lock,
    buffer: Mutex<Buffer>,
}

impl IdGen {
    fn config_key(name: &str) -> String {
        component_config_key("idgens", name)
    }

    fn state_key(name: &str) -> String {
        component_state_key("idgens", name)
    }

    pub fn new_unlocked(kv: SharedKv, name: String, config: IdGenConfig) -> Arc<Self> {
        let claim_lock = Lock::new_unlocked(
            kv.clone(),
            format!("idgen-claim-{name}"),
            LockConfig::default(),
        );
        Arc::new(Self {
            kv,
            name,
            config,
            claim_lock,
            buffer: Mutex::new(Buffer::empty()),
        })
    }

    pub async fn create(kv: SharedKv, name: String, config: IdGenConfig) -> Result<Arc<Self>> {
        let metadata = IdGenMetadata {
            name: name.clone(),
            step: config.step,
        };
        kv.put(&Self::config_key(&name), serde_json::to_vec(&metadata)?, None)
            .await?;
        Ok(Self::new_unlocked(kv, name, config))
    }

    /// `NextID`: serves from the local buffer, claiming a fresh range on
    /// exhaustion.
    pub async fn next_id(&self) -> Result<u64> {
        let mut guard = self.buffer.lock().await;
        if let Some(id) = guard.take() {
            return Ok(id);
        }
        self.claim_range(&mut guard).await?;
        guard
            .take()
            .ok_or_else(|| Error::Internal("range claim returned an empty range".into()))
    }

    /// `BatchNextID`: drains the buffer then repeats range claims until
    /// `count` ids are assembled. A failed claim after at least one id was
    /// already handed out yields a partial batch, not an error.
    pub async fn batch_next_id(&self, count: u64) -> Result<Vec<u64>> {
        let mut out = Vec::with_capacity(count as usize);
        let mut guard = self.buffer.lock().await;
        while (out.len() as u64) < count {
            if let Some(id) = guard.take() {
                out.push(id);
                continue;
            }
            match self.claim_range(&mut guard).await {
                Ok(()) => continue,
                Err(e) if !out.is_empty() => {
                    tracing::warn!(name = %self.name, error = %e, "range claim failed mid-batch, returning partial batch");
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(out)
    }

    /// Range-claim algorithm, serialized by `claim_lock` so concurrent
    /// claimers never compute overlapping ranges.
    async fn claim_range(&self, buffer: &mut Buffer) -> Result<()> {
        self.claim_lock
            .lock()
            .await
            .map_err(|e| Error::Unavailable(format!("could not serialize id range claim: {e}")))?;
        let result = self.claim_range_locked(buffer).await;
        // Best-effort: unlock regardless of claim outcome so other nodes
        // are not starved by a failed claim.
        let _ = self.claim_lock.unlock().await;
        result
    }

    async fn claim_range_locked(&self, buffer: &mut Buffer) -> Result<()> {
        let state_key = Self::state_key(&self.name);

        // Step 1: placeholder swap to detect concurrent claimers; correctness
        // comes from the serializing lock above, not from this placeholder
        // by itself.
        let placeholder = Vec::new();
        // A claim that crashed after this placeholder write but before step
        // 4's final blob leaves an empty, un-decodable value behind. That
        // must abort this claim rather than decode as `current_id: 0` --
        // silently rewinding the high-water mark would let previously
        // issued ids be handed out again (spec section 3's IDGen
        // invariant).
        let existing: Option<IdGenState> = self
            .kv
            .get(&state_key)
            .await?
            .map(|bytes| serde_json::from_slice(&bytes))
            .transpose()?;
        self.kv.put(&state_key, placeholder, None).await?;

        // Step 2-3: compute the new range.
        let prior_high_water = existing.map(|s| s.current_id).unwrap_or(self.config.start_id);
        let local_current = buffer.limit;
        let new_low = prior_high_water.max(local_current);
        let new_high = new_low + self.config.step;

        if new_high == new_low {
            return Err(Error::Internal(format!(
                "range claim for {} produced an empty range",
                self.name
            )));
        }

        // Step 4: persist the final high-water mark.
        let state = IdGenState {
            current_id: new_high,
            update_time: now_unix(),
        };
        self.kv
            .put(&state_key, serde_json::to_vec(&state)?, None)
            .await?;

        buffer.current = new_low;
        buffer.limit = new_high;
        Ok(())
    }

    /// Current in-memory high-water mark, for observability only.
    pub async fn remaining_in_buffer(&self) -> u64 {
        self.buffer.lock().await.remaining()
    }
}

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::test_support::FakeKv;

    fn small_step_config() -> IdGenConfig {
        IdGenConfig {
            step: 4,
            start_id: 0,
        }
    }

    #[tokio::test]
    async fn next_id_is_monotonic_within_one_allocator() {
        let kv = FakeKv::new();
        let gen = IdGen::new_unlocked(kv, "orders".into(), small_step_config());
        let mut prev = gen.next_id().await.expect("first id");
        for _ in 0..15 {
            let id = gen.next_id().await.expect("subsequent id");
            assert!(id > prev, "ids must strictly increase, got {id} after {prev}");
            prev = id;
        }
    }

    #[tokio::test]
    async fn batch_next_id_never_overlaps_across_allocators_sharing_a_store() {
        let kv = FakeKv::new();
        let a = IdGen::new_unlocked(kv.clone(), "orders".into(), small_step_config());
        let b = IdGen::new_unlocked(kv, "orders".into(), small_step_config());

        let batch_a = a.batch_next_id(10).await.expect("batch a");
        let batch_b = b.batch_next_id(10).await.expect("batch b");

        let set_a: HashSet<u64> = batch_a.into_iter().collect();
        let set_b: HashSet<u64> = batch_b.into_iter().collect();
        assert!(set_a.is_disjoint(&set_b), "two allocators for the same name must never hand out the same id");
    }

    #[tokio::test]
    async fn batch_next_id_returns_exact_count_when_store_is_healthy() {
        let kv = FakeKv::new();
        let gen = IdGen::new_unlocked(kv, "orders".into(), small_step_config());
        let batch = gen.batch_next_id(9).await.expect("batch");
        assert_eq!(batch.len(), 9);
        let unique: HashSet<u64> = batch.iter().copied().collect();
        assert_eq!(unique.len(), 9, "batch must not contain duplicate ids");
    }

    #[tokio::test]
    async fn claim_aborts_instead_of_rewinding_on_an_undecodable_state_blob() {
        let kv = FakeKv::new();
        // Simulate a claim that crashed between step 1 (placeholder write)
        // and step 4 (final blob write): the state key exists but holds the
        // empty placeholder, not valid `IdGenState` JSON.
        kv.put(&component_state_key("idgens", "orders"), Vec::new(), None)
            .await
            .expect("seed placeholder");

        let gen = IdGen::new_unlocked(kv, "orders".into(), small_step_config());
        let err = gen.next_id().await.expect_err("ambiguous state must abort the claim");
        assert!(
            matches!(err, Error::Serialization(_)),
            "expected a decode error, got {err:?}"
        );
        assert_eq!(
            gen.remaining_in_buffer().await,
            0,
            "a failed claim must not populate the buffer with ids from a rewound range"
        );
    }
}
