//! Distributed mutual exclusion.
//!
//! Named mutual exclusion built on the same CAS-create-if-absent primitive
//! as [`crate::election`], with lease TTL and bounded exponential backoff
//! instead of a driver loop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use envconfig::Envconfig;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::{Error, Result};
use crate::kv::{component_config_key, Session, SharedKv};

#[derive(Debug, Clone, Envconfig)]
pub struct LockConfig {
    #[envconfig(from = "LOCK_TTL", default = "30")]
    pub ttl: i64,

    #[envconfig(from = "LOCK_MAX_RETRIES", default = "3")]
    pub max_retries: u32,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            ttl: 30,
            max_retries: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockMetadata {
    pub key: String,
    pub ttl: i64,
    pub max_retries: u32,
}

/// One per lock key.
pub struct Lock {
    kv: SharedKv,
    key: String,
    config: LockConfig,
    is_locked: AtomicBool,
    session: Mutex<Option<Session>>,
}

#[derive(Debug, thiserror::Error)]
#[error("failed to acquire lock {key:?} after {attempts} attempt(s): {source}")]
pub struct AcquireError {
    pub key: String,
    pub attempts: u32,
    #[source]
    pub source: Error,
}

impl Lock {
    fn mutex_key(key: &str) -> String {
        format!("/distributed/locks/{key}/mutex")
    }

    fn config_key(key: &str) -> String {
        component_config_key("locks", key)
    }

    pub fn new_unlocked(kv: SharedKv, key: String, config: LockConfig) -> Self {
        Self {
            kv,
            key,
            config,
            is_locked: AtomicBool::new(false),
            session: Mutex::new(None),
        }
    }

    pub async fn create(kv: SharedKv, key: String, config: LockConfig) -> Result<Self> {
        let metadata = LockMetadata {
            key: key.clone(),
            ttl: config.ttl,
            max_retries: config.max_retries,
        };
        kv.put(&Self::config_key(&key), serde_json::to_vec(&metadata)?, None)
            .await?;
        Ok(Self::new_unlocked(kv, key, config))
    }

    pub fn is_locked(&self) -> bool {
        self.is_locked.load(Ordering::SeqCst)
    }

    async fn try_acquire_once(&self) -> Result<bool> {
        let session = self.kv.new_session(self.config.ttl).await?;
        let lease_id = session.lease_id();
        let key = Self::mutex_key(&self.key);
        let acquired = self
            .kv
            .create_if_absent(&key, b"locked".to_vec(), Some(lease_id))
            .await?;
        if acquired {
            *self.session.lock().await = Some(session);
        } else {
            let mut s = session;
            s.close().await;
        }
        Ok(acquired)
    }

    /// `Lock`: blocks with exponential backoff (500ms * attempt, capped by
    /// `max_retries`). Re-entering while already locked is a no-op.
    pub async fn lock(&self) -> std::result::Result<(), AcquireError> {
        if self.is_locked() {
            return Ok(());
        }
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.try_acquire_once().await {
                Ok(true) => {
                    self.is_locked.store(true, Ordering::SeqCst);
                    return Ok(());
                }
                Ok(false) => {
                    if attempt >= self.config.max_retries {
                        return Err(AcquireError {
                            key: self.key.clone(),
                            attempts: attempt,
                            source: Error::Unavailable("lock held by another owner".into()),
                        });
                    }
                    tokio::time::sleep(Duration::from_millis(500 * attempt as u64)).await;
                }
                Err(e) => {
                    if attempt >= self.config.max_retries {
                        return Err(AcquireError {
                            key: self.key.clone(),
                            attempts: attempt,
                            source: e,
                        });
                    }
                    tokio::time::sleep(Duration::from_millis(500 * attempt as u64)).await;
                }
            }
        }
    }

    /// `TryLock`: a single attempt under a 100ms internal deadline.
    /// Deadline-exceeded maps to `Ok(false)`, never an error.
    pub async fn try_lock(&self) -> Result<bool> {
        if self.is_locked() {
            return Ok(true);
        }
        match tokio::time::timeout(Duration::from_millis(100), self.try_acquire_once()).await {
            Ok(Ok(true)) => {
                self.is_locked.store(true, Ordering::SeqCst);
                Ok(true)
            }
            Ok(Ok(false)) => Ok(false),
            Ok(Err(e)) => Err(e),
            Err(_elapsed) => Ok(false),
        }
    }

    /// `Unlock`: releases the mutex then closes the session. After a
    /// successful unlock, session/mutex handles are cleared; a subsequent
    /// `Lock` creates a fresh session.
    pub async fn unlock(&self) -> Result<()> {
        if let Some(mut session) = self.session.lock().await.take() {
            let key = Self::mutex_key(&self.key);
            self.kv.delete(&key).await?;
            session.close().await;
        }
        self.is_locked.store(false, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FakeKv;

    #[tokio::test]
    async fn lock_then_try_lock_from_another_handle_fails() {
        let kv = FakeKv::new();
        let a = Lock::new_unlocked(kv.clone(), "res".into(), LockConfig::default());
        let b = Lock::new_unlocked(kv, "res".into(), LockConfig::default());

        a.lock().await.expect("first lock acquires");
        assert!(a.is_locked());
        assert!(!b.try_lock().await.expect("try_lock does not error"));
        assert!(!b.is_locked());
    }

    #[tokio::test]
    async fn unlock_releases_mutex_for_next_owner() {
        let kv = FakeKv::new();
        let a = Lock::new_unlocked(kv.clone(), "res".into(), LockConfig::default());
        let b = Lock::new_unlocked(kv, "res".into(), LockConfig::default());

        a.lock().await.expect("first lock acquires");
        a.unlock().await.expect("unlock succeeds");
        assert!(!a.is_locked());

        assert!(b.try_lock().await.expect("try_lock does not error"));
        assert!(b.is_locked());
    }

    #[tokio::test]
    async fn relocking_an_already_held_lock_is_a_no_op() {
        let kv = FakeKv::new();
        let a = Lock::new_unlocked(kv, "res".into(), LockConfig::default());
        a.lock().await.expect("first lock acquires");
        a.lock().await.expect("relock on self is a no-op");
        assert!(a.is_locked());
    }
}
