//! Leader info cache: derived on demand from election state, never stored.

use std::time::Instant;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaderInfo {
    pub node_id: String,
    pub ip: Option<String>,
    pub protocol_port: Option<u16>,
    pub cache_port: Option<u16>,
}

#[derive(Debug, Clone)]
pub struct LeaderCache {
    pub info: Option<LeaderInfo>,
    pub last_observed_at: Option<Instant>,
}

impl Default for LeaderCache {
    fn default() -> Self {
        Self {
            info: None,
            last_observed_at: None,
        }
    }
}

impl LeaderCache {
    /// True if the cache was refreshed within the debounce window, so
    /// `GetLeaderInfo` can serve it without triggering a fan-out refresh.
    pub fn is_fresh(&self, debounce: std::time::Duration) -> bool {
        match self.last_observed_at {
            Some(t) => t.elapsed() < debounce,
            None => false,
        }
    }

    /// Updates the cache; returns `true` if the leader's node id changed
    /// (or this is the first observation), which callers use to decide
    /// whether to fire leader-change callbacks.
    pub fn update(&mut self, info: LeaderInfo) -> bool {
        let changed = self.info.as_ref().map(|cur| cur.node_id != info.node_id).unwrap_or(true);
        self.info = Some(info);
        self.last_observed_at = Some(Instant::now());
        changed
    }
}
