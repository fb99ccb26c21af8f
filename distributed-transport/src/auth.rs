//! Auth handshake (spec section 4.8): when enabled, the first exchange on
//! a new connection is a credential submission followed by a token
//! response; subsequent frames carry the token implicitly via the
//! connection's session state, so it is never attached to every frame.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Nominal token lifetime (spec section 4.8).
pub const TOKEN_LIFETIME: Duration = Duration::from_secs(48 * 3600);

/// Refresh cadence: chosen an hour inside the lifetime so a refresh
/// round-trip failure leaves a full hour of slack before the token
/// actually expires (spec section 4.8: "refreshes at 47-hour intervals").
pub const TOKEN_REFRESH_INTERVAL: Duration = Duration::from_secs(47 * 3600);

/// How often the client-side refresh task wakes up to check
/// `Session::needs_refresh` against the wall clock. Cheap relative to the
/// 47h refresh cadence, so a short poll interval costs nothing and keeps
/// the task's actual refresh latency bounded instead of drifting with a
/// single long sleep computed from `issued_at`.
pub const TOKEN_REFRESH_CHECK_INTERVAL: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Default)]
pub struct AuthConfig {
    pub enabled: bool,
    pub shared_secret: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credentials {
    pub node_id: String,
    pub secret: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenPayload {
    pub token: String,
}

/// Session-local auth state kept per connection once the handshake
/// completes; never re-sent on every frame.
#[derive(Debug, Clone)]
pub struct Session {
    pub token: String,
    pub issued_at: Instant,
}

impl Session {
    pub fn new(token: String) -> Self {
        Self {
            token,
            issued_at: Instant::now(),
        }
    }

    pub fn needs_refresh(&self) -> bool {
        self.issued_at.elapsed() >= TOKEN_REFRESH_INTERVAL
    }

    pub fn is_expired(&self) -> bool {
        self.issued_at.elapsed() >= TOKEN_LIFETIME
    }
}

/// Server-side credential check. A real deployment wires this to whatever
/// credential issuance system owns secrets (spec section 1: "Out of
/// scope... credential issuance"); this crate only verifies the shared
/// secret configured locally and mints an opaque token.
pub fn verify(config: &AuthConfig, credentials: &Credentials) -> Option<String> {
    if !config.enabled {
        return Some(String::new());
    }
    let expected = config.shared_secret.as_deref()?;
    if credentials.secret == expected {
        Some(uuid::Uuid::new_v4().to_string())
    } else {
        None
    }
}

/// Mints a replacement token for an already-authenticated connection. The
/// periodic refresh exchange re-proves nothing beyond "this connection
/// still holds the token it was issued" (checked by the caller against the
/// connection's current session) — it exists to bound token lifetime, not
/// to re-run credential verification.
pub fn mint_refreshed_token() -> String {
    uuid::Uuid::new_v4().to_string()
}
