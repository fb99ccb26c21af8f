//! Service/message type constants and the response envelope (spec section
//! 6 "Wire frames" / "Response envelope").

use serde::{Deserialize, Serialize};

pub mod service_type {
    pub const SYSTEM: u16 = 1;
    pub const ELECTION: u16 = 2;
    pub const DISCOVERY: u16 = 3;
}

pub mod system_message {
    pub const AUTH_REQUEST: u16 = 1;
    pub const AUTH_RESPONSE: u16 = 2;
    pub const HEARTBEAT: u16 = 3;
    pub const TOKEN_REFRESH: u16 = 4;
    pub const TOKEN_REFRESH_RESPONSE: u16 = 5;
}

pub mod election_message {
    pub const GET_LEADER: u16 = 1;
    pub const LEADER_RESPONSE: u16 = 2;
    pub const LEADER_NOTIFY: u16 = 3;
}

pub mod discovery_message {
    pub const DISCOVER_SERVICE: u16 = 1;
    pub const SERVICE_RESPONSE: u16 = 2;
    pub const WATCH_SERVICE: u16 = 3;
    pub const SERVICE_EVENT: u16 = 4;
    pub const UNWATCH_SERVICE: u16 = 5;
    pub const REGISTER_SERVICE: u16 = 6;
    pub const DEREGISTER_SERVICE: u16 = 7;
}

/// `{success, type, message?, error?, data?}` (spec section 6). When
/// `data` carries a structured payload it is itself a JSON string —
/// recipients dispatch on `type` before decoding `data` a second time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub success: bool,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

impl ResponseEnvelope {
    pub fn ok(kind: impl Into<String>) -> Self {
        Self {
            success: true,
            kind: kind.into(),
            message: None,
            error: None,
            data: None,
        }
    }

    pub fn ok_with_data<T: Serialize>(kind: impl Into<String>, data: &T) -> serde_json::Result<Self> {
        Ok(Self {
            success: true,
            kind: kind.into(),
            message: None,
            error: None,
            data: Some(serde_json::to_string(data)?),
        })
    }

    pub fn err(kind: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            success: false,
            kind: kind.into(),
            message: None,
            error: Some(error.into()),
            data: None,
        }
    }

    pub fn decode_data<T: for<'de> Deserialize<'de>>(&self) -> Option<serde_json::Result<T>> {
        self.data.as_deref().map(serde_json::from_str)
    }
}
