use std::time::Duration;

use envconfig::Envconfig;

/// Client-side tunables, loaded from the environment.
#[derive(Debug, Clone, Envconfig)]
pub struct ClientConfig {
    #[envconfig(from = "CLIENT_CONNECTION_TIMEOUT_SECS", default = "10")]
    pub connection_timeout_secs: u64,

    #[envconfig(from = "CLIENT_RETRY_COUNT", default = "3")]
    pub retry_count: u32,

    #[envconfig(from = "CLIENT_RETRY_INTERVAL_SECS", default = "2")]
    pub retry_interval_secs: u64,

    #[envconfig(from = "CLIENT_AUTO_CONNECT_TO_LEADER", default = "true")]
    pub auto_connect_to_leader: bool,

    #[envconfig(from = "CLIENT_AUTO_REGISTER_SERVICE", default = "true")]
    pub auto_register_service: bool,

    #[envconfig(from = "CLIENT_SERVICE_WATCH_INTERVAL_SECS", default = "5")]
    pub service_watch_interval_secs: u64,

    #[envconfig(from = "CLIENT_HEARTBEAT_INTERVAL_SECS", default = "30")]
    pub heartbeat_interval_secs: u64,

    /// Name of the coordinator's self-service, watched to add/remove
    /// connections as nodes join or leave the cluster.
    #[envconfig(from = "CLIENT_SELF_SERVICE_NAME", default = "aio-coordinator")]
    pub self_service_name: String,
}

impl ClientConfig {
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn service_watch_interval(&self) -> Duration {
        Duration::from_secs(self.service_watch_interval_secs)
    }
}

/// Debounce for `refresh_leader_info`'s self-triggered refresh. Distinct
/// from [`TOPOLOGY_SETTLE_DELAY`]: this one guards against refresh storms
/// from repeated local callers, the other waits for cluster metadata to
/// settle after a membership change.
pub const LEADER_REFRESH_DEBOUNCE: Duration = Duration::from_secs(3);

/// Delay after a topology change before leader identity is re-evaluated,
/// to let registration metadata settle.
pub const TOPOLOGY_SETTLE_DELAY: Duration = Duration::from_secs(5);
