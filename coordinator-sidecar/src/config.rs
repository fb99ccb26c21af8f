//! Environment configuration, split the way `cyclotron-fetch::config` splits
//! its raw envconfig struct into domain-specific pieces via `to_components`.

use std::net::SocketAddr;
use std::time::Duration;

use distributed_core::kv::KvConfig;
use distributed_core::manager::ManagerConfig;
use distributed_transport::auth::AuthConfig;
use envconfig::Envconfig;

#[derive(Debug, Envconfig)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub bind_host: String,

    #[envconfig(from = "BIND_PORT", default = "7420")]
    pub bind_port: u16,

    #[envconfig(from = "METRICS_BIND_HOST", default = "0.0.0.0")]
    pub metrics_bind_host: String,

    #[envconfig(from = "METRICS_BIND_PORT", default = "7421")]
    pub metrics_bind_port: u16,

    /// Comma-separated list of etcd endpoints.
    #[envconfig(from = "KV_ENDPOINTS", default = "http://127.0.0.1:2379")]
    pub kv_endpoints: String,

    #[envconfig(from = "AUTH_ENABLED", default = "false")]
    pub auth_enabled: bool,

    #[envconfig(from = "AUTH_SHARED_SECRET")]
    pub auth_shared_secret: Option<String>,

    #[envconfig(from = "HEARTBEAT_INTERVAL_SECS", default = "30")]
    pub heartbeat_interval_secs: u64,

    #[envconfig(nested = true)]
    pub manager: ManagerConfig,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind: SocketAddr,
    pub metrics_bind: SocketAddr,
    pub auth: AuthConfig,
    pub heartbeat_interval: Duration,
}

impl Config {
    pub fn to_components(self) -> (AppConfig, KvConfig, ManagerConfig) {
        let bind = SocketAddr::new(
            self.bind_host.parse().unwrap_or_else(|_| "0.0.0.0".parse().unwrap()),
            self.bind_port,
        );
        let metrics_bind = SocketAddr::new(
            self.metrics_bind_host
                .parse()
                .unwrap_or_else(|_| "0.0.0.0".parse().unwrap()),
            self.metrics_bind_port,
        );
        let app_config = AppConfig {
            bind,
            metrics_bind,
            auth: AuthConfig {
                enabled: self.auth_enabled,
                shared_secret: self.auth_shared_secret,
            },
            heartbeat_interval: Duration::from_secs(self.heartbeat_interval_secs),
        };
        let kv_config = KvConfig {
            endpoints: self
                .kv_endpoints
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
        };
        (app_config, kv_config, self.manager)
    }
}
