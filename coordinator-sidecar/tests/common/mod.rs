use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use distributed_core::discovery::DiscoveryConfig;
use distributed_core::election::ElectionConfig;
use distributed_core::idgen::IdGenConfig;
use distributed_core::kv::{EtcdAdapter, KvConfig};
use distributed_core::lock::LockConfig;
use distributed_core::manager::{CoordinatorManager, ManagerConfig};
use distributed_transport::auth::AuthConfig;
use distributed_transport::handler::HandlerTable;
use distributed_transport::server;
use distributed_transport::Connection;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

pub fn test_name(case: &str) -> String {
    format!("{case}-{}", uuid::Uuid::new_v4())
}

/// Starts a real `CoordinatorManager` against `ETCD_ENDPOINT` (default
/// `http://localhost:2379`) plus a `distributed-transport` listener on an
/// OS-assigned port, wired with this crate's own [`coordinator_sidecar::handlers`]
/// table — the same composition `main.rs` builds, minus the axum health
/// surface this suite does not exercise.
pub struct RunningSidecar {
    pub addr: SocketAddr,
    pub manager: Arc<CoordinatorManager>,
    cancel: CancellationToken,
}

impl RunningSidecar {
    pub async fn stop(self) {
        self.cancel.cancel();
        self.manager.stop().await;
    }
}

pub async fn start_sidecar(election_prefix: String) -> RunningSidecar {
    let endpoint = std::env::var("ETCD_ENDPOINT").unwrap_or_else(|_| "http://localhost:2379".to_string());
    let kv = Arc::new(
        EtcdAdapter::connect(KvConfig {
            endpoints: vec![endpoint],
        })
        .await
        .expect("failed to connect to etcd"),
    );

    let manager_config = ManagerConfig {
        election: ElectionConfig {
            prefix: election_prefix,
            ttl: 5,
            retry_interval_ms: 200,
            watch_timeout_secs: 30,
            ip: None,
            cache_port: None,
            protocol_port: None,
            node_id: test_name("node"),
        },
        discovery: DiscoveryConfig::default(),
        lock: LockConfig::default(),
        idgen: IdGenConfig::default(),
    };

    let manager = CoordinatorManager::new(kv, manager_config);
    manager.start().await.expect("manager starts");

    let connections: coordinator_sidecar::handlers::ConnectionRegistry = Arc::new(RwLock::new(HashMap::new()));
    let table = Arc::new(HandlerTable::new());
    coordinator_sidecar::handlers::register_all(&table, Arc::clone(&manager), Arc::clone(&connections));

    // `server::listen` binds internally and never hands the bound address
    // back out, so the port is picked here instead of asking the OS for an
    // ephemeral one.
    let port = 20_000 + (uuid::Uuid::new_v4().as_u128() % 10_000) as u16;
    let addr: SocketAddr = format!("127.0.0.1:{port}").parse().expect("valid loopback addr");

    let cancel = CancellationToken::new();
    let serve_cancel = cancel.clone();
    let on_connect = move |conn: Arc<Connection>| {
        let connections = Arc::clone(&connections);
        let id = conn.id();
        tokio::spawn(async move {
            connections.write().await.insert(id, conn);
        });
    };
    tokio::spawn(async move {
        let _ = server::listen(
            addr,
            table,
            AuthConfig::default(),
            Duration::from_secs(30),
            None,
            on_connect,
            serve_cancel,
        )
        .await;
    });

    // Give the accept loop a moment to bind before the first dial attempt.
    tokio::time::sleep(Duration::from_millis(50)).await;

    RunningSidecar { addr, manager, cancel }
}

pub async fn dial(addr: SocketAddr) -> Arc<Connection> {
    server::dial(
        addr,
        Arc::new(HandlerTable::new()),
        &AuthConfig::default(),
        None,
        Duration::from_secs(30),
        None,
    )
    .await
    .expect("dial sidecar")
}
