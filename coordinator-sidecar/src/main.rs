use std::collections::HashMap;
use std::future::ready;
use std::sync::Arc;

use axum::{extract::State, routing::get, Router};
use common_metrics::setup_metrics_routes;
use coordinator_sidecar::config::Config;
use coordinator_sidecar::handlers;
use distributed_core::kv::EtcdAdapter;
use distributed_core::manager::CoordinatorManager;
use distributed_transport::handler::HandlerTable;
use distributed_transport::heartbeat::HeartbeatCallback;
use distributed_transport::server;
use envconfig::Envconfig;
use health::HealthRegistry;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Clone)]
struct ServiceName(String);

fn app(liveness: HealthRegistry, name: String) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route("/_liveness", get(move || ready(liveness.get_status())))
        .with_state(ServiceName(name))
}

async fn index(State(name): State<ServiceName>) -> String {
    format!("coordinator-sidecar {}", name.0)
}

async fn serve_health(app: Router, bind: std::net::SocketAddr) -> Result<(), std::io::Error> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    axum::serve(listener, app).await
}

#[tokio::main]
async fn main() {
    let config = Config::init_from_env().expect("failed to load configuration from env");
    tracing_subscriber::fmt::init();

    let (app_config, kv_config, manager_config) = config.to_components();

    info!(bind = %app_config.bind, "coordinator-sidecar starting");

    let liveness = HealthRegistry::new("liveness");
    let listener_liveness = liveness
        .register("listener".to_string(), std::time::Duration::from_secs(60))
        .await;

    let kv = Arc::new(
        EtcdAdapter::connect(kv_config)
            .await
            .expect("failed to connect to etcd"),
    );
    let manager = CoordinatorManager::new(kv, manager_config);
    manager.start().await.expect("failed to start coordinator manager");

    let connections: handlers::ConnectionRegistry = Arc::new(RwLock::new(HashMap::new()));

    let table = Arc::new(HandlerTable::new());
    handlers::register_all(&table, Arc::clone(&manager), Arc::clone(&connections));

    let on_connect_registry = Arc::clone(&connections);
    let on_connect = move |conn: Arc<distributed_transport::Connection>| {
        let connections = Arc::clone(&on_connect_registry);
        let id = conn.id();
        tokio::spawn(async move {
            connections.write().await.insert(id, conn);
        });
    };

    let gc_registry = Arc::clone(&connections);
    let heartbeat_cb: HeartbeatCallback = Arc::new(move |conn_id| {
        let connections = Arc::clone(&gc_registry);
        tokio::spawn(async move {
            if let Some(conn) = connections.read().await.get(&conn_id).cloned() {
                if conn.is_closed() {
                    connections.write().await.remove(&conn_id);
                }
            }
        });
    });

    let listener_cancel = CancellationToken::new();
    let listener_task = tokio::spawn({
        let cancel = listener_cancel.clone();
        async move {
            server::listen(
                app_config.bind,
                table,
                app_config.auth,
                app_config.heartbeat_interval,
                Some(heartbeat_cb),
                on_connect,
                cancel,
            )
            .await
        }
    });

    tokio::spawn(async move {
        loop {
            tokio::time::sleep(std::time::Duration::from_secs(20)).await;
            listener_liveness.report_healthy().await;
        }
    });

    let http_app = setup_metrics_routes(app(liveness, "coordinator".to_string()));
    let http_server = tokio::spawn(serve_health(http_app, app_config.metrics_bind));

    tokio::select! {
        res = listener_task => {
            error!("transport listener exited");
            if let Err(e) = res {
                error!("listener task panicked: {e}");
            }
        }
        res = http_server => {
            error!("health/metrics server exited");
            if let Err(e) = res {
                error!("http server task panicked: {e}");
            }
        }
    }

    manager.stop().await;
    info!("exiting");
}
