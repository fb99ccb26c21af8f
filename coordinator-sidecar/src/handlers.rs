//! Wires election and discovery onto the dispatch table, exposing
//! get-leader and register/deregister/watch/discover as network-addressable
//! services.
//!
//! `distributed-transport` only knows about frames and handler tables; this
//! module is the glue that decodes a frame's payload, calls into
//! `distributed-core`, and encodes the [`ResponseEnvelope`] reply.

use std::collections::HashMap;
use std::sync::Arc;

use distributed_core::discovery::{DiscoveryEvent, DiscoveryEventKind, ServiceInstance};
use distributed_core::manager::CoordinatorManager;
use distributed_transport::handler::{ConnectionId, HandlerTable};
use distributed_transport::types::{discovery_message, election_message, service_type, ResponseEnvelope};
use distributed_transport::{Connection, Frame};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LeaderInfoDto {
    node_id: String,
    ip: Option<String>,
    protocol_port: Option<u16>,
    cache_port: Option<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DeregisterRequest {
    name: String,
    id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ServiceEventPayload {
    kind: String,
    instance_id: String,
    host: Option<String>,
    port: Option<u16>,
}

impl From<DiscoveryEvent> for ServiceEventPayload {
    fn from(event: DiscoveryEvent) -> Self {
        Self {
            kind: match event.kind {
                DiscoveryEventKind::Add => "add",
                DiscoveryEventKind::Update => "update",
                DiscoveryEventKind::Delete => "delete",
            }
            .to_string(),
            instance_id: event.instance_id,
            host: event.instance.as_ref().map(|i| i.address.clone()),
            port: event.instance.as_ref().map(|i| i.port),
        }
    }
}

/// Connections currently accepted by the listener, keyed by connection id,
/// so a long-lived discovery watcher can push `SERVICE_EVENT` frames back
/// on the connection that asked to watch, independent of the
/// request/response correlation that started it.
pub type ConnectionRegistry = Arc<RwLock<HashMap<ConnectionId, Arc<Connection>>>>;

/// Registers every handler this sidecar exposes onto `table`: a flat
/// dispatch table, not a subclassed service hierarchy — new services are
/// registered, not subclassed.
pub fn register_all(table: &HandlerTable, manager: Arc<CoordinatorManager>, connections: ConnectionRegistry) {
    table.register(
        service_type::ELECTION,
        "election",
        election_message::GET_LEADER,
        {
            let manager = Arc::clone(&manager);
            Arc::new(move |_conn_id, frame| {
                let manager = Arc::clone(&manager);
                Box::pin(async move { handle_get_leader(manager, frame).await })
            })
        },
    );

    table.register(
        service_type::DISCOVERY,
        "discovery",
        discovery_message::REGISTER_SERVICE,
        {
            let manager = Arc::clone(&manager);
            Arc::new(move |_conn_id, frame| {
                let manager = Arc::clone(&manager);
                Box::pin(async move { handle_register(manager, frame).await })
            })
        },
    );

    table.register(
        service_type::DISCOVERY,
        "discovery",
        discovery_message::DEREGISTER_SERVICE,
        {
            let manager = Arc::clone(&manager);
            Arc::new(move |_conn_id, frame| {
                let manager = Arc::clone(&manager);
                Box::pin(async move { handle_deregister(manager, frame).await })
            })
        },
    );

    table.register(
        service_type::DISCOVERY,
        "discovery",
        discovery_message::DISCOVER_SERVICE,
        {
            let manager = Arc::clone(&manager);
            Arc::new(move |_conn_id, frame| {
                let manager = Arc::clone(&manager);
                Box::pin(async move { handle_discover(manager, frame).await })
            })
        },
    );

    table.register(
        service_type::DISCOVERY,
        "discovery",
        discovery_message::WATCH_SERVICE,
        {
            let manager = Arc::clone(&manager);
            let connections = Arc::clone(&connections);
            Arc::new(move |conn_id, frame| {
                let manager = Arc::clone(&manager);
                let connections = Arc::clone(&connections);
                Box::pin(async move { handle_watch(manager, connections, conn_id, frame).await })
            })
        },
    );
}

async fn handle_get_leader(
    manager: Arc<CoordinatorManager>,
    frame: Frame,
) -> distributed_transport::Result<Option<Frame>> {
    let election = manager
        .get_or_create_election("default".to_string())
        .await
        .map_err(distributed_transport::Error::Core)?;

    let envelope = match election.get_leader().await.map_err(distributed_transport::Error::Core)? {
        Some(node_id) => {
            // Only the leader's own record actually describes its reachable
            // address; a follower answering on behalf of a different leader
            // only knows that node's id, not its ip/ports.
            let info = election.get_info().await;
            let dto = if info.node_id == node_id {
                LeaderInfoDto {
                    node_id,
                    ip: info.ip,
                    protocol_port: info.protocol_port,
                    cache_port: info.cache_port,
                }
            } else {
                LeaderInfoDto {
                    node_id,
                    ip: None,
                    protocol_port: None,
                    cache_port: None,
                }
            };
            ResponseEnvelope::ok_with_data("leader", &dto)
                .map_err(distributed_transport::Error::Serialization)?
        }
        None => ResponseEnvelope::err("leader", "no leader elected yet"),
    };
    Ok(Some(reply(&frame, election_message::LEADER_RESPONSE, &envelope)?))
}

async fn handle_register(
    manager: Arc<CoordinatorManager>,
    frame: Frame,
) -> distributed_transport::Result<Option<Frame>> {
    let instance: ServiceInstance = serde_json::from_slice(&frame.payload)?;
    let envelope = match manager.discovery().register(instance).await {
        Ok(()) => ResponseEnvelope::ok("register"),
        Err(e) => ResponseEnvelope::err("register", e.to_string()),
    };
    Ok(Some(reply(&frame, discovery_message::SERVICE_RESPONSE, &envelope)?))
}

async fn handle_deregister(
    manager: Arc<CoordinatorManager>,
    frame: Frame,
) -> distributed_transport::Result<Option<Frame>> {
    let request: DeregisterRequest = serde_json::from_slice(&frame.payload)?;
    let envelope = match manager.discovery().deregister(&request.name, &request.id).await {
        Ok(()) => ResponseEnvelope::ok("deregister"),
        Err(e) => ResponseEnvelope::err("deregister", e.to_string()),
    };
    Ok(Some(reply(&frame, discovery_message::SERVICE_RESPONSE, &envelope)?))
}

async fn handle_discover(
    manager: Arc<CoordinatorManager>,
    frame: Frame,
) -> distributed_transport::Result<Option<Frame>> {
    let name: String = serde_json::from_slice(&frame.payload)?;
    let envelope = match manager.discovery().discover(&name).await {
        Ok(instances) => ResponseEnvelope::ok_with_data("discover", &instances)
            .map_err(distributed_transport::Error::Serialization)?,
        Err(e) => ResponseEnvelope::err("discover", e.to_string()),
    };
    Ok(Some(reply(&frame, discovery_message::SERVICE_RESPONSE, &envelope)?))
}

/// Registers a live watch and acknowledges the request immediately; every
/// subsequent discovery event is pushed as its own `SERVICE_EVENT` frame
/// carrying the *same* correlation id, so the client can match replies to
/// the watch it started without a second request/response round trip per
/// event.
async fn handle_watch(
    manager: Arc<CoordinatorManager>,
    connections: ConnectionRegistry,
    conn_id: ConnectionId,
    frame: Frame,
) -> distributed_transport::Result<Option<Frame>> {
    let name: String = serde_json::from_slice(&frame.payload)?;
    let correlation_id = frame.correlation_id;
    let discovery = manager.discovery();

    discovery
        .add_watcher(&name, move |event| {
            let connections = Arc::clone(&connections);
            let payload = ServiceEventPayload::from(event);
            tokio::spawn(async move {
                let Some(conn) = connections.read().await.get(&conn_id).cloned() else {
                    return;
                };
                let Ok(envelope) = ResponseEnvelope::ok_with_data("service_event", &payload) else {
                    return;
                };
                let Ok(bytes) = serde_json::to_vec(&envelope) else {
                    return;
                };
                let event_frame = Frame::new(
                    service_type::DISCOVERY,
                    discovery_message::SERVICE_EVENT,
                    correlation_id,
                    bytes.into(),
                );
                let _ = conn.send(event_frame).await;
            });
        })
        .await
        .map_err(distributed_transport::Error::Core)?;

    let envelope = ResponseEnvelope::ok("watch");
    Ok(Some(reply(&frame, discovery_message::SERVICE_RESPONSE, &envelope)?))
}

fn reply(request: &Frame, message_type: u16, envelope: &ResponseEnvelope) -> distributed_transport::Result<Frame> {
    let bytes = serde_json::to_vec(envelope)?;
    Ok(Frame::new(request.service_type, message_type, request.correlation_id, bytes.into()))
}
