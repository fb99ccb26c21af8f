//! Client Fleet: connection fan-out, leader discovery, leader-first send,
//! and service-driven topology.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use distributed_transport::auth::{AuthConfig, Credentials};
use distributed_transport::handler::{ConnectionId, HandlerTable};
use distributed_transport::types::{discovery_message, election_message, service_type, ResponseEnvelope};
use distributed_transport::{server, Connection, Frame};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::config::{ClientConfig, LEADER_REFRESH_DEBOUNCE, TOPOLOGY_SETTLE_DELAY};
use crate::error::{Error, Result};
use crate::leader::{LeaderCache, LeaderInfo};

type LeaderChangeCallback = Box<dyn Fn(&LeaderInfo) + Send + Sync>;

/// Topology event payload pushed by the server as a `SERVICE_EVENT` frame,
/// mirroring [`distributed_core::discovery::DiscoveryEvent`] but decoupled
/// from the server-side type since it crosses the wire as JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceEventPayload {
    pub kind: String, // "add" | "update" | "delete"
    pub instance_id: String,
    pub host: Option<String>,
    pub port: Option<u16>,
}

struct ConnectionEntry {
    connection: Arc<Connection>,
}

pub struct ClientFleet {
    config: ClientConfig,
    auth_config: AuthConfig,
    credentials: Option<Credentials>,
    handlers: Arc<HandlerTable>,
    connections: RwLock<HashMap<SocketAddr, ConnectionEntry>>,
    leader: RwLock<LeaderCache>,
    leader_callbacks: RwLock<Vec<LeaderChangeCallback>>,
    topology_cancel: CancellationToken,
    self_instance_id: RwLock<Option<String>>,
}

impl ClientFleet {
    pub fn new(config: ClientConfig, auth_config: AuthConfig, credentials: Option<Credentials>) -> Arc<Self> {
        Arc::new(Self {
            config,
            auth_config,
            credentials,
            handlers: Arc::new(HandlerTable::new()),
            connections: RwLock::new(HashMap::new()),
            leader: RwLock::new(LeaderCache::default()),
            leader_callbacks: RwLock::new(Vec::new()),
            topology_cancel: CancellationToken::new(),
            self_instance_id: RwLock::new(None),
        })
    }

    /// Initial connect: tries each seed endpoint in order with configurable
    /// retries and interval; on first success begins leader discovery.
    pub async fn connect(self: &Arc<Self>, seeds: &[SocketAddr]) -> Result<()> {
        for seed in seeds {
            if self.dial_and_register(*seed).await.is_ok() {
                self.refresh_leader_info(true).await?;
                return Ok(());
            }
            for attempt in 1..=self.config.retry_count {
                tokio::time::sleep(self.config.retry_interval()).await;
                if self.dial_and_register(*seed).await.is_ok() {
                    self.refresh_leader_info(true).await?;
                    return Ok(());
                }
                tracing::warn!(%seed, attempt, "seed connect attempt failed");
            }
        }
        Err(Error::AllSeedsFailed)
    }

    async fn dial_and_register(self: &Arc<Self>, addr: SocketAddr) -> Result<()> {
        let conn = tokio::time::timeout(
            self.config.connection_timeout(),
            server::dial(
                addr,
                Arc::clone(&self.handlers),
                &self.auth_config,
                self.credentials.clone(),
                self.config.heartbeat_interval(),
                None,
            ),
        )
        .await
        .map_err(|_| Error::Transport(distributed_transport::Error::ConnectionClosed))??;

        self.connections
            .write()
            .await
            .insert(addr, ConnectionEntry { connection: conn });
        Ok(())
    }

    async fn remove_connection(&self, addr: SocketAddr) {
        if let Some(entry) = self.connections.write().await.remove(&addr) {
            entry.connection.close().await;
        }
    }

    pub fn on_leader_changed<F>(&self, callback: F)
    where
        F: Fn(&LeaderInfo) + Send + Sync + 'static,
    {
        self.leader_callbacks.try_write().unwrap().push(Box::new(callback));
    }

    /// Leader discovery: sends a get-leader request on every open
    /// connection (best-effort fan-out); the first response updates the
    /// cached [`LeaderInfo`] and fires leader-change callbacks if the node
    /// id changed. A `force` refresh ignores the debounce window (used
    /// right after connect and after topology settles).
    pub async fn refresh_leader_info(&self, force: bool) -> Result<Option<LeaderInfo>> {
        {
            let cache = self.leader.read().await;
            if !force && cache.is_fresh(LEADER_REFRESH_DEBOUNCE) {
                return Ok(cache.info.clone());
            }
        }

        let snapshot: Vec<Arc<Connection>> = self
            .connections
            .read()
            .await
            .values()
            .map(|e| Arc::clone(&e.connection))
            .collect();

        // Any connected node can answer with the leader's node id, but only
        // the leader's own connection answers with its full address — keep
        // asking until one of those turns up, falling back to a node-id-only
        // answer if the leader itself never responds.
        let mut fallback: Option<LeaderInfo> = None;
        for conn in &snapshot {
            let request = conn.send_request(
                service_type::ELECTION,
                election_message::GET_LEADER,
                Bytes::new(),
                election_message::LEADER_RESPONSE,
                Duration::from_secs(5),
            );
            match request.await {
                Ok(frame) => match decode_envelope::<LeaderInfo>(&frame) {
                    Ok(Some(info)) if info.ip.is_some() && info.protocol_port.is_some() => {
                        return Ok(Some(self.apply_leader_info(info).await));
                    }
                    Ok(Some(info)) => {
                        fallback.get_or_insert(info);
                        continue;
                    }
                    Ok(None) => continue,
                    Err(e) => {
                        tracing::warn!(error = %e, "malformed leader response");
                        continue;
                    }
                },
                Err(e) => {
                    tracing::debug!(error = %e, "get-leader request failed on this connection, trying next");
                    continue;
                }
            }
        }

        if let Some(info) = fallback {
            return Ok(Some(self.apply_leader_info(info).await));
        }

        Ok(self.leader.read().await.info.clone())
    }

    async fn apply_leader_info(&self, info: LeaderInfo) -> LeaderInfo {
        let changed = self.leader.write().await.update(info.clone());
        if changed {
            for cb in self.leader_callbacks.read().await.iter() {
                cb(&info);
            }
        }
        info
    }

    /// `GetLeaderInfo`: returns the cache if fresh, else triggers a refresh.
    pub async fn get_leader_info(&self) -> Result<Option<LeaderInfo>> {
        self.refresh_leader_info(false).await
    }

    /// Leader-first send: attempts the leader connection first; on any
    /// send error, falls back to any open connection. All-connections
    /// failure is a single aggregated error.
    pub async fn send_message(
        &self,
        service_type: u16,
        message_type: u16,
        payload: Bytes,
        response_message_type: u16,
        deadline: Duration,
    ) -> Result<Frame> {
        let connections = self.connections.read().await;
        if connections.is_empty() {
            return Err(Error::NoConnections);
        }

        // Leader-first: resolve the cached leader's advertised address and
        // put that connection, if we have one open to it, at the front.
        let leader_addr = self.leader.read().await.info.as_ref().and_then(|info| {
            let ip = info.ip.as_deref()?;
            let port = info.protocol_port?;
            format!("{ip}:{port}").parse::<SocketAddr>().ok()
        });
        let mut ordered: Vec<&ConnectionEntry> = connections.values().collect();
        if let Some(leader_addr) = leader_addr {
            ordered.sort_by_key(|e| e.connection.remote_addr() != leader_addr);
        }

        let mut errors = Vec::new();
        for entry in ordered {
            match entry
                .connection
                .send_request(service_type, message_type, payload.clone(), response_message_type, deadline)
                .await
            {
                Ok(frame) => return Ok(frame),
                Err(e) => errors.push(format!("{}: {e}", entry.connection.remote_addr())),
            }
        }
        Err(Error::AllConnectionsFailed(errors.join("; ")))
    }

    /// Service-driven topology: subscribes to changes in the coordinator's
    /// self-service. On ADD events it opens connections to new nodes; on
    /// DELETE it closes the matching connection; leader identity is
    /// re-evaluated after every topology change, delayed
    /// [`TOPOLOGY_SETTLE_DELAY`] to let registration metadata settle (spec
    /// section 4.9).
    pub async fn watch_topology(self: &Arc<Self>) -> Result<()> {
        let service_name = self.config.self_service_name.clone();
        let snapshot: Vec<Arc<Connection>> = self
            .connections
            .read()
            .await
            .values()
            .map(|e| Arc::clone(&e.connection))
            .collect();
        let Some(conn) = snapshot.first() else {
            return Err(Error::NoConnections);
        };

        let payload = serde_json::to_vec(&service_name)?;
        let _ = conn
            .send_request(
                service_type::DISCOVERY,
                discovery_message::WATCH_SERVICE,
                payload.into(),
                discovery_message::SERVICE_RESPONSE,
                Duration::from_secs(5),
            )
            .await;

        let this = Arc::clone(self);
        self.handlers.register(
            service_type::DISCOVERY,
            "client-topology",
            discovery_message::SERVICE_EVENT,
            Arc::new(move |_conn_id: ConnectionId, frame: Frame| {
                let this = Arc::clone(&this);
                Box::pin(async move {
                    this.handle_service_event(&frame).await;
                    Ok(None)
                })
            }),
        );

        Ok(())
    }

    async fn handle_service_event(self: &Arc<Self>, frame: &Frame) {
        let Ok(Some(envelope)) = extract_data(frame) else {
            return;
        };
        let event: ServiceEventPayload = match serde_json::from_str(&envelope) {
            Ok(e) => e,
            Err(e) => {
                tracing::warn!(error = %e, "malformed service event");
                return;
            }
        };

        match event.kind.as_str() {
            "add" | "update" => {
                if let (Some(host), Some(port)) = (event.host, event.port) {
                    if let Ok(addr) = format!("{host}:{port}").parse::<SocketAddr>() {
                        if !self.connections.read().await.contains_key(&addr) {
                            if let Err(e) = self.dial_and_register(addr).await {
                                tracing::warn!(%addr, error = %e, "failed to connect to newly discovered node");
                            }
                        }
                    }
                }
            }
            "delete" => {
                if let (Some(host), Some(port)) = (event.host, event.port) {
                    if let Ok(addr) = format!("{host}:{port}").parse::<SocketAddr>() {
                        self.remove_connection(addr).await;
                    }
                }
            }
            other => tracing::debug!(kind = other, "unhandled service event kind"),
        }

        let this = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = this.topology_cancel.cancelled() => {}
                _ = tokio::time::sleep(TOPOLOGY_SETTLE_DELAY) => {
                    let _ = this.refresh_leader_info(true).await;
                }
            }
        });
    }

    /// Cancels the topology watch, closes every connection, deregisters
    /// the node's own auto-registered service entry, and stops the
    /// scheduler.
    pub async fn shutdown(&self) {
        self.topology_cancel.cancel();

        if self.config.auto_register_service {
            if let Some(instance_id) = self.self_instance_id.write().await.take() {
                let payload = serde_json::to_vec(&instance_id).unwrap_or_default();
                let connections = self.connections.read().await;
                if let Some(entry) = connections.values().next() {
                    let _ = entry
                        .connection
                        .send_request(
                            service_type::DISCOVERY,
                            discovery_message::DEREGISTER_SERVICE,
                            payload.into(),
                            discovery_message::SERVICE_RESPONSE,
                            Duration::from_secs(5),
                        )
                        .await;
                }
            }
        }

        let addrs: Vec<SocketAddr> = self.connections.read().await.keys().copied().collect();
        for addr in addrs {
            self.remove_connection(addr).await;
        }
    }

    pub async fn set_self_instance_id(&self, id: String) {
        *self.self_instance_id.write().await = Some(id);
    }
}

fn decode_envelope<T: for<'de> Deserialize<'de>>(frame: &Frame) -> Result<Option<T>> {
    let envelope: ResponseEnvelope = serde_json::from_slice(&frame.payload)?;
    if !envelope.success {
        return Ok(None);
    }
    match envelope.decode_data::<T>() {
        Some(Ok(v)) => Ok(Some(v)),
        Some(Err(e)) => Err(Error::Serialization(e)),
        None => Ok(None),
    }
}

fn extract_data(frame: &Frame) -> Result<Option<String>> {
    let envelope: ResponseEnvelope = serde_json::from_slice(&frame.payload)?;
    Ok(envelope.data)
}
