//! One physical TCP connection: a single read loop (spec section 4.8: "The
//! dispatcher owns one read loop per connection") plus a write-side mpsc
//! funnel so the heartbeat sender, outgoing requests, and handler replies
//! can all write without sharing a lock over the socket.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use crate::auth::{self, TOKEN_REFRESH_CHECK_INTERVAL};
use crate::correlation::CorrelationMap;
use crate::error::{Error, Result};
use crate::frame::{Frame, FrameCodec};
use crate::handler::{ConnectionId, HandlerTable};
use crate::heartbeat::{self, HeartbeatCallback, DEFAULT_HEARTBEAT_INTERVAL};
use crate::types::service_type::SYSTEM;
use crate::types::system_message::{HEARTBEAT, TOKEN_REFRESH, TOKEN_REFRESH_RESPONSE};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

fn next_connection_id() -> ConnectionId {
    NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed)
}

/// A live connection, dialed or accepted. Holds no lock over the socket
/// itself — all writes funnel through `outbound_tx` to a dedicated writer
/// task.
pub struct Connection {
    id: ConnectionId,
    remote: std::net::SocketAddr,
    outbound_tx: mpsc::Sender<Frame>,
    correlation: Arc<CorrelationMap>,
    session: Mutex<Option<auth::Session>>,
    cancel: CancellationToken,
    reader: Mutex<Option<tokio::task::JoinHandle<()>>>,
    writer: Mutex<Option<tokio::task::JoinHandle<()>>>,
    heartbeat: Mutex<Option<tokio::task::JoinHandle<()>>>,
    token_refresh: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Connection {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn remote_addr(&self) -> std::net::SocketAddr {
        self.remote
    }

    /// Wraps an already-connected socket, spawning the read loop, the
    /// writer task, and the heartbeat sender. `handlers` is shared across
    /// every connection on this node; `heartbeat_cb` lets the caller GC
    /// watcher tables keyed by connection id on each heartbeat arrival.
    pub fn spawn(
        stream: TcpStream,
        remote: std::net::SocketAddr,
        handlers: Arc<HandlerTable>,
        heartbeat_cb: Option<HeartbeatCallback>,
        heartbeat_interval: Duration,
    ) -> Arc<Self> {
        let id = next_connection_id();
        let framed = Framed::new(stream, FrameCodec);
        let (mut sink, mut stream) = framed.split();
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<Frame>(256);
        let cancel = CancellationToken::new();
        let correlation = Arc::new(CorrelationMap::new());

        let writer_cancel = cancel.clone();
        let writer = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = writer_cancel.cancelled() => return,
                    frame = outbound_rx.recv() => {
                        let Some(frame) = frame else { return };
                        if sink.send(frame).await.is_err() {
                            return;
                        }
                    }
                }
            }
        });

        let conn = Arc::new(Self {
            id,
            remote,
            outbound_tx: outbound_tx.clone(),
            correlation: Arc::clone(&correlation),
            session: Mutex::new(None),
            cancel: cancel.clone(),
            reader: Mutex::new(None),
            writer: Mutex::new(Some(writer)),
            heartbeat: Mutex::new(None),
            token_refresh: Mutex::new(None),
        });

        let reader_cancel = cancel.clone();
        let reader_conn_id = id;
        let reader = {
            let correlation = Arc::clone(&correlation);
            let conn = Arc::clone(&conn);
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = reader_cancel.cancelled() => return,
                        next = stream.next() => {
                            match next {
                                Some(Ok(frame)) => {
                                    conn.handle_inbound(
                                        reader_conn_id,
                                        frame,
                                        &correlation,
                                        &handlers,
                                        &outbound_tx,
                                        heartbeat_cb.as_ref(),
                                    )
                                    .await;
                                }
                                Some(Err(e)) => {
                                    tracing::warn!(connection = reader_conn_id, error = %e, "corrupt frame, closing connection");
                                    reader_cancel.cancel();
                                    return;
                                }
                                None => {
                                    tracing::debug!(connection = reader_conn_id, "connection closed by peer");
                                    reader_cancel.cancel();
                                    return;
                                }
                            }
                        }
                    }
                }
            })
        };
        *conn.reader.try_lock().unwrap() = Some(reader);

        let hb = heartbeat::spawn_heartbeat_sender(conn.outbound_tx.clone(), heartbeat_interval, cancel);
        *conn.heartbeat.try_lock().unwrap() = Some(hb);

        conn
    }

    pub fn default_heartbeat_interval() -> Duration {
        DEFAULT_HEARTBEAT_INTERVAL
    }

    pub async fn set_session(&self, session: auth::Session) {
        *self.session.lock().await = Some(session);
    }

    pub async fn session_token(&self) -> Option<String> {
        self.session.lock().await.as_ref().map(|s| s.token.clone())
    }

    /// Sends a one-way frame. No response is awaited.
    pub async fn send(&self, frame: Frame) -> Result<()> {
        self.outbound_tx
            .send(frame)
            .await
            .map_err(|_| Error::ConnectionClosed)
    }

    /// Request/response contract (spec section 4.8): allocates a
    /// correlation id, registers a one-shot waiter for
    /// `(correlation_id, response_message_type)`, emits the request, and
    /// blocks with `deadline`.
    pub async fn send_request(
        &self,
        service_type: u16,
        message_type: u16,
        payload: Bytes,
        response_message_type: u16,
        deadline: Duration,
    ) -> Result<Frame> {
        let correlation_id = self.correlation.next_correlation_id();
        let frame = Frame::new(service_type, message_type, correlation_id, payload);
        let wait = self.correlation.wait_for(correlation_id, response_message_type, deadline);
        self.send(frame).await?;
        wait.await
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub async fn close(&self) {
        self.cancel.cancel();
        if let Some(h) = self.reader.lock().await.take() {
            let _ = h.await;
        }
        if let Some(h) = self.writer.lock().await.take() {
            let _ = h.await;
        }
        if let Some(h) = self.heartbeat.lock().await.take() {
            h.abort();
        }
        if let Some(h) = self.token_refresh.lock().await.take() {
            h.abort();
        }
    }

    /// Spawns the client-side periodic refresh task (spec section 4.8: "a
    /// periodic task refreshes at 47-hour intervals"). Wakes up every
    /// [`TOKEN_REFRESH_CHECK_INTERVAL`] and, once the current session
    /// reports [`auth::Session::needs_refresh`], requests a replacement
    /// token from the peer and swaps it into this connection's session.
    /// Only meaningful on a connection that already holds a session — the
    /// caller checks that before spawning.
    pub fn spawn_token_refresh(self: &Arc<Self>) {
        let this = Arc::clone(self);
        let cancel = self.cancel.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(TOKEN_REFRESH_CHECK_INTERVAL) => {}
                }
                let needs_refresh = this
                    .session
                    .lock()
                    .await
                    .as_ref()
                    .map(auth::Session::needs_refresh)
                    .unwrap_or(false);
                if !needs_refresh {
                    continue;
                }
                match this
                    .send_request(SYSTEM, TOKEN_REFRESH, Bytes::new(), TOKEN_REFRESH_RESPONSE, Duration::from_secs(5))
                    .await
                {
                    Ok(frame) => match serde_json::from_slice::<auth::TokenPayload>(&frame.payload) {
                        Ok(payload) => this.set_session(auth::Session::new(payload.token)).await,
                        Err(e) => tracing::warn!(error = %e, "malformed token refresh response"),
                    },
                    Err(e) => tracing::warn!(error = %e, "token refresh request failed, retrying next tick"),
                }
            }
        });
        if let Ok(mut guard) = self.token_refresh.try_lock() {
            *guard = Some(handle);
        }
    }

    /// Dispatches one inbound frame: heartbeats and token refresh requests
    /// are handled inline as transport-level concerns, everything else
    /// first tries the correlation map (a pending request waiter) and
    /// falls back to the registered handler table (spec section 4.8).
    async fn handle_inbound(
        self: &Arc<Self>,
        connection_id: ConnectionId,
        frame: Frame,
        correlation: &CorrelationMap,
        handlers: &HandlerTable,
        outbound_tx: &mpsc::Sender<Frame>,
        heartbeat_cb: Option<&HeartbeatCallback>,
    ) {
        if frame.service_type == SYSTEM && frame.message_type == HEARTBEAT {
            if let Some(cb) = heartbeat_cb {
                cb(connection_id);
            }
            return;
        }

        if frame.service_type == SYSTEM && frame.message_type == TOKEN_REFRESH {
            let token = auth::mint_refreshed_token();
            self.set_session(auth::Session::new(token.clone())).await;
            let payload = match serde_json::to_vec(&auth::TokenPayload { token }) {
                Ok(bytes) => bytes,
                Err(e) => {
                    tracing::warn!(connection_id, error = %e, "failed to encode token refresh response");
                    return;
                }
            };
            let reply = Frame::new(SYSTEM, TOKEN_REFRESH_RESPONSE, frame.correlation_id, payload.into());
            if outbound_tx.send(reply).await.is_err() {
                tracing::debug!(connection_id, "could not send token refresh response, connection closed");
            }
            return;
        }

        let service_type = frame.service_type;
        let message_type = frame.message_type;
        let correlation_id = frame.correlation_id;

        if correlation.resolve(frame.clone()) {
            return;
        }

        let Some(handler) = handlers.lookup(service_type, message_type) else {
            tracing::warn!(service_type, message_type, "unknown handler, discarding frame");
            return;
        };

        match handler(connection_id, frame).await {
            Ok(Some(mut reply)) => {
                reply.correlation_id = correlation_id;
                if outbound_tx.send(reply).await.is_err() {
                    tracing::debug!(connection_id, "could not send reply, connection closed");
                }
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(connection_id, service_type, message_type, error = %e, "handler failed");
            }
        }
    }
}
