//! Accept loop: binds a listener, performs the optional auth handshake on
//! each new connection, then hands it to [`Connection::spawn`] for the
//! dispatcher's steady-state read loop (spec section 4.8).

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use crate::auth::{self, AuthConfig};
use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::frame::{Frame, FrameCodec};
use crate::handler::HandlerTable;
use crate::heartbeat::HeartbeatCallback;
use crate::types::service_type::SYSTEM;
use crate::types::system_message::{AUTH_REQUEST, AUTH_RESPONSE};

/// Runs the accept loop until `cancel` fires. `on_connect` is invoked once
/// per successfully-handshaked connection, synchronously, so the caller
/// can register it (e.g. into a connections map) before the read loop
/// starts draining frames.
#[allow(clippy::too_many_arguments)]
pub async fn listen<F>(
    bind: SocketAddr,
    handlers: Arc<HandlerTable>,
    auth_config: AuthConfig,
    heartbeat_interval: Duration,
    heartbeat_cb: Option<HeartbeatCallback>,
    on_connect: F,
    cancel: CancellationToken,
) -> Result<()>
where
    F: Fn(Arc<Connection>) + Send + Sync + 'static,
{
    let listener = TcpListener::bind(bind).await?;
    tracing::info!(%bind, "transport listener bound");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            accepted = listener.accept() => {
                let (stream, remote) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed");
                        continue;
                    }
                };
                let handlers = Arc::clone(&handlers);
                let auth_config = auth_config.clone();
                let heartbeat_cb = heartbeat_cb.clone();
                match server_handshake(stream, &auth_config).await {
                    Ok((stream, session)) => {
                        let conn = Connection::spawn(stream, remote, handlers, heartbeat_cb, heartbeat_interval);
                        if let Some(session) = session {
                            conn.set_session(session).await;
                        }
                        on_connect(conn);
                    }
                    Err(e) => {
                        tracing::warn!(%remote, error = %e, "auth handshake failed, dropping connection");
                    }
                }
            }
        }
    }
}

/// Server side of the handshake: if auth is disabled, the connection is
/// handed off untouched. If enabled, reads one `AUTH_REQUEST` frame,
/// verifies it, and replies with `AUTH_RESPONSE` carrying the token.
async fn server_handshake(
    stream: TcpStream,
    auth_config: &AuthConfig,
) -> Result<(TcpStream, Option<auth::Session>)> {
    if !auth_config.enabled {
        return Ok((stream, None));
    }

    let mut framed = Framed::new(stream, FrameCodec);
    let frame = framed
        .next()
        .await
        .ok_or(Error::ConnectionClosed)??;
    if frame.service_type != SYSTEM || frame.message_type != AUTH_REQUEST {
        return Err(Error::AuthFailed("expected auth request as first frame".into()));
    }
    let credentials: auth::Credentials = serde_json::from_slice(&frame.payload)?;
    let token = auth::verify(auth_config, &credentials)
        .ok_or_else(|| Error::AuthFailed(format!("credentials rejected for {}", credentials.node_id)))?;

    let payload = serde_json::to_vec(&auth::TokenPayload { token: token.clone() })?;
    let response = Frame::new(SYSTEM, AUTH_RESPONSE, frame.correlation_id, payload.into());
    framed.send(response).await?;

    Ok((framed.into_inner(), Some(auth::Session::new(token))))
}

/// Client side of the handshake: dials `addr`, and if auth is enabled,
/// submits credentials and awaits the token response before handing the
/// socket to [`Connection::spawn`].
pub async fn dial(
    addr: SocketAddr,
    handlers: Arc<HandlerTable>,
    auth_config: &AuthConfig,
    credentials: Option<auth::Credentials>,
    heartbeat_interval: Duration,
    heartbeat_cb: Option<HeartbeatCallback>,
) -> Result<Arc<Connection>> {
    let stream = TcpStream::connect(addr).await?;
    let (stream, session) = client_handshake(stream, auth_config, credentials).await?;
    let conn = Connection::spawn(stream, addr, handlers, heartbeat_cb, heartbeat_interval);
    if let Some(session) = session {
        conn.set_session(session).await;
        // Only a connection that actually authenticated needs its token
        // kept fresh (spec section 4.8's 47-hour refresh cadence).
        conn.spawn_token_refresh();
    }
    Ok(conn)
}

async fn client_handshake(
    stream: TcpStream,
    auth_config: &AuthConfig,
    credentials: Option<auth::Credentials>,
) -> Result<(TcpStream, Option<auth::Session>)> {
    if !auth_config.enabled {
        return Ok((stream, None));
    }
    let credentials = credentials.ok_or_else(|| Error::AuthFailed("auth enabled but no credentials supplied".into()))?;

    let mut framed = Framed::new(stream, FrameCodec);
    let payload = serde_json::to_vec(&credentials)?;
    framed.send(Frame::new(SYSTEM, AUTH_REQUEST, 0, payload.into())).await?;

    let frame = framed.next().await.ok_or(Error::ConnectionClosed)??;
    if frame.service_type != SYSTEM || frame.message_type != AUTH_RESPONSE {
        return Err(Error::AuthFailed("expected auth response".into()));
    }
    let token: auth::TokenPayload = serde_json::from_slice(&frame.payload)?;
    Ok((framed.into_inner(), Some(auth::Session::new(token.token))))
}
