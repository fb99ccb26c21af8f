//! Flat dispatch table: `(serviceType, messageType) -> handler`, replacing
//! the polymorphic "service handler" inheritance hierarchy the source used
//! (spec section 9 "Deep nested handler dispatch"). New services are
//! registered, not subclassed.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use dashmap::DashMap;

use crate::error::Result;
use crate::frame::Frame;

pub type ConnectionId = u64;

pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<Option<Frame>>> + Send>>;

/// A plain function of `(connection_id, frame) -> (reply, error)`, per spec
/// section 9 ("Coroutine-style handlers"). Long-lived work a handler needs
/// to kick off (e.g. a discovery watch) is spawned by the handler and
/// tracked by the primitive that owns it, not by the dispatcher.
pub type HandlerFn = Arc<dyn Fn(ConnectionId, Frame) -> HandlerFuture + Send + Sync>;

struct Registered {
    #[allow(dead_code)]
    handler_name: String,
    handler: HandlerFn,
}

/// Append-only during steady state: registration happens at startup or
/// from dedicated setup paths (spec section 5).
#[derive(Default)]
pub struct HandlerTable {
    inner: DashMap<u16, HashMap<u16, Registered>>,
}

impl HandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        service_type: u16,
        handler_name: impl Into<String>,
        message_type: u16,
        handler: HandlerFn,
    ) {
        self.inner.entry(service_type).or_default().insert(
            message_type,
            Registered {
                handler_name: handler_name.into(),
                handler,
            },
        );
    }

    /// Looks up the handler set for `serviceType`, then the per-messageType
    /// callback, per spec section 4.8's dispatch algorithm. `None` means
    /// unknown serviceType or messageType — the caller logs and discards.
    pub fn lookup(&self, service_type: u16, message_type: u16) -> Option<HandlerFn> {
        self.inner
            .get(&service_type)?
            .get(&message_type)
            .map(|r| Arc::clone(&r.handler))
    }
}
