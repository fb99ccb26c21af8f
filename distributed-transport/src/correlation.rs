//! Response correlation via a `corrId -> one-shot channel` map, replacing
//! the source's pattern of registering a temporary service handler per
//! request and clearing it afterward — a pattern spec section 9 singles
//! out as racy ("Response correlation via transient handlers").

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::oneshot;

use crate::error::{Error, Result};
use crate::frame::Frame;

#[derive(Default)]
pub struct CorrelationMap {
    next_id: AtomicU64,
    waiters: Mutex<HashMap<(u64, u16), oneshot::Sender<Frame>>>,
}

impl CorrelationMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_correlation_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Registers a one-shot waiter for `(correlation_id, response_message_type)`.
    fn register(&self, correlation_id: u64, response_message_type: u16) -> oneshot::Receiver<Frame> {
        let (tx, rx) = oneshot::channel();
        self.waiters
            .lock()
            .unwrap()
            .insert((correlation_id, response_message_type), tx);
        rx
    }

    fn clear(&self, correlation_id: u64, response_message_type: u16) {
        self.waiters
            .lock()
            .unwrap()
            .remove(&(correlation_id, response_message_type));
    }

    /// Fulfills a pending waiter if one is registered for this frame's
    /// `(correlation_id, message_type)`. Returns `true` if the frame was
    /// consumed by a waiter (the dispatcher must not also route it to the
    /// handler table). A response with no matching waiter — a late
    /// response past its deadline — is dropped silently, per spec section
    /// 4.8.
    pub fn resolve(&self, frame: Frame) -> bool {
        let key = (frame.correlation_id, frame.message_type);
        if let Some(tx) = self.waiters.lock().unwrap().remove(&key) {
            let _ = tx.send(frame);
            true
        } else {
            false
        }
    }

    /// Blocks on the waiter with a caller-supplied deadline. The waiter
    /// entry is always removed on return, whether by response, timeout, or
    /// channel closure, so stale entries never accumulate.
    pub async fn wait_for(
        &self,
        correlation_id: u64,
        response_message_type: u16,
        deadline: Duration,
    ) -> Result<Frame> {
        let rx = self.register(correlation_id, response_message_type);
        let result = tokio::time::timeout(deadline, rx).await;
        self.clear(correlation_id, response_message_type);
        match result {
            Ok(Ok(frame)) => Ok(frame),
            Ok(Err(_)) => Err(Error::ConnectionClosed),
            Err(_) => Err(Error::RequestTimeout(correlation_id)),
        }
    }
}
