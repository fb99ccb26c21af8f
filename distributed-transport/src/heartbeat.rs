//! Heartbeat: a heartbeat frame flows each `heartbeat_interval` (default
//! 30s) in each direction (spec section 4.8). Arrivals are also used as a
//! trigger to garbage-collect watcher entries for connections that have
//! closed — `Discovery`/`StateManager` watcher tables are keyed by
//! connection id, and a connection that vanished without a clean close
//! otherwise leaves its watchers registered forever.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::frame::Frame;
use crate::handler::ConnectionId;
use crate::types::service_type::SYSTEM;
use crate::types::system_message::HEARTBEAT;

pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Spawns a task that emits a heartbeat frame on `outbound` every `interval`
/// until `cancel` fires.
pub fn spawn_heartbeat_sender(
    outbound: mpsc::Sender<Frame>,
    interval: Duration,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(interval) => {
                    let frame = Frame::new(SYSTEM, HEARTBEAT, 0, Default::default());
                    if outbound.send(frame).await.is_err() {
                        return;
                    }
                }
            }
        }
    })
}

/// Invoked by the dispatcher whenever a heartbeat frame is received from
/// `connection_id`, so the caller can refresh a last-seen timestamp and
/// periodically sweep connections that stopped heartbeating.
pub type HeartbeatCallback = std::sync::Arc<dyn Fn(ConnectionId) + Send + Sync>;
