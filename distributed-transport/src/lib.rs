//! C8 — Transport & Dispatch: the framed request/response protocol that
//! brokers C2 (election) and C6 (discovery) to client nodes (spec section
//! 4.8). `distributed-core`'s primitives are transport-agnostic; this crate
//! is the only thing that puts them on the wire.

pub mod auth;
pub mod connection;
pub mod correlation;
pub mod error;
pub mod frame;
pub mod handler;
pub mod heartbeat;
pub mod server;
pub mod types;

pub use connection::Connection;
pub use error::{Error, Result};
pub use frame::{Frame, FrameCodec};
pub use handler::{ConnectionId, HandlerFn, HandlerFuture, HandlerTable};
