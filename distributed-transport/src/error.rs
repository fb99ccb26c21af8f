use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("core error: {0}")]
    Core(#[from] distributed_core::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("corrupt frame: {0}")]
    CorruptFrame(String),

    #[error("request timed out waiting for correlation id {0}")]
    RequestTimeout(u64),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("authentication failed: {0}")]
    AuthFailed(String),
}

pub type Result<T> = std::result::Result<T, Error>;
