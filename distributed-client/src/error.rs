use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("transport error: {0}")]
    Transport(#[from] distributed_transport::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("no seed endpoint could be reached after retries")]
    AllSeedsFailed,

    #[error("send failed on every connection: {0}")]
    AllConnectionsFailed(String),

    #[error("no connections available")]
    NoConnections,
}

pub type Result<T> = std::result::Result<T, Error>;
