use thiserror::Error;

/// Error taxonomy for every `pkg/distributed/*` primitive.
///
/// Variants map 1:1 onto the kinds a downstream HTTP layer would translate
/// into status codes; this crate stops at [`ErrorKind`] and leaves that
/// translation to callers, since an HTTP facade is out of scope here.
#[derive(Error, Debug)]
pub enum Error {
    #[error("not found")]
    NotFound,

    #[error("validation error: {0}")]
    Validation(String),

    #[error("unauthenticated")]
    Unauthenticated,

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("kv store error: {0}")]
    Db(#[from] etcd_client::Error),

    #[error("third-party adapter error: {0}")]
    ThirdParty(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("leadership lost")]
    LeadershipLost,
}

pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification used by downstream response layers (spec'd,
/// not implemented here) to pick a status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Validation,
    Unauthenticated,
    Forbidden,
    Unavailable,
    Internal,
    Db,
    ThirdParty,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NotFound => ErrorKind::NotFound,
            Error::Validation(_) => ErrorKind::Validation,
            Error::Unauthenticated => ErrorKind::Unauthenticated,
            Error::Forbidden(_) => ErrorKind::Forbidden,
            Error::Unavailable(_) => ErrorKind::Unavailable,
            Error::Internal(_) | Error::LeadershipLost => ErrorKind::Internal,
            Error::Db(_) => ErrorKind::Db,
            Error::ThirdParty(_) => ErrorKind::ThirdParty,
            Error::Serialization(_) => ErrorKind::Internal,
        }
    }

    /// True whether the not-found condition came from an empty KV read or
    /// from an in-process primitive (e.g. `Discovery::deregister` on an
    /// id that was never registered).
    pub fn is_not_found(&self) -> bool {
        matches!(self.kind(), ErrorKind::NotFound)
    }
}
