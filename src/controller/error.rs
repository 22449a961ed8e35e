use crate::models::NetId;
use crate::mq::BrokerError;
use crate::store::StoreError;
use thiserror::Error;

/// The failure classes the command surface reports to its callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    BadRequest,
    Forbidden,
    Conflict,
    Internal,
    Timeout,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("{0} not found")]
    NotFound(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("no available addresses in network {0}")]
    AddressSpaceExhausted(NetId),

    #[error("couldn't generate random name, try again")]
    NameGenExhausted,

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("publish to {topic} exceeded timeout")]
    PublishTimeout { topic: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("config serialization error: {0}")]
    TomlSer(#[from] toml::ser::Error),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::Store(e) if e.is_empty_record() => ErrorKind::NotFound,
            Error::BadRequest(_) => ErrorKind::BadRequest,
            Error::Forbidden(_) => ErrorKind::Forbidden,
            Error::AddressSpaceExhausted(_) | Error::NameGenExhausted => ErrorKind::Conflict,
            Error::PublishTimeout { .. } => ErrorKind::Timeout,
            _ => ErrorKind::Internal,
        }
    }

    /// Whether this is the store's empty sentinel, which list-shaped reads
    /// treat as "no entries" rather than a failure.
    pub fn is_empty_record(&self) -> bool {
        matches!(self, Error::Store(e) if e.is_empty_record())
    }
}
