//! Error types for the crawler pipeline.

use thiserror::Error;

/// Errors returned by a [`ChainRpc`](crate::rpc::ChainRpc) implementation.
///
/// The variant is the classification: retry logic looks at the kind, never
/// at the rendered message.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RpcError {
    /// The node (or the proxy in front of it) answered 502/503.
    #[error("upstream unavailable (HTTP {status})")]
    Unavailable { status: u16 },

    /// Connection refused, timeout, non-2xx status, broken body.
    #[error("transport error: {0}")]
    Transport(String),

    /// JSON-RPC error object returned by the node.
    #[error("RPC error {code}: {message}")]
    Rpc { code: i64, message: String },

    /// The response could not be decoded into the expected shape.
    #[error("decode error: {0}")]
    Decode(String),

    /// The node returned `null` for the requested object.
    #[error("{what} not found")]
    NotFound { what: String },
}

impl RpcError {
    /// Returns `true` for the "temporarily unavailable" signature that is
    /// retried at half cost.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }

    /// Returns `true` if the error is worth another attempt. Node errors
    /// ("header not found" on a lagging replica) are; a body that does not
    /// decode will not decode the next time either.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Decode(_))
    }
}

/// Errors that can occur while crawling and indexing.
#[derive(Debug, Error)]
pub enum CrawlerError {
    #[error("RPC error: {0}")]
    Rpc(#[from] RpcError),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Bus error: {0}")]
    Bus(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Window #{from}-{to} cannot be classified: {reason}")]
    WindowUnclassifiable { from: u64, to: u64, reason: String },

    #[error("Aborted: {reason}")]
    Aborted { reason: String },

    #[error("{0}")]
    Other(String),
}

impl CrawlerError {
    /// Returns `true` if the error came from the storage layer (fatal to the
    /// current window).
    pub fn is_storage(&self) -> bool {
        matches!(self, Self::Storage(_))
    }
}

impl From<std::io::Error> for CrawlerError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}
