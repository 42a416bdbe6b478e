//! Error types for the bus runtime.

use thiserror::Error;

use chaincrawl_core::error::CrawlerError;

/// Errors raised by the controller and the worker pools.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BusError {
    #[error("no service registered under '{0}'")]
    UnknownService(String),

    #[error("service '{0}' is already registered")]
    DuplicateService(String),

    #[error("bus mailbox is closed")]
    Closed,

    #[error("'{service}' dropped the reply to '{command}'")]
    NoReply { service: String, command: String },

    #[error("unexpected reply to '{command}': {reply}")]
    UnexpectedReply { command: String, reply: String },

    #[error("request rejected: {0}")]
    Rejected(String),
}

/// Errors raised by the ephemeral result cache.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("key '{0}' is already allocated")]
    AlreadyAllocated(String),

    #[error("key '{0}' is not allocated")]
    Missing(String),

    #[error("handle for '{key}' is stale (generation {generation})")]
    StaleHandle { key: String, generation: u64 },

    #[error("index {index} out of bounds for '{key}' (len {len})")]
    OutOfBounds { key: String, index: usize, len: usize },

    #[error("slot {index} of '{key}' was already written")]
    SlotTaken { key: String, index: usize },
}

impl From<BusError> for CrawlerError {
    fn from(e: BusError) -> Self {
        CrawlerError::Bus(e.to_string())
    }
}

impl From<CacheError> for CrawlerError {
    fn from(e: CacheError) -> Self {
        CrawlerError::Bus(e.to_string())
    }
}
