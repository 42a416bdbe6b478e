//! chaincrawl-core — foundation for the crash-safe block crawler.
//!
//! # Architecture
//!
//! ```text
//! Scheduler / CLI ──index──▶ BlockIndexer ──get_blocks_range──▶ BlockFetcher
//!                                 │                                 │ fan-out
//!                                 │◀──── EphemeralCache slots ◀─────┘ ChainRpc
//!                                 ├── classify (new / changed / Issue)
//!                                 └── Storage (blocks, txs, issues, checkpoints)
//! ```
//!
//! This crate holds the pieces every other crate agrees on: the persisted
//! data model, the [`Issue`] checksum, the retry policy used against a flaky
//! node, configuration, and the collaborator traits ([`ChainRpc`],
//! [`Storage`], [`FileSystem`]).

pub mod chain;
pub mod config;
pub mod error;
pub mod fs;
pub mod issue;
pub mod model;
pub mod retry;
pub mod rpc;
pub mod storage;

pub use chain::{ChainBlock, ChainTransaction, SYSTEM_ADDRESSES};
pub use config::CrawlerConfig;
pub use error::{CrawlerError, RpcError};
pub use fs::{FileSystem, LocalFileSystem};
pub use issue::{Issue, IssueKind};
pub use model::{BlockRow, Checkpoint, CheckpointKind, TransactionRow};
pub use retry::{RetryConfig, RetryPolicy};
pub use rpc::{ChainRpc, RawBlock, RawTrace};
pub use storage::Storage;
