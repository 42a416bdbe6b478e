//! chaincrawl-svc — the crawler's services, each a [`BackgroundService`] on
//! the bus.
//!
//! | id              | commands                                               |
//! |-----------------|--------------------------------------------------------|
//! | `BlockFetcher`  | `get_block`, `get_block_number`, `get_blocks[_range]`  |
//! | `BlockTracer`   | `trace_block`, `trace_blocks_range`, `trace_transaction` |
//! | `BlockIndexer`  | `index`                                                |
//! | `Downloader`    | `download_blocks`, `download_block_traces`             |
//! | `FsWriter`      | `write_block_files`, `write_trace_files`               |
//! | `DbWriter`      | `write_blocks`                                         |
//!
//! [`CrawlerRuntime`] wires them onto one controller.
//!
//! [`BackgroundService`]: chaincrawl_bus::BackgroundService

use chaincrawl_bus::command::{Command, Reply, ReturnSlot};
use tracing::warn;

pub mod classify;
pub mod context;
pub mod downloader;
pub mod fetcher;
pub mod indexer;
pub mod runtime;
pub mod signer;
pub mod tracer;
pub mod writer;

#[cfg(test)]
pub(crate) mod testing;

pub use context::ServiceContext;
pub use runtime::CrawlerRuntime;

pub const BLOCK_FETCHER: &str = "BlockFetcher";
pub const BLOCK_TRACER: &str = "BlockTracer";
pub const BLOCK_INDEXER: &str = "BlockIndexer";
pub const DOWNLOADER: &str = "Downloader";
pub const FS_WRITER: &str = "FsWriter";
pub const DB_WRITER: &str = "DbWriter";
pub const SCHEDULER: &str = "Scheduler";

/// Queue depth of every service's worker pool.
pub(crate) const POOL_CAPACITY: usize = 1024;

/// Answer a command the service does not handle.
pub(crate) fn reject_unsupported(service: &str, command: &Command, returns: Option<ReturnSlot>) {
    warn!(service, command = command.name(), "unsupported command");
    if let Some(slot) = returns {
        slot.send(Reply::Rejected(format!("{service} does not handle '{}'", command.name())));
    }
}
