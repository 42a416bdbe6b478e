//! The storage collaborator.
//!
//! Implementations live in `chaincrawl-storage` (memory, SQLite, Postgres).
//! Both `save_*` pairs must be all-or-nothing, and `save_issues` must ignore
//! issues whose checksum is already stored.

use async_trait::async_trait;

use crate::error::CrawlerError;
use crate::issue::Issue;
use crate::model::{BlockRow, Checkpoint, CheckpointKind, TransactionRow};

#[async_trait]
pub trait Storage: Send + Sync {
    /// Create tables and indexes if they do not exist yet.
    async fn migrate(&self) -> Result<(), CrawlerError>;

    /// Rows for the given block numbers (missing numbers are skipped).
    async fn get_blocks(&self, numbers: &[u64]) -> Result<Vec<BlockRow>, CrawlerError>;

    /// Rows whose hash is one of `hashes`.
    async fn get_blocks_by_hashes(&self, hashes: &[String]) -> Result<Vec<BlockRow>, CrawlerError>;

    /// Insert `new` and overwrite `changed` in a single transaction.
    async fn save_blocks(&self, new: &[BlockRow], changed: &[BlockRow]) -> Result<(), CrawlerError>;

    async fn get_transactions(&self, hashes: &[String]) -> Result<Vec<TransactionRow>, CrawlerError>;

    /// Insert `new` and overwrite `changed` in a single transaction.
    async fn save_transactions(
        &self,
        new: &[TransactionRow],
        changed: &[TransactionRow],
    ) -> Result<(), CrawlerError>;

    async fn get_checkpoint(&self, kind: CheckpointKind) -> Result<Option<Checkpoint>, CrawlerError>;

    /// Upsert a checkpoint. The stored value never decreases.
    async fn save_checkpoint(&self, kind: CheckpointKind, block_number: u64) -> Result<(), CrawlerError>;

    /// Persist issues, skipping known checksums. Returns the number inserted.
    async fn save_issues(&self, issues: &[Issue]) -> Result<usize, CrawlerError>;

    /// All stored issues, oldest first.
    async fn issues(&self) -> Result<Vec<Issue>, CrawlerError>;

    async fn highest_index_block(&self) -> Result<Option<u64>, CrawlerError> {
        Ok(self.get_checkpoint(CheckpointKind::Index).await?.map(|c| c.block_number))
    }

    async fn save_highest_index_block(&self, block_number: u64) -> Result<(), CrawlerError> {
        self.save_checkpoint(CheckpointKind::Index, block_number).await
    }

    async fn highest_trace_block(&self) -> Result<Option<u64>, CrawlerError> {
        Ok(self.get_checkpoint(CheckpointKind::Trace).await?.map(|c| c.block_number))
    }

    async fn save_highest_trace_block(&self, block_number: u64) -> Result<(), CrawlerError> {
        self.save_checkpoint(CheckpointKind::Trace, block_number).await
    }
}
