//! In-memory storage backend.
//!
//! Keeps blocks, transactions, checkpoints, and issues in RAM. Used by tests
//! and dry runs; everything is lost when the process exits.
//!
//! Writes can be made to fail on purpose with [`MemoryStorage::fail_on`], so
//! callers' failure paths can be exercised without a real database.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;

use chaincrawl_core::error::CrawlerError;
use chaincrawl_core::issue::Issue;
use chaincrawl_core::model::{BlockRow, Checkpoint, CheckpointKind, TransactionRow};
use chaincrawl_core::storage::Storage;

/// A write operation that can be told to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailPoint {
    SaveBlocks,
    SaveTransactions,
    SaveCheckpoint,
    SaveIssues,
}

#[derive(Default)]
struct Tables {
    blocks: BTreeMap<u64, BlockRow>,
    transactions: HashMap<String, TransactionRow>,
    checkpoints: HashMap<CheckpointKind, Checkpoint>,
    issues: Vec<Issue>,
    checksums: HashSet<String>,
}

#[derive(Default)]
pub struct MemoryStorage {
    tables: Mutex<Tables>,
    failures: Mutex<HashSet<FailPoint>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every later call of `point` fail until [`clear_failures`](Self::clear_failures).
    pub fn fail_on(&self, point: FailPoint) {
        self.failures.lock().unwrap().insert(point);
    }

    pub fn clear_failures(&self) {
        self.failures.lock().unwrap().clear();
    }

    /// Seed a block row directly.
    pub fn insert_block(&self, row: BlockRow) {
        self.tables.lock().unwrap().blocks.insert(row.number, row);
    }

    /// Seed a transaction row directly.
    pub fn insert_transaction(&self, row: TransactionRow) {
        self.tables.lock().unwrap().transactions.insert(row.hash.clone(), row);
    }

    pub fn block(&self, number: u64) -> Option<BlockRow> {
        self.tables.lock().unwrap().blocks.get(&number).cloned()
    }

    pub fn block_count(&self) -> usize {
        self.tables.lock().unwrap().blocks.len()
    }

    pub fn transaction(&self, hash: &str) -> Option<TransactionRow> {
        self.tables.lock().unwrap().transactions.get(hash).cloned()
    }

    pub fn transaction_count(&self) -> usize {
        self.tables.lock().unwrap().transactions.len()
    }

    pub fn issue_count(&self) -> usize {
        self.tables.lock().unwrap().issues.len()
    }

    fn check(&self, point: FailPoint) -> Result<(), CrawlerError> {
        if self.failures.lock().unwrap().contains(&point) {
            return Err(CrawlerError::Storage(format!("injected failure: {point:?}")));
        }
        Ok(())
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn migrate(&self) -> Result<(), CrawlerError> {
        Ok(())
    }

    async fn get_blocks(&self, numbers: &[u64]) -> Result<Vec<BlockRow>, CrawlerError> {
        let tables = self.tables.lock().unwrap();
        Ok(numbers.iter().filter_map(|n| tables.blocks.get(n).cloned()).collect())
    }

    async fn get_blocks_by_hashes(&self, hashes: &[String]) -> Result<Vec<BlockRow>, CrawlerError> {
        let wanted: HashSet<&str> = hashes.iter().map(String::as_str).collect();
        let tables = self.tables.lock().unwrap();
        Ok(tables
            .blocks
            .values()
            .filter(|b| wanted.contains(b.hash.as_str()))
            .cloned()
            .collect())
    }

    async fn save_blocks(&self, new: &[BlockRow], changed: &[BlockRow]) -> Result<(), CrawlerError> {
        self.check(FailPoint::SaveBlocks)?;
        let mut tables = self.tables.lock().unwrap();
        for row in new.iter().chain(changed) {
            tables.blocks.insert(row.number, row.clone());
        }
        Ok(())
    }

    async fn get_transactions(&self, hashes: &[String]) -> Result<Vec<TransactionRow>, CrawlerError> {
        let tables = self.tables.lock().unwrap();
        Ok(hashes.iter().filter_map(|h| tables.transactions.get(h).cloned()).collect())
    }

    async fn save_transactions(
        &self,
        new: &[TransactionRow],
        changed: &[TransactionRow],
    ) -> Result<(), CrawlerError> {
        self.check(FailPoint::SaveTransactions)?;
        let mut tables = self.tables.lock().unwrap();
        for row in new.iter().chain(changed) {
            tables.transactions.insert(row.hash.clone(), row.clone());
        }
        Ok(())
    }

    async fn get_checkpoint(&self, kind: CheckpointKind) -> Result<Option<Checkpoint>, CrawlerError> {
        Ok(self.tables.lock().unwrap().checkpoints.get(&kind).cloned())
    }

    async fn save_checkpoint(&self, kind: CheckpointKind, block_number: u64) -> Result<(), CrawlerError> {
        self.check(FailPoint::SaveCheckpoint)?;
        let mut tables = self.tables.lock().unwrap();
        let next = tables
            .checkpoints
            .get(&kind)
            .map_or(block_number, |c| c.block_number.max(block_number));
        tables.checkpoints.insert(kind, Checkpoint::new(kind, next));
        Ok(())
    }

    async fn save_issues(&self, issues: &[Issue]) -> Result<usize, CrawlerError> {
        self.check(FailPoint::SaveIssues)?;
        let mut tables = self.tables.lock().unwrap();
        let mut inserted = 0;
        for issue in issues {
            if tables.checksums.insert(issue.checksum.clone()) {
                tables.issues.push(issue.clone());
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    async fn issues(&self) -> Result<Vec<Issue>, CrawlerError> {
        Ok(self.tables.lock().unwrap().issues.clone())
    }
}
