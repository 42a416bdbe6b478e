//! Diff-and-classify: turn fetched blocks into rows to write and issues to
//! record, against what storage already holds.
//!
//! Shared by the indexer (window by window) and the database writer
//! (arbitrary block lists). Nothing here writes except [`persist`].

use std::collections::{BTreeSet, HashMap};

use tracing::debug;

use chaincrawl_bus::command::{BatchReport, GetBlockResult};
use chaincrawl_core::chain::ChainBlock;
use chaincrawl_core::config::IndexerConfig;
use chaincrawl_core::error::CrawlerError;
use chaincrawl_core::issue::Issue;
use chaincrawl_core::model::{BlockRow, TransactionRow};
use chaincrawl_core::storage::Storage;

use crate::signer::apply_signers;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassifyOptions {
    pub recover_signers: bool,
    pub index_transactions: bool,
}

impl ClassifyOptions {
    pub fn from_config(config: &IndexerConfig) -> Self {
        Self {
            recover_signers: config.recover_signers,
            index_transactions: config.index_transactions,
        }
    }
}

/// Everything one classification pass decided.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchData {
    pub new_blocks: Vec<BlockRow>,
    pub changed_blocks: Vec<BlockRow>,
    pub new_transactions: Vec<TransactionRow>,
    pub changed_transactions: Vec<TransactionRow>,
    /// Transactions carried by the fetched blocks.
    pub transactions: usize,
    pub issues: Vec<Issue>,
    /// Numbers whose fetch failed, in result order.
    pub failed: Vec<u64>,
    pub reorgs: usize,
}

impl BatchData {
    pub fn first_failed(&self) -> Option<u64> {
        self.failed.iter().min().copied()
    }

    /// Add this batch's counts to `report`. Issues count as `inserted`, what
    /// [`persist`] reported storing; an issue already on record is not new.
    pub fn tally(&self, report: &mut BatchReport, inserted: usize) {
        report.new_blocks += self.new_blocks.len();
        report.changed_blocks += self.changed_blocks.len();
        report.new_transactions += self.new_transactions.len();
        report.changed_transactions += self.changed_transactions.len();
        report.transactions += self.transactions;
        report.issues += inserted;
        report.failed_blocks += self.failed.len();
        report.reorgs += self.reorgs;
    }
}

/// The `error` issue recorded for a failed fetch.
pub fn error_issue(result: &GetBlockResult) -> Issue {
    let message = result
        .error
        .as_ref()
        .map_or_else(|| "empty result".to_string(), ToString::to_string);
    Issue::error(result.number, "", "", message)
}

/// The stored row for the first block of a window, if its hash differs from
/// the fetched one.
pub async fn leading_reorg(storage: &dyn Storage, first: &ChainBlock) -> Result<Option<Issue>, CrawlerError> {
    let number = first.number_u64();
    let hash = first.hash_normalized();
    let stored = storage.get_blocks(&[number]).await?;
    Ok(stored
        .into_iter()
        .find(|row| row.number == number && row.hash != hash)
        .map(|row| Issue::reorg(number, &row.hash, &hash)))
}

/// Classify `results` against storage.
pub async fn prepare_batch(
    storage: &dyn Storage,
    results: &[GetBlockResult],
    options: ClassifyOptions,
) -> Result<BatchData, CrawlerError> {
    let mut batch = BatchData::default();

    let mut fetched: Vec<(&ChainBlock, BlockRow)> = Vec::with_capacity(results.len());
    for result in results {
        match (&result.block, &result.error) {
            (Some(block), None) => {
                if let Err(e) = block.verify(result.number) {
                    debug!(block = result.number, error = %e, "rejecting fetched block");
                    batch.issues.push(Issue::error(result.number, "", "", e.to_string()));
                    batch.failed.push(result.number);
                    continue;
                }
                let mut row = BlockRow::from_chain(block);
                if options.recover_signers {
                    apply_signers(&mut row, block);
                }
                batch.transactions += block.transactions.len();
                fetched.push((block, row));
            }
            _ => {
                batch.issues.push(error_issue(result));
                batch.failed.push(result.number);
            }
        }
    }
    if fetched.is_empty() {
        return Ok(batch);
    }

    // stored rows for the fetched numbers and their parents
    let lookup: BTreeSet<u64> = fetched
        .iter()
        .flat_map(|(_, row)| [Some(row.number), row.number.checked_sub(1)])
        .flatten()
        .collect();
    let lookup: Vec<u64> = lookup.into_iter().collect();
    let stored: HashMap<u64, BlockRow> =
        storage.get_blocks(&lookup).await?.into_iter().map(|row| (row.number, row)).collect();

    let hashes: Vec<String> = fetched.iter().map(|(_, row)| row.hash.clone()).collect();
    let owners: HashMap<String, u64> = storage
        .get_blocks_by_hashes(&hashes)
        .await?
        .into_iter()
        .map(|row| (row.hash, row.number))
        .collect();

    let window_times: HashMap<u64, i64> = fetched.iter().map(|(_, row)| (row.number, row.timestamp)).collect();
    let mut window_hashes: HashMap<String, u64> = HashMap::new();
    let mut txs: Vec<TransactionRow> = Vec::new();
    let mut tx_slots: HashMap<String, usize> = HashMap::new();

    for (block, mut row) in fetched {
        let parent_time = row.number.checked_sub(1).and_then(|parent| {
            window_times
                .get(&parent)
                .copied()
                .or_else(|| stored.get(&parent).map(|r| r.timestamp))
        });
        row.mint_duration = parent_time
            .filter(|t| row.timestamp >= *t)
            .map(|t| (row.timestamp - t) as u64);

        if let Some(&owner) = owners.get(&row.hash) {
            if owner != row.number {
                batch.issues.push(Issue::duplicated_block_hash(&row.hash, row.number, owner));
            }
        }
        if let Some(prev) = window_hashes.insert(row.hash.clone(), row.number) {
            if prev != row.number && owners.get(&row.hash) != Some(&prev) {
                batch.issues.push(Issue::duplicated_block_hash(&row.hash, row.number, prev));
            }
        }

        if options.index_transactions {
            for tx in &block.transactions {
                let tx_row = TransactionRow::from_chain(tx, block);
                match tx_slots.get(&tx_row.hash) {
                    Some(&slot) => {
                        let prev = &txs[slot];
                        if prev.block_number != tx_row.block_number {
                            batch.issues.push(Issue::duplicated_tx_hash(
                                &tx_row.hash,
                                tx_row.block_number,
                                &tx_row.block_hash,
                                prev.block_number,
                                &prev.block_hash,
                            ));
                        }
                        txs[slot] = tx_row;
                    }
                    None => {
                        tx_slots.insert(tx_row.hash.clone(), txs.len());
                        txs.push(tx_row);
                    }
                }
            }
        }

        match stored.get(&row.number) {
            None => batch.new_blocks.push(row),
            Some(old) if old.hash != row.hash => {
                debug!(block = row.number, old = %old.hash, new = %row.hash, "block hash changed");
                batch.issues.push(Issue::reorg(row.number, &old.hash, &row.hash));
                batch.reorgs += 1;
                batch.changed_blocks.push(row);
            }
            Some(old) if *old == row => {}
            Some(_) => batch.changed_blocks.push(row),
        }
    }

    if !txs.is_empty() {
        classify_transactions(storage, txs, &mut batch).await?;
    }
    Ok(batch)
}

async fn classify_transactions(
    storage: &dyn Storage,
    txs: Vec<TransactionRow>,
    batch: &mut BatchData,
) -> Result<(), CrawlerError> {
    let hashes: Vec<String> = txs.iter().map(|tx| tx.hash.clone()).collect();
    let stored: HashMap<String, TransactionRow> = storage
        .get_transactions(&hashes)
        .await?
        .into_iter()
        .map(|tx| (tx.hash.clone(), tx))
        .collect();

    for tx in txs {
        match stored.get(&tx.hash) {
            None => batch.new_transactions.push(tx),
            Some(old) if old.block_number != tx.block_number => {
                batch.issues.push(Issue::duplicated_tx_hash(
                    &tx.hash,
                    tx.block_number,
                    &tx.block_hash,
                    old.block_number,
                    &old.block_hash,
                ));
                batch.changed_transactions.push(tx);
            }
            Some(old) if *old == tx => {}
            Some(_) => batch.changed_transactions.push(tx),
        }
    }
    Ok(())
}

/// Write a batch: issues, then blocks, then transactions. Returns the number
/// of issues storage actually inserted.
pub async fn persist(storage: &dyn Storage, batch: &BatchData) -> Result<usize, CrawlerError> {
    let inserted = if batch.issues.is_empty() { 0 } else { storage.save_issues(&batch.issues).await? };
    if !batch.new_blocks.is_empty() || !batch.changed_blocks.is_empty() {
        storage.save_blocks(&batch.new_blocks, &batch.changed_blocks).await?;
    }
    if !batch.new_transactions.is_empty() || !batch.changed_transactions.is_empty() {
        storage
            .save_transactions(&batch.new_transactions, &batch.changed_transactions)
            .await?;
    }
    Ok(inserted)
}
