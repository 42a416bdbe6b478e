//! `BlockIndexer` — the crash-safe index loop.
//!
//! ```text
//! INIT ─▶ fetch window ─▶ classify ─▶ persist ─▶ advance checkpoint ─┐
//!            ▲   │                                                   │
//!            │   └─ first block reorged: record issue, rewind ───────┤
//!            └───────────────────────── next window ◀────────────────┘
//! ```
//!
//! Within one window, issues are written first, then blocks, then
//! transactions, and only then the checkpoint. A crash anywhere before the
//! checkpoint write replays the window on restart, and replay is harmless:
//! rows compare equal and issues dedup by checksum.

use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use chaincrawl_bus::command::{BatchReport, Command, GetBlockResult, IndexParams, Reply, ServiceMessage};
use chaincrawl_bus::BackgroundService;
use chaincrawl_core::error::{CrawlerError, RpcError};
use chaincrawl_core::issue::Issue;

use crate::classify::{error_issue, leading_reorg, persist, prepare_batch, ClassifyOptions};
use crate::context::ServiceContext;
use crate::{reject_unsupported, BLOCK_FETCHER, BLOCK_INDEXER};

/// Round `end` down so the window stops right before a multiple of
/// `alignment`, keeping at least `start..=start`.
pub fn align_window_end(start: u64, end: u64, alignment: u64) -> u64 {
    if alignment <= 1 {
        return end;
    }
    let aligned = (end.saturating_add(1) / alignment * alignment).saturating_sub(1);
    if aligned >= start {
        aligned
    } else {
        end
    }
}

/// Runs one `index` command to completion.
#[derive(Clone)]
pub struct IndexRunner {
    ctx: ServiceContext,
    options: ClassifyOptions,
    rewind_depth: u64,
    alignment: u64,
}

impl IndexRunner {
    pub fn new(ctx: ServiceContext) -> Self {
        let indexer = &ctx.config.indexer;
        Self {
            options: ClassifyOptions::from_config(indexer),
            rewind_depth: indexer.rewind_depth,
            alignment: indexer.batch_alignment,
            ctx,
        }
    }

    pub async fn run(&self, params: IndexParams) -> Result<BatchReport, CrawlerError> {
        let storage = self.ctx.storage.as_ref();
        let batch_size = params.batch_size.max(1);

        let mut start = params.from;
        if params.use_checkpoint {
            if let Some(checkpoint) = storage.highest_index_block().await? {
                info!(checkpoint, "resuming from checkpoint");
                start = checkpoint;
            }
        }

        let mut report = BatchReport { next_block: start, ..Default::default() };
        // highest block whose reorg sent us back; replay windows must reach it
        let mut pending_reorg: Option<u64> = None;

        loop {
            let head = self.head(params.to).await?;
            let last = params.to.map_or(head, |to| to.min(head));
            if start > last {
                debug!(start, last, "caught up");
                break;
            }

            let mut end = align_window_end(start, start.saturating_add(batch_size - 1).min(last), self.alignment);
            if let Some(reorged) = pending_reorg {
                end = end.max(reorged).min(last);
            }

            let started = Instant::now();
            let results = self.fetch_window(start, end).await?;

            let Some(first) = results.first() else {
                return Err(CrawlerError::WindowUnclassifiable { from: start, to: end, reason: "empty window".into() });
            };
            let Some(first_block) = first.block.as_ref().filter(|_| first.error.is_none()) else {
                let issues: Vec<Issue> = results.iter().filter(|r| !r.is_ok()).map(error_issue).collect();
                storage.save_issues(&issues).await?;
                let reason = first
                    .error
                    .as_ref()
                    .map_or_else(|| "empty result".to_string(), ToString::to_string);
                error!(from = start, to = end, failed = issues.len(), %reason, "first block of window failed");
                return Err(CrawlerError::WindowUnclassifiable { from: start, to: end, reason });
            };

            if self.rewind_depth > 0 && start > 0 {
                if let Some(issue) = leading_reorg(storage, first_block).await? {
                    let rewind_to = start.saturating_sub(self.rewind_depth);
                    warn!(block = start, rewind_to, hash = %issue.block_hash, "reorg at window start, rewinding");
                    // the replay classifies this block again and counts the reorg
                    report.issues += storage.save_issues(&[issue]).await?;
                    pending_reorg = Some(pending_reorg.map_or(start, |r| r.max(start)));
                    start = rewind_to;
                    continue;
                }
            }

            let batch = prepare_batch(storage, &results, self.options).await?;
            let inserted = persist(storage, &batch).await?;
            let next = batch.first_failed().unwrap_or(end + 1);
            storage.save_highest_index_block(next).await?;

            batch.tally(&mut report, inserted);
            report.windows += 1;
            report.next_block = next;
            if pending_reorg.is_some_and(|r| r <= end) {
                pending_reorg = None;
            }

            info!(
                from = start,
                to = end,
                new_blocks = batch.new_blocks.len(),
                changed_blocks = batch.changed_blocks.len(),
                transactions = batch.transactions,
                issues = inserted,
                failed = batch.failed.len(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "persisted batch"
            );
            start = next;
        }

        Ok(report)
    }

    /// The chain head, or `to` when the head cannot be read and an explicit
    /// end was given.
    async fn head(&self, to: Option<u64>) -> Result<u64, CrawlerError> {
        let reply = self.ctx.bus.dispatch_and_wait(BLOCK_FETCHER, Command::GetBlockNumber).await?;
        let result = reply.into_block_number("get_block_number")?;
        match (result.number, result.error, to) {
            (Some(head), _, _) => Ok(head),
            (None, error, Some(to)) => {
                warn!(to, error = ?error, "head unknown, indexing up to the configured end");
                Ok(to)
            }
            (None, error, None) => Err(CrawlerError::Rpc(
                error.unwrap_or_else(|| RpcError::Decode("empty block number".into())),
            )),
        }
    }

    async fn fetch_window(&self, start: u64, end: u64) -> Result<Vec<GetBlockResult>, CrawlerError> {
        let command = Command::GetBlocksRange { request_id: format!("index_{start}_{end}"), from: start, to: end };
        let reply = self.ctx.bus.dispatch_and_wait(BLOCK_FETCHER, command).await?;
        let handle = reply.into_slot_handle("get_blocks_range")?;
        let slots = self.ctx.blocks.take_array(&handle)?;
        Ok(slots
            .into_iter()
            .zip(start..)
            .map(|(slot, number)| {
                slot.unwrap_or_else(|| GetBlockResult {
                    number,
                    block: None,
                    raw: None,
                    error: Some(RpcError::Transport("no result delivered".into())),
                    retries: 0,
                })
            })
            .collect())
    }
}

/// Clears the active flag when the run ends, however it ends.
struct ActiveGuard(Arc<AtomicBool>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct BlockIndexer {
    runner: IndexRunner,
    active: Arc<AtomicBool>,
    workers: AtomicU16,
}

impl BlockIndexer {
    pub fn new(ctx: &ServiceContext) -> Self {
        Self {
            runner: IndexRunner::new(ctx.clone()),
            active: Arc::new(AtomicBool::new(false)),
            workers: AtomicU16::new(0),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    fn start(&self, params: IndexParams, message: ServiceMessage) {
        if self.workers.load(Ordering::SeqCst) == 0 {
            message.reply(Reply::Rejected(format!("{BLOCK_INDEXER} has no workers")));
            return;
        }
        if self
            .active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("index already running");
            message.reply(Reply::Rejected("index is already running".into()));
            return;
        }

        let guard = ActiveGuard(self.active.clone());
        let runner = self.runner.clone();
        tokio::spawn(async move {
            info!(from = params.from, to = ?params.to, batch = params.batch_size, "index started");
            let outcome = runner.run(params).await;
            drop(guard);
            match outcome {
                Ok(report) => {
                    info!(windows = report.windows, next_block = report.next_block, "index finished");
                    message.reply(Reply::Indexed(report));
                }
                Err(e) if e.is_storage() => {
                    error!(error = %e, "storage failure, stopping the crawler");
                    message.reply(Reply::Failed(e.to_string()));
                    if let Err(e) = runner.ctx.bus.exit().await {
                        warn!(error = %e, "exit request not delivered");
                    }
                }
                Err(e) => {
                    error!(error = %e, "index failed");
                    message.reply(Reply::Failed(e.to_string()));
                }
            }
        });
    }
}

#[async_trait]
impl BackgroundService for BlockIndexer {
    fn service_id(&self) -> &str {
        BLOCK_INDEXER
    }

    async fn set_worker(&self, count: u16) {
        // one run at a time; the count only gates whether runs are accepted
        self.workers.store(count, Ordering::SeqCst);
    }

    fn worker_count(&self) -> u16 {
        self.workers.load(Ordering::SeqCst)
    }

    async fn exec(&self, message: ServiceMessage) {
        match &message.command {
            Command::Index(params) => {
                let params = params.clone();
                self.start(params, message);
            }
            _ => {
                let ServiceMessage { command, returns } = message;
                reject_unsupported(BLOCK_INDEXER, &command, returns);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chaincrawl_core::issue::IssueKind;
    use chaincrawl_core::model::BlockRow;
    use chaincrawl_core::storage::Storage;
    use chaincrawl_storage::{FailPoint, MemoryStorage};

    use crate::testing::{block_hash, chain_block, chain_tx, runtime, tx_hash, MockRpc};

    fn params(from: u64, to: u64) -> IndexParams {
        IndexParams { from, to: Some(to), batch_size: 10, use_checkpoint: true }
    }

    #[test]
    fn window_end_alignment() {
        assert_eq!(align_window_end(95, 194, 1), 194);
        assert_eq!(align_window_end(95, 194, 100), 99);
        assert_eq!(align_window_end(100, 199, 100), 199);
        // would leave nothing: keep the unaligned end
        assert_eq!(align_window_end(101, 150, 100), 150);
    }

    #[tokio::test]
    async fn clean_window_is_indexed() {
        let rpc = Arc::new(MockRpc::with_chain(100, 109));
        let storage = Arc::new(MemoryStorage::new());
        let rt = runtime(rpc, storage.clone()).await;

        let report = rt.index(params(100, 109)).await.unwrap();
        assert_eq!(report.new_blocks, 10);
        assert_eq!(report.next_block, 110);
        assert_eq!(storage.block_count(), 10);
        assert_eq!(storage.highest_index_block().await.unwrap(), Some(110));
        assert!(storage.issues().await.unwrap().is_empty());
        rt.shutdown().await;
    }

    #[tokio::test]
    async fn reorg_at_window_start_rewinds_without_persisting() {
        let rpc = Arc::new(MockRpc::with_chain(95, 114));
        rpc.set_block(chain_block(105, 1));
        let storage = Arc::new(MemoryStorage::new());
        storage.insert_block(BlockRow::from_chain(&chain_block(105, 0)));
        // stop the replay window at its first block
        rpc.fail_always(95, RpcError::Rpc { code: -32000, message: "pruned".into() });
        let rt = runtime(rpc.clone(), storage.clone()).await;

        let err = rt.index(IndexParams { from: 105, to: Some(114), batch_size: 10, use_checkpoint: false }).await;
        assert!(err.is_err());

        let issues = storage.issues().await.unwrap();
        let reorgs: Vec<_> = issues.iter().filter(|i| i.kind == IssueKind::Reorg).collect();
        assert_eq!(reorgs.len(), 1);
        assert_eq!(reorgs[0].block_number, 105);
        assert_eq!(reorgs[0].block_hash, block_hash(105, 1));
        assert_eq!(storage.block(105).unwrap().hash, block_hash(105, 0));
        assert_eq!(storage.block_count(), 1);
        assert_eq!(storage.highest_index_block().await.unwrap(), None);
        // the replay started at 105 - 10
        assert!(rpc.calls().contains(&95));
        rt.shutdown().await;
    }

    #[tokio::test]
    async fn reorg_replay_repairs_the_block() {
        let rpc = Arc::new(MockRpc::with_chain(95, 114));
        rpc.set_block(chain_block(105, 1));
        let storage = Arc::new(MemoryStorage::new());
        storage.insert_block(BlockRow::from_chain(&chain_block(105, 0)));
        let rt = runtime(rpc, storage.clone()).await;

        let report = rt.index(IndexParams { from: 105, to: Some(114), batch_size: 10, use_checkpoint: false }).await.unwrap();
        assert_eq!(report.next_block, 115);
        assert_eq!(storage.block(105).unwrap().hash, block_hash(105, 1));
        assert_eq!(storage.block_count(), 20);
        assert_eq!(storage.highest_index_block().await.unwrap(), Some(115));
        let issues = storage.issues().await.unwrap();
        assert_eq!(issues.iter().filter(|i| i.kind == IssueKind::Reorg).count(), 1);
        assert_eq!(report.reorgs, 1);
        assert_eq!(report.issues, issues.len());
        rt.shutdown().await;
    }

    #[tokio::test]
    async fn failed_block_holds_the_checkpoint() {
        let rpc = Arc::new(MockRpc::with_chain(100, 109));
        rpc.fail_always(104, RpcError::Rpc { code: -32000, message: "missing".into() });
        let storage = Arc::new(MemoryStorage::new());
        let rt = runtime(rpc, storage.clone()).await;

        // the second window starts at 104 and cannot be classified
        let err = rt.index(params(100, 109)).await.unwrap_err();
        assert!(err.to_string().contains("104"), "{err}");
        assert_eq!(storage.highest_index_block().await.unwrap(), Some(104));
        assert_eq!(storage.block_count(), 9);
        let errors = storage.issues().await.unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].kind, IssueKind::Error);
        rt.shutdown().await;
    }

    #[tokio::test]
    async fn replay_is_idempotent() {
        let rpc = Arc::new(MockRpc::with_chain(100, 109));
        let mut block = chain_block(103, 0);
        block.transactions = vec![chain_tx(&tx_hash(1), &block, 0, None)];
        rpc.set_block(block);
        let storage = Arc::new(MemoryStorage::new());
        let rt = runtime(rpc, storage.clone()).await;

        let first = rt.index(params(100, 109)).await.unwrap();
        let second = rt.index(IndexParams { use_checkpoint: false, ..params(100, 109) }).await.unwrap();
        assert_eq!(first.new_blocks, 10);
        assert_eq!(first.new_transactions, 1);
        assert_eq!(second.new_blocks, 0);
        assert_eq!(second.changed_blocks, 0);
        assert_eq!(second.new_transactions + second.changed_transactions, 0);
        assert_eq!(storage.block_count(), 10);
        assert_eq!(storage.transaction_count(), 1);
        assert!(storage.issues().await.unwrap().is_empty());
        rt.shutdown().await;
    }

    #[tokio::test]
    async fn transaction_moving_blocks_is_rebound() {
        let rpc = Arc::new(MockRpc::with_chain(100, 109));
        let storage = Arc::new(MemoryStorage::new());
        let old = chain_block(50, 0);
        storage.insert_transaction(chaincrawl_core::model::TransactionRow::from_chain(
            &chain_tx(&tx_hash(9), &old, 0, None),
            &old,
        ));
        let mut block = chain_block(107, 0);
        block.transactions = vec![chain_tx(&tx_hash(9), &block, 0, None)];
        rpc.set_block(block);
        let rt = runtime(rpc, storage.clone()).await;

        rt.index(params(100, 109)).await.unwrap();
        assert_eq!(storage.transaction(&tx_hash(9)).unwrap().block_number, 107);
        let issues = storage.issues().await.unwrap();
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].kind, IssueKind::DuplicatedTxHash);
        rt.shutdown().await;
    }

    #[tokio::test]
    async fn resumes_from_checkpoint() {
        let rpc = Arc::new(MockRpc::with_chain(100, 129));
        let storage = Arc::new(MemoryStorage::new());
        storage.save_highest_index_block(120).await.unwrap();
        let rt = runtime(rpc.clone(), storage.clone()).await;

        let report = rt.index(params(100, 129)).await.unwrap();
        assert_eq!(report.new_blocks, 10);
        assert!(rpc.calls().iter().all(|n| *n >= 120));
        rt.shutdown().await;
    }

    #[tokio::test]
    async fn follows_the_head_when_no_end_is_given() {
        let rpc = Arc::new(MockRpc::with_chain(0, 25));
        let storage = Arc::new(MemoryStorage::new());
        let rt = runtime(rpc, storage.clone()).await;

        let report = rt
            .index(IndexParams { from: 0, to: None, batch_size: 10, use_checkpoint: true })
            .await
            .unwrap();
        assert_eq!(report.windows, 3);
        assert_eq!(report.next_block, 26);
        rt.shutdown().await;
    }

    #[tokio::test]
    async fn second_run_is_rejected_while_active() {
        let rpc = Arc::new(MockRpc::with_chain(0, 5));
        let storage = Arc::new(MemoryStorage::new());
        let (_controller, ctx) = crate::testing::context(rpc, storage);
        let indexer = BlockIndexer::new(&ctx);
        indexer.set_worker(1).await;
        indexer.active.store(true, Ordering::SeqCst);

        let (message, rx) = ServiceMessage::expect_returns(Command::Index(params(0, 5)));
        indexer.exec(message).await;
        assert!(matches!(rx.await.unwrap(), Reply::Rejected(_)));
    }

    #[tokio::test]
    async fn storage_failure_stops_the_bus() {
        let rpc = Arc::new(MockRpc::with_chain(100, 109));
        let storage = Arc::new(MemoryStorage::new());
        storage.fail_on(FailPoint::SaveBlocks);
        let rt = runtime(rpc, storage.clone()).await;

        let err = rt.index(params(100, 109)).await.unwrap_err();
        assert!(err.to_string().contains("injected failure"), "{err}");
        tokio::time::timeout(std::time::Duration::from_secs(5), rt.controller().wait_exit())
            .await
            .unwrap();
        assert!(rt.controller().is_exited());
        assert_eq!(storage.highest_index_block().await.unwrap(), None);
    }
}
