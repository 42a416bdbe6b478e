//! `BlockFetcher` — parallel block retrieval with retry.
//!
//! Single-block requests go straight to the worker pool. Range requests go
//! through a [`RangeQueue`]: its one drainer allocates a slot array in the
//! block cache, fans the numbers out to the pool, waits for every slot, then
//! answers with the cache handle. Workers never wait on the bus, so a full
//! pool cannot deadlock a range.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use chaincrawl_bus::command::{
    Command, GetBlockNumberResult, GetBlockResult, Reply, ReturnSlot, ServiceMessage,
};
use chaincrawl_bus::{
    BackgroundService, EphemeralCache, PoolHandler, RangeDrainer, RangeQueue, RangeRequest, SlotHandle,
    WaitGroup, WorkerPool,
};
use chaincrawl_core::error::RpcError;
use chaincrawl_core::retry::RetryPolicy;
use chaincrawl_core::rpc::ChainRpc;

use crate::context::ServiceContext;
use crate::{reject_unsupported, BLOCK_FETCHER, POOL_CAPACITY};

/// One unit of work for a fetcher worker.
pub enum FetchJob {
    Block { number: u64, returns: Option<ReturnSlot> },
    BlockNumber { returns: Option<ReturnSlot> },
    /// Part of a range: write the result into `handle[index]`.
    Slot { handle: SlotHandle, index: usize, number: u64, wait: WaitGroup },
}

/// What the fetcher workers run.
pub struct FetcherCore {
    rpc: Arc<dyn ChainRpc>,
    retry: RetryPolicy,
    cache: Arc<EphemeralCache<GetBlockResult>>,
}

impl FetcherCore {
    pub fn new(rpc: Arc<dyn ChainRpc>, retry: RetryPolicy, cache: Arc<EphemeralCache<GetBlockResult>>) -> Self {
        Self { rpc, retry, cache }
    }

    /// Fetch one block, retrying per the policy. Never fails: the error is
    /// carried in the result. A block that is not the one asked for is a
    /// decode error.
    pub async fn fetch_block(&self, number: u64) -> GetBlockResult {
        let label = format!("get_block({number})");
        let outcome = self
            .retry
            .run(&label, || async move {
                let raw = self.rpc.get_block_by_number(number).await?;
                raw.block.verify(number)?;
                Ok::<_, RpcError>(raw)
            })
            .await;
        match outcome.result {
            Ok(raw) => GetBlockResult {
                number,
                block: Some(raw.block),
                raw: Some(raw.raw),
                error: None,
                retries: outcome.retries,
            },
            Err(error) => {
                warn!(block = number, attempts = outcome.attempts, error = %error, "block fetch failed");
                GetBlockResult { number, block: None, raw: None, error: Some(error), retries: outcome.retries }
            }
        }
    }

    pub async fn block_number(&self) -> GetBlockNumberResult {
        let outcome = self.retry.run("get_block_number", || self.rpc.get_block_number()).await;
        match outcome.result {
            Ok(number) => GetBlockNumberResult { number: Some(number), error: None },
            Err(error) => {
                warn!(error = %error, "head lookup failed");
                GetBlockNumberResult { number: None, error: Some(error) }
            }
        }
    }
}

#[async_trait]
impl PoolHandler<FetchJob> for FetcherCore {
    async fn handle(&self, worker_id: u64, job: FetchJob) {
        match job {
            FetchJob::Block { number, returns } => {
                let result = self.fetch_block(number).await;
                if let Some(slot) = returns {
                    slot.send(Reply::Block(result));
                }
            }
            FetchJob::BlockNumber { returns } => {
                let result = self.block_number().await;
                if let Some(slot) = returns {
                    slot.send(Reply::BlockNumber(result));
                }
            }
            FetchJob::Slot { handle, index, number, wait } => {
                let result = self.fetch_block(number).await;
                if let Err(e) = self.cache.set_item(&handle, index, result) {
                    warn!(worker_id, block = number, key = handle.key(), error = %e, "dropping block result");
                }
                wait.done();
            }
        }
    }
}

// ─── Range fan-out ───────────────────────────────────────────────────────────

/// Fans one range request out to a pool as per-slot jobs, shared by the
/// fetcher and the tracer.
pub(crate) struct SlotDrainer<J, H, T> {
    pub service: &'static str,
    pub pool: Arc<WorkerPool<J, H>>,
    pub cache: Arc<EphemeralCache<T>>,
    pub slot_job: fn(SlotHandle, usize, u64, WaitGroup) -> J,
    pub ready: fn(SlotHandle) -> Reply,
}

#[async_trait]
impl<J, H, T> RangeDrainer for SlotDrainer<J, H, T>
where
    J: Send + 'static,
    H: PoolHandler<J>,
    T: Send + Sync + 'static,
{
    async fn drain(&self, drainer_id: u64, request: RangeRequest, wait: WaitGroup) {
        let RangeRequest { request_id, numbers, returns } = request;
        let handle = match self.cache.allocate(&request_id, numbers.len()) {
            Ok(handle) => handle,
            Err(e) => {
                warn!(service = self.service, request_id = %request_id, error = %e, "cannot allocate result slots");
                for _ in &numbers {
                    wait.done();
                }
                if let Some(slot) = returns {
                    slot.send(Reply::Rejected(e.to_string()));
                }
                return;
            }
        };

        for (index, number) in numbers.iter().copied().enumerate() {
            let job = (self.slot_job)(handle.clone(), index, number, wait.clone());
            if let Err(e) = self.pool.submit(job).await {
                warn!(service = self.service, block = number, error = %e, "pool closed");
                wait.done();
            }
        }
        wait.wait().await;
        debug!(service = self.service, drainer_id, request_id = %request_id, len = numbers.len(), "range complete");

        if let Some(slot) = returns {
            slot.send((self.ready)(handle));
        }
    }
}

// ─── Service ─────────────────────────────────────────────────────────────────

pub struct BlockFetcher {
    pool: Arc<WorkerPool<FetchJob, FetcherCore>>,
    ranges: RangeQueue<SlotDrainer<FetchJob, FetcherCore, GetBlockResult>>,
}

impl BlockFetcher {
    pub fn new(ctx: &ServiceContext) -> Self {
        let core = FetcherCore::new(ctx.rpc.clone(), ctx.retry_policy(), ctx.blocks.clone());
        let pool = Arc::new(WorkerPool::new(BLOCK_FETCHER, Arc::new(core), POOL_CAPACITY));
        let drainer: SlotDrainer<FetchJob, FetcherCore, GetBlockResult> = SlotDrainer {
            service: BLOCK_FETCHER,
            pool: pool.clone(),
            cache: ctx.blocks.clone(),
            slot_job: |handle, index, number, wait| FetchJob::Slot { handle, index, number, wait },
            ready: Reply::BlocksReady,
        };
        Self { pool, ranges: RangeQueue::new(BLOCK_FETCHER, Arc::new(drainer)) }
    }

    async fn submit(&self, job: FetchJob) {
        // a dropped job drops its return slot, which wakes the caller
        if let Err(e) = self.pool.submit(job).await {
            warn!(service = BLOCK_FETCHER, error = %e, "job dropped");
        }
    }
}

#[async_trait]
impl BackgroundService for BlockFetcher {
    fn service_id(&self) -> &str {
        BLOCK_FETCHER
    }

    async fn set_worker(&self, count: u16) {
        self.pool.set_worker(count).await;
    }

    async fn shutdown(&self) {
        self.pool.shutdown().await;
    }

    fn worker_count(&self) -> u16 {
        self.pool.worker_count()
    }

    async fn exec(&self, message: ServiceMessage) {
        let ServiceMessage { command, returns } = message;
        match command {
            Command::GetBlock { number } => self.submit(FetchJob::Block { number, returns }).await,
            Command::GetBlockNumber => self.submit(FetchJob::BlockNumber { returns }).await,
            Command::GetBlocks { request_id, numbers } => {
                self.ranges.enqueue(RangeRequest { request_id, numbers, returns })
            }
            Command::GetBlocksRange { request_id, from, to } => {
                self.ranges.enqueue(RangeRequest::inclusive(request_id, from, to, returns))
            }
            other => reject_unsupported(BLOCK_FETCHER, &other, returns),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chaincrawl_core::chain::ChainBlock;
    use chaincrawl_storage::MemoryStorage;

    use crate::testing::{chain_block, context, MockRpc};

    async fn fetcher(rpc: Arc<MockRpc>) -> (BlockFetcher, ServiceContext) {
        let (_controller, ctx) = context(rpc, Arc::new(MemoryStorage::new()));
        let fetcher = BlockFetcher::new(&ctx);
        fetcher.set_worker(4).await;
        (fetcher, ctx)
    }

    async fn ask(fetcher: &BlockFetcher, command: Command) -> Reply {
        let (message, rx) = ServiceMessage::expect_returns(command);
        fetcher.exec(message).await;
        rx.await.unwrap()
    }

    #[tokio::test]
    async fn single_block_is_fetched() {
        let (fetcher, _ctx) = fetcher(Arc::new(MockRpc::with_chain(1, 5))).await;
        let result = ask(&fetcher, Command::GetBlock { number: 3 }).await.into_block("get_block").unwrap();
        assert!(result.is_ok());
        assert_eq!(result.number, 3);
        assert_eq!(result.block.unwrap().number_u64(), 3);
        assert!(result.raw.unwrap().contains("0x3"));
    }

    #[tokio::test]
    async fn head_number_is_reported() {
        let (fetcher, _ctx) = fetcher(Arc::new(MockRpc::with_chain(1, 42))).await;
        let result = ask(&fetcher, Command::GetBlockNumber).await.into_block_number("get_block_number").unwrap();
        assert_eq!(result.number, Some(42));
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let rpc = Arc::new(MockRpc::with_chain(1, 5));
        rpc.fail_times(2, RpcError::Transport("reset".into()), 2);
        let (fetcher, _ctx) = fetcher(rpc.clone()).await;
        let result = ask(&fetcher, Command::GetBlock { number: 2 }).await.into_block("get_block").unwrap();
        assert!(result.is_ok());
        assert_eq!(result.retries, 2);
        assert_eq!(rpc.calls().iter().filter(|n| **n == 2).count(), 3);
    }

    #[tokio::test]
    async fn lagging_node_error_is_retried() {
        let rpc = Arc::new(MockRpc::with_chain(95, 105));
        rpc.fail_times(100, RpcError::Rpc { code: -32000, message: "header not found".into() }, 1);
        let (fetcher, _ctx) = fetcher(rpc.clone()).await;
        let result = ask(&fetcher, Command::GetBlock { number: 100 }).await.into_block("get_block").unwrap();
        assert!(result.is_ok());
        assert_eq!(result.retries, 1);
        assert_eq!(rpc.calls().iter().filter(|n| **n == 100).count(), 2);
    }

    #[tokio::test]
    async fn block_with_another_number_is_an_error() {
        let rpc = Arc::new(MockRpc::with_chain(1, 5));
        rpc.set_block_at(3, chain_block(4, 0));
        let (fetcher, _ctx) = fetcher(rpc.clone()).await;
        let result = ask(&fetcher, Command::GetBlock { number: 3 }).await.into_block("get_block").unwrap();
        assert!(!result.is_ok());
        assert_eq!(result.number, 3);
        assert!(result.block.is_none());
        assert!(matches!(result.error, Some(RpcError::Decode(_))));
        // decode errors are final
        assert_eq!(rpc.calls(), vec![3]);
    }

    #[tokio::test]
    async fn block_with_garbled_number_is_an_error() {
        let rpc = Arc::new(MockRpc::with_chain(1, 5));
        rpc.set_block_at(2, ChainBlock { number: "0xnope".into(), ..chain_block(2, 0) });
        let (fetcher, _ctx) = fetcher(rpc).await;
        let result = ask(&fetcher, Command::GetBlock { number: 2 }).await.into_block("get_block").unwrap();
        assert!(matches!(result.error, Some(RpcError::Decode(_))));
    }

    #[tokio::test]
    async fn range_fills_every_slot_in_order() {
        let rpc = Arc::new(MockRpc::with_chain(100, 109));
        rpc.fail_always(104, RpcError::Rpc { code: -32000, message: "missing trie node".into() });
        let (fetcher, ctx) = fetcher(rpc).await;

        let reply = ask(&fetcher, Command::GetBlocksRange { request_id: "r1".into(), from: 100, to: 109 }).await;
        let handle = reply.into_slot_handle("get_blocks_range").unwrap();
        let results = ctx.blocks.take_array(&handle).unwrap();

        assert_eq!(results.len(), 10);
        for (i, result) in results.iter().enumerate() {
            let result = result.as_ref().unwrap();
            assert_eq!(result.number, 100 + i as u64);
            assert_eq!(result.is_ok(), result.number != 104);
        }
        assert_eq!(ctx.blocks.array_count(), 0);
    }

    #[tokio::test]
    async fn explicit_numbers_keep_their_order() {
        let (fetcher, ctx) = fetcher(Arc::new(MockRpc::with_chain(1, 20))).await;
        let reply = ask(&fetcher, Command::GetBlocks { request_id: "picks".into(), numbers: vec![9, 2, 17] }).await;
        let handle = reply.into_slot_handle("get_blocks").unwrap();
        let numbers: Vec<u64> = ctx
            .blocks
            .take_array(&handle)
            .unwrap()
            .into_iter()
            .map(|r| r.unwrap().number)
            .collect();
        assert_eq!(numbers, vec![9, 2, 17]);
    }

    #[tokio::test]
    async fn live_request_id_is_rejected() {
        let (fetcher, ctx) = fetcher(Arc::new(MockRpc::with_chain(1, 5))).await;
        ctx.blocks.allocate("busy", 1).unwrap();
        let reply = ask(&fetcher, Command::GetBlocksRange { request_id: "busy".into(), from: 1, to: 3 }).await;
        assert!(matches!(reply, Reply::Rejected(_)));
    }

    #[tokio::test]
    async fn foreign_command_is_rejected() {
        let (fetcher, _ctx) = fetcher(Arc::new(MockRpc::with_chain(1, 5))).await;
        let reply = ask(&fetcher, Command::TraceBlock { number: 1 }).await;
        assert!(matches!(reply, Reply::Rejected(_)));
    }
}
