//! `BlockTracer` — call traces per block or per transaction.
//!
//! Same shape as the fetcher: a retrying worker pool, plus a range queue that
//! fans `trace_blocks_range` out into the trace cache.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use chaincrawl_bus::command::{Command, Reply, ReturnSlot, ServiceMessage, TraceBlockResult, TraceTransactionResult};
use chaincrawl_bus::{
    BackgroundService, EphemeralCache, PoolHandler, RangeQueue, RangeRequest, SlotHandle, WaitGroup, WorkerPool,
};
use chaincrawl_core::retry::RetryPolicy;
use chaincrawl_core::rpc::ChainRpc;

use crate::context::ServiceContext;
use crate::fetcher::SlotDrainer;
use crate::{reject_unsupported, BLOCK_TRACER, POOL_CAPACITY};

pub enum TraceJob {
    Block { number: u64, returns: Option<ReturnSlot> },
    Transaction { hash: String, returns: Option<ReturnSlot> },
    Slot { handle: SlotHandle, index: usize, number: u64, wait: WaitGroup },
}

pub struct TracerCore {
    rpc: Arc<dyn ChainRpc>,
    retry: RetryPolicy,
    cache: Arc<EphemeralCache<TraceBlockResult>>,
}

impl TracerCore {
    pub fn new(rpc: Arc<dyn ChainRpc>, retry: RetryPolicy, cache: Arc<EphemeralCache<TraceBlockResult>>) -> Self {
        Self { rpc, retry, cache }
    }

    pub async fn trace_block(&self, number: u64) -> TraceBlockResult {
        let label = format!("trace_block({number})");
        let outcome = self.retry.run(&label, || self.rpc.trace_block_by_number(number)).await;
        match outcome.result {
            Ok(raw) => TraceBlockResult {
                number,
                traces: Some(raw.traces),
                raw: Some(raw.raw),
                error: None,
                retries: outcome.retries,
            },
            Err(error) => {
                warn!(block = number, attempts = outcome.attempts, error = %error, "block trace failed");
                TraceBlockResult { number, traces: None, raw: None, error: Some(error), retries: outcome.retries }
            }
        }
    }

    pub async fn trace_transaction(&self, hash: String) -> TraceTransactionResult {
        let label = format!("trace_transaction({hash})");
        let outcome = self.retry.run(&label, || self.rpc.trace_transaction(&hash)).await;
        match outcome.result {
            Ok(trace) => TraceTransactionResult { hash, trace: Some(trace), error: None },
            Err(error) => {
                warn!(tx = %hash, error = %error, "transaction trace failed");
                TraceTransactionResult { hash, trace: None, error: Some(error) }
            }
        }
    }
}

#[async_trait]
impl PoolHandler<TraceJob> for TracerCore {
    async fn handle(&self, worker_id: u64, job: TraceJob) {
        match job {
            TraceJob::Block { number, returns } => {
                let result = self.trace_block(number).await;
                if let Some(slot) = returns {
                    slot.send(Reply::Trace(result));
                }
            }
            TraceJob::Transaction { hash, returns } => {
                let result = self.trace_transaction(hash).await;
                if let Some(slot) = returns {
                    slot.send(Reply::TransactionTrace(result));
                }
            }
            TraceJob::Slot { handle, index, number, wait } => {
                let result = self.trace_block(number).await;
                if let Err(e) = self.cache.set_item(&handle, index, result) {
                    warn!(worker_id, block = number, key = handle.key(), error = %e, "dropping trace result");
                }
                wait.done();
            }
        }
    }
}

pub struct BlockTracer {
    pool: Arc<WorkerPool<TraceJob, TracerCore>>,
    ranges: RangeQueue<SlotDrainer<TraceJob, TracerCore, TraceBlockResult>>,
}

impl BlockTracer {
    pub fn new(ctx: &ServiceContext) -> Self {
        let core = TracerCore::new(ctx.rpc.clone(), ctx.retry_policy(), ctx.traces.clone());
        let pool = Arc::new(WorkerPool::new(BLOCK_TRACER, Arc::new(core), POOL_CAPACITY));
        let drainer: SlotDrainer<TraceJob, TracerCore, TraceBlockResult> = SlotDrainer {
            service: BLOCK_TRACER,
            pool: pool.clone(),
            cache: ctx.traces.clone(),
            slot_job: |handle, index, number, wait| TraceJob::Slot { handle, index, number, wait },
            ready: Reply::TracesReady,
        };
        Self { pool, ranges: RangeQueue::new(BLOCK_TRACER, Arc::new(drainer)) }
    }

    async fn submit(&self, job: TraceJob) {
        if let Err(e) = self.pool.submit(job).await {
            warn!(service = BLOCK_TRACER, error = %e, "job dropped");
        }
    }
}

#[async_trait]
impl BackgroundService for BlockTracer {
    fn service_id(&self) -> &str {
        BLOCK_TRACER
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
            Command::TraceBlock { number } => self.submit(TraceJob::Block { number, returns }).await,
            Command::TraceTransaction { hash } => self.submit(TraceJob::Transaction { hash, returns }).await,
            Command::TraceBlocksRange { request_id, from, to } => {
                self.ranges.enqueue(RangeRequest::inclusive(request_id, from, to, returns))
            }
            other => reject_unsupported(BLOCK_TRACER, &other, returns),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chaincrawl_core::error::RpcError;
    use chaincrawl_storage::MemoryStorage;

    use crate::testing::{chain_block, chain_tx, context, tx_hash, MockRpc};

    async fn tracer(rpc: Arc<MockRpc>) -> (BlockTracer, ServiceContext) {
        let (_controller, ctx) = context(rpc, Arc::new(MemoryStorage::new()));
        let tracer = BlockTracer::new(&ctx);
        tracer.set_worker(2).await;
        (tracer, ctx)
    }

    async fn ask(tracer: &BlockTracer, command: Command) -> Reply {
        let (message, rx) = ServiceMessage::expect_returns(command);
        tracer.exec(message).await;
        rx.await.unwrap()
    }

    #[tokio::test]
    async fn block_traces_follow_its_transactions() {
        let rpc = Arc::new(MockRpc::with_chain(1, 3));
        let mut block = chain_block(2, 0);
        block.transactions = vec![chain_tx(&tx_hash(1), &block, 0, None), chain_tx(&tx_hash(2), &block, 1, None)];
        rpc.set_block(block);
        let (tracer, _ctx) = tracer(rpc).await;

        let result = ask(&tracer, Command::TraceBlock { number: 2 }).await.into_trace("trace_block").unwrap();
        assert!(result.is_ok());
        assert_eq!(result.traces.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn transaction_trace_is_returned() {
        let (tracer, _ctx) = tracer(Arc::new(MockRpc::with_chain(1, 3))).await;
        match ask(&tracer, Command::TraceTransaction { hash: "0xabc".into() }).await {
            Reply::TransactionTrace(result) => {
                assert_eq!(result.hash, "0xabc");
                assert!(result.trace.is_some());
            }
            other => panic!("unexpected reply {other:?}"),
        }
    }

    #[tokio::test]
    async fn range_lands_in_trace_cache() {
        let rpc = Arc::new(MockRpc::with_chain(10, 14));
        rpc.fail_always(12, RpcError::NotFound { what: "traces of block 12".into() });
        let (tracer, ctx) = tracer(rpc).await;

        let reply = ask(&tracer, Command::TraceBlocksRange { request_id: "t".into(), from: 10, to: 14 }).await;
        let handle = reply.into_slot_handle("trace_blocks_range").unwrap();
        let results = ctx.traces.take_array(&handle).unwrap();
        let failed: Vec<u64> = results
            .iter()
            .flatten()
            .filter(|r| !r.is_ok())
            .map(|r| r.number)
            .collect();
        assert_eq!(results.len(), 5);
        assert_eq!(failed, vec![12]);
        assert_eq!(ctx.blocks.array_count(), 0);
    }

    #[tokio::test]
    async fn fetch_commands_are_rejected() {
        let (tracer, _ctx) = tracer(Arc::new(MockRpc::with_chain(1, 3))).await;
        assert!(matches!(ask(&tracer, Command::GetBlockNumber).await, Reply::Rejected(_)));
    }
}
