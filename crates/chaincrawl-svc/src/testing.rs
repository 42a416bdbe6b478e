//! Test doubles shared by the service tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};

use chaincrawl_bus::ServiceController;
use chaincrawl_core::chain::{ChainBlock, ChainTransaction};
use chaincrawl_core::config::CrawlerConfig;
use chaincrawl_core::error::{CrawlerError, RpcError};
use chaincrawl_core::fs::FileSystem;
use chaincrawl_core::retry::RetryConfig;
use chaincrawl_core::rpc::{ChainRpc, RawBlock, RawTrace};
use chaincrawl_core::storage::Storage;
use chaincrawl_storage::MemoryStorage;

use crate::context::ServiceContext;
use crate::runtime::CrawlerRuntime;

/// Block hash for `number` on fork `fork`.
pub fn block_hash(number: u64, fork: u8) -> String {
    format!("0x{fork:02x}{number:062x}")
}

pub fn tx_hash(seed: u64) -> String {
    format!("0x{seed:064x}")
}

/// A block on fork `fork` with 12-second spacing and no transactions.
pub fn chain_block(number: u64, fork: u8) -> ChainBlock {
    ChainBlock {
        number: format!("{number:#x}"),
        hash: block_hash(number, fork),
        parent_hash: block_hash(number.saturating_sub(1), fork),
        miner: "0x00000000000000000000000000000000000000aa".into(),
        difficulty: "0x2".into(),
        total_difficulty: format!("{:#x}", number * 2),
        size: "0x220".into(),
        gas_limit: "0x1c9c380".into(),
        gas_used: "0x0".into(),
        timestamp: format!("{:#x}", 1_700_000_000 + number * 12),
        extra_data: "0x".into(),
        ..Default::default()
    }
}

pub fn chain_tx(hash: &str, block: &ChainBlock, index: u64, to: Option<&str>) -> ChainTransaction {
    ChainTransaction {
        hash: hash.into(),
        block_number: block.number.clone(),
        block_hash: block.hash.clone(),
        transaction_index: format!("{index:#x}"),
        from: "0x00000000000000000000000000000000000000f1".into(),
        to: to.map(str::to_string),
        value: "0xde0b6b3a7640000".into(),
        nonce: "0x1".into(),
        gas: "0x5208".into(),
        gas_price: "0x3b9aca00".into(),
        input: "0x".into(),
    }
}

/// Scripted chain node.
#[derive(Default)]
pub struct MockRpc {
    blocks: Mutex<HashMap<u64, ChainBlock>>,
    /// Errors returned (front first) before the real answer.
    scripted: Mutex<HashMap<u64, VecDeque<RpcError>>>,
    broken: Mutex<HashMap<u64, RpcError>>,
    head: AtomicU64,
    calls: Mutex<Vec<u64>>,
}

impl MockRpc {
    /// Blocks `from..=to` on fork 0; the head is `to`.
    pub fn with_chain(from: u64, to: u64) -> Self {
        let rpc = Self::default();
        for n in from..=to {
            rpc.set_block(chain_block(n, 0));
        }
        rpc.head.store(to, Ordering::SeqCst);
        rpc
    }

    pub fn set_block(&self, block: ChainBlock) {
        self.blocks.lock().unwrap().insert(block.number_u64(), block);
    }

    /// Answer requests for `number` with `block`, whatever its own number says.
    pub fn set_block_at(&self, number: u64, block: ChainBlock) {
        self.blocks.lock().unwrap().insert(number, block);
    }

    pub fn set_head(&self, head: u64) {
        self.head.store(head, Ordering::SeqCst);
    }

    /// Fail the next `times` calls for `number` with `error`.
    pub fn fail_times(&self, number: u64, error: RpcError, times: usize) {
        let mut scripted = self.scripted.lock().unwrap();
        let queue = scripted.entry(number).or_default();
        for _ in 0..times {
            queue.push_back(error.clone());
        }
    }

    /// Fail every call for `number`.
    pub fn fail_always(&self, number: u64, error: RpcError) {
        self.broken.lock().unwrap().insert(number, error);
    }

    /// Block numbers requested so far, in call order.
    pub fn calls(&self) -> Vec<u64> {
        self.calls.lock().unwrap().clone()
    }

    fn answer(&self, number: u64) -> Result<ChainBlock, RpcError> {
        self.calls.lock().unwrap().push(number);
        if let Some(err) = self.broken.lock().unwrap().get(&number) {
            return Err(err.clone());
        }
        if let Some(err) = self.scripted.lock().unwrap().get_mut(&number).and_then(VecDeque::pop_front) {
            return Err(err);
        }
        self.blocks
            .lock()
            .unwrap()
            .get(&number)
            .cloned()
            .ok_or_else(|| RpcError::NotFound { what: format!("block {number}") })
    }
}

#[async_trait]
impl ChainRpc for MockRpc {
    async fn get_block_by_number(&self, number: u64) -> Result<RawBlock, RpcError> {
        let block = self.answer(number)?;
        let raw = serde_json::to_string(&block).map_err(|e| RpcError::Decode(e.to_string()))?;
        Ok(RawBlock { block, raw })
    }

    async fn get_block_number(&self) -> Result<u64, RpcError> {
        Ok(self.head.load(Ordering::SeqCst))
    }

    async fn trace_block_by_number(&self, number: u64) -> Result<RawTrace, RpcError> {
        let block = self.answer(number)?;
        let traces: Vec<Value> = block
            .transactions
            .iter()
            .map(|tx| json!({ "txHash": tx.hash, "result": { "type": "CALL" } }))
            .collect();
        let raw = Value::Array(traces.clone()).to_string();
        Ok(RawTrace { traces, raw })
    }

    async fn trace_transaction(&self, hash: &str) -> Result<Value, RpcError> {
        Ok(json!({ "type": "CALL", "hash": hash }))
    }
}

/// Records writes instead of touching the disk.
#[derive(Default)]
pub struct MemoryFs {
    pub files: Mutex<HashMap<std::path::PathBuf, Vec<u8>>>,
}

#[async_trait]
impl FileSystem for MemoryFs {
    async fn write_file(&self, path: &std::path::Path, bytes: &[u8]) -> Result<(), CrawlerError> {
        self.files.lock().unwrap().insert(path.to_path_buf(), bytes.to_vec());
        Ok(())
    }
}

/// Config with instant retries and small pools.
pub fn test_config() -> CrawlerConfig {
    let mut config = CrawlerConfig::default();
    config.retry = RetryConfig { max_retries: 3, min_gap_ms: 0, max_gap_ms: 0 };
    config.workers.block_fetcher = 4;
    config.workers.block_tracer = 2;
    config.indexer.recover_signers = false;
    config.indexer.index_transactions = true;
    config
}

/// A context over a controller that is never started; for driving one
/// service directly.
pub fn context(rpc: Arc<MockRpc>, storage: Arc<MemoryStorage>) -> (ServiceController, ServiceContext) {
    let controller = ServiceController::new();
    let ctx = ServiceContext::new(
        controller.handle(),
        rpc,
        storage as Arc<dyn Storage>,
        Arc::new(MemoryFs::default()),
        test_config(),
    );
    (controller, ctx)
}

/// A started runtime over the mocks, with every service registered.
pub async fn runtime(rpc: Arc<MockRpc>, storage: Arc<MemoryStorage>) -> CrawlerRuntime {
    runtime_with_fs(rpc, storage, Arc::new(MemoryFs::default())).await
}

pub async fn runtime_with_fs(rpc: Arc<MockRpc>, storage: Arc<MemoryStorage>, fs: Arc<MemoryFs>) -> CrawlerRuntime {
    CrawlerRuntime::start(rpc, storage as Arc<dyn Storage>, fs, test_config())
        .await
        .unwrap()
}
