//! Shared handles every service is built from.

use std::sync::Arc;

use chaincrawl_bus::command::{GetBlockResult, TraceBlockResult};
use chaincrawl_bus::{BusHandle, EphemeralCache};
use chaincrawl_core::config::CrawlerConfig;
use chaincrawl_core::fs::FileSystem;
use chaincrawl_core::retry::RetryPolicy;
use chaincrawl_core::rpc::ChainRpc;
use chaincrawl_core::storage::Storage;

/// Built once at startup and cloned into each service constructor.
#[derive(Clone)]
pub struct ServiceContext {
    pub bus: BusHandle,
    pub rpc: Arc<dyn ChainRpc>,
    pub storage: Arc<dyn Storage>,
    pub fs: Arc<dyn FileSystem>,
    /// Fan-in slots of `get_blocks` / `get_blocks_range`.
    pub blocks: Arc<EphemeralCache<GetBlockResult>>,
    /// Fan-in slots of `trace_blocks_range`.
    pub traces: Arc<EphemeralCache<TraceBlockResult>>,
    pub config: Arc<CrawlerConfig>,
}

impl ServiceContext {
    pub fn new(
        bus: BusHandle,
        rpc: Arc<dyn ChainRpc>,
        storage: Arc<dyn Storage>,
        fs: Arc<dyn FileSystem>,
        config: CrawlerConfig,
    ) -> Self {
        Self {
            bus,
            rpc,
            storage,
            fs,
            blocks: Arc::new(EphemeralCache::new()),
            traces: Arc::new(EphemeralCache::new()),
            config: Arc::new(config),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.config.retry.clone())
    }
}
