//! `CrawlerRuntime` — one controller with every service registered and
//! scaled to its configured worker count.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, info};

use chaincrawl_bus::command::{BatchReport, Command, DownloadParams, DownloadReport, IndexParams};
use chaincrawl_bus::{BackgroundService, JobMetadata, Scheduler, ServiceController};
use chaincrawl_core::chain::ChainBlock;
use chaincrawl_core::config::CrawlerConfig;
use chaincrawl_core::error::CrawlerError;
use chaincrawl_core::fs::FileSystem;
use chaincrawl_core::rpc::ChainRpc;
use chaincrawl_core::storage::Storage;

use crate::context::ServiceContext;
use crate::downloader::Downloader;
use crate::fetcher::BlockFetcher;
use crate::indexer::BlockIndexer;
use crate::tracer::BlockTracer;
use crate::writer::{DbWriter, FsWriter};
use crate::{BLOCK_FETCHER, BLOCK_INDEXER, BLOCK_TRACER, DB_WRITER, DOWNLOADER, FS_WRITER, SCHEDULER};

/// Id of the periodic index job.
pub const INDEX_JOB: &str = "index";

pub struct CrawlerRuntime {
    controller: Arc<ServiceController>,
    ctx: ServiceContext,
    scheduler: Mutex<Option<Arc<Scheduler>>>,
}

impl CrawlerRuntime {
    /// Register all services, start the dispatcher and scale each pool.
    pub async fn start(
        rpc: Arc<dyn ChainRpc>,
        storage: Arc<dyn Storage>,
        fs: Arc<dyn FileSystem>,
        config: CrawlerConfig,
    ) -> Result<Self, CrawlerError> {
        let controller = Arc::new(ServiceController::new());
        let ctx = ServiceContext::new(controller.handle(), rpc, storage, fs, config);

        let services: Vec<Arc<dyn BackgroundService>> = vec![
            Arc::new(BlockFetcher::new(&ctx)),
            Arc::new(BlockTracer::new(&ctx)),
            Arc::new(BlockIndexer::new(&ctx)),
            Arc::new(Downloader::new(&ctx)),
            Arc::new(FsWriter::new(&ctx)),
            Arc::new(DbWriter::new(&ctx)),
        ];
        for service in services {
            controller.register(service)?;
        }
        controller.run(false).await;

        let workers = &ctx.config.workers;
        for (service_id, count) in [
            (BLOCK_FETCHER, workers.block_fetcher),
            (BLOCK_TRACER, workers.block_tracer),
            (BLOCK_INDEXER, workers.block_indexer),
            (DOWNLOADER, workers.downloader),
            (FS_WRITER, workers.fs_writer),
            (DB_WRITER, workers.db_writer),
        ] {
            controller.set_worker_count(service_id, count).await?;
            debug!(service = service_id, workers = count, "service scaled");
        }
        info!(services = ?controller.service_ids(), "runtime started");

        Ok(Self { controller, ctx, scheduler: Mutex::new(None) })
    }

    pub fn controller(&self) -> &Arc<ServiceController> {
        &self.controller
    }

    pub fn context(&self) -> &ServiceContext {
        &self.ctx
    }

    pub async fn index(&self, params: IndexParams) -> Result<BatchReport, CrawlerError> {
        let reply = self.controller.dispatch_and_wait(BLOCK_INDEXER, Command::Index(params)).await?;
        Ok(reply.into_batch_report("index")?)
    }

    pub async fn download_blocks(&self, params: DownloadParams) -> Result<DownloadReport, CrawlerError> {
        let reply = self.controller.dispatch_and_wait(DOWNLOADER, Command::DownloadBlocks(params)).await?;
        Ok(reply.into_download_report("download_blocks")?)
    }

    pub async fn download_traces(&self, params: DownloadParams) -> Result<DownloadReport, CrawlerError> {
        let reply = self.controller.dispatch_and_wait(DOWNLOADER, Command::DownloadBlockTraces(params)).await?;
        Ok(reply.into_download_report("download_block_traces")?)
    }

    /// Classify and persist already-fetched blocks.
    pub async fn write_blocks(&self, blocks: Vec<ChainBlock>) -> Result<BatchReport, CrawlerError> {
        let reply = self.controller.dispatch_and_wait(DB_WRITER, Command::WriteBlocks { blocks }).await?;
        Ok(reply.into_batch_report("write_blocks")?)
    }

    /// Start the scheduler with the periodic `index` job. Calling it again
    /// returns the running scheduler.
    pub async fn start_scheduler(&self) -> Result<Arc<Scheduler>, CrawlerError> {
        if let Some(scheduler) = self.scheduler.lock().unwrap().clone() {
            return Ok(scheduler);
        }

        let config = &self.ctx.config;
        let scheduler = Arc::new(Scheduler::new(
            SCHEDULER,
            self.controller.handle(),
            Duration::from_millis(config.schedule.tick_ms),
        ));
        let params = IndexParams {
            from: config.indexer.start_block,
            to: config.indexer.end_block,
            batch_size: config.indexer.batch_size,
            use_checkpoint: true,
        };
        scheduler.add_job(JobMetadata::new(
            INDEX_JOB,
            Duration::from_millis(config.schedule.index_interval_ms),
            BLOCK_INDEXER,
            Command::Index(params),
        ));

        self.controller.register(scheduler.clone())?;
        scheduler.run(false).await;
        *self.scheduler.lock().unwrap() = Some(scheduler.clone());
        Ok(scheduler)
    }

    /// Stop every service and wait for the bus to close.
    pub async fn shutdown(&self) {
        if let Some(scheduler) = self.scheduler.lock().unwrap().take() {
            scheduler.stop();
        }
        if self.controller.handle().exit().await.is_err() {
            debug!("bus already closed");
        }
        self.controller.wait_exit().await;
    }
}
