//! `Downloader` — dump raw block / trace JSON to disk, window by window.
//!
//! Each window is fetched through the fetcher (or tracer) and handed to the
//! file writer. Items that failed to fetch are skipped with a warning. A
//! trace download started with `use_checkpoint` resumes from, and advances,
//! the trace checkpoint; the checkpoint never passes a failed block.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use chaincrawl_bus::command::{Command, DownloadParams, DownloadReport, Reply, ReturnSlot, ServiceMessage};
use chaincrawl_bus::{BackgroundService, PoolHandler, WorkerPool};
use chaincrawl_core::error::CrawlerError;

use crate::context::ServiceContext;
use crate::{reject_unsupported, BLOCK_FETCHER, BLOCK_TRACER, DOWNLOADER, FS_WRITER, POOL_CAPACITY};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadKind {
    Blocks,
    Traces,
}

pub struct DownloadJob {
    pub kind: DownloadKind,
    pub params: DownloadParams,
    pub returns: Option<ReturnSlot>,
}

/// One fetched window: raw JSON of the good items plus the failed numbers.
struct Window {
    items: Vec<(u64, String)>,
    failed: Vec<u64>,
}

pub struct DownloadRunner {
    ctx: ServiceContext,
    /// Keeps range request ids unique when two jobs cover the same blocks.
    jobs: AtomicU64,
}

impl DownloadRunner {
    pub fn new(ctx: ServiceContext) -> Self {
        Self { ctx, jobs: AtomicU64::new(0) }
    }

    pub async fn run(&self, kind: DownloadKind, params: DownloadParams) -> Result<DownloadReport, CrawlerError> {
        let storage = self.ctx.storage.as_ref();
        let track_checkpoint = kind == DownloadKind::Traces && params.use_checkpoint;
        let job = self.jobs.fetch_add(1, Ordering::Relaxed);

        let mut start = params.from;
        if track_checkpoint {
            if let Some(checkpoint) = storage.highest_trace_block().await? {
                info!(checkpoint, "resuming trace download from checkpoint");
                start = checkpoint.max(params.from);
            }
        }

        let batch_size = params.batch_size.max(1);
        let mut report = DownloadReport { next_block: start, ..Default::default() };
        let mut first_failed: Option<u64> = None;
        info!(?kind, job, from = start, to = params.to, "download started");

        while start <= params.to {
            let end = start.saturating_add(batch_size - 1).min(params.to);
            let window = match kind {
                DownloadKind::Blocks => self.fetch_blocks(job, start, end).await?,
                DownloadKind::Traces => self.fetch_traces(job, start, end).await?,
            };

            let command = match kind {
                DownloadKind::Blocks => Command::WriteBlockFiles { root: params.root.clone(), items: window.items },
                DownloadKind::Traces => Command::WriteTraceFiles { root: params.root.clone(), items: window.items },
            };
            let name = command.name();
            let written = self.ctx.bus.dispatch_and_wait(FS_WRITER, command).await?.into_written(name)?;

            if let Some(&failed) = window.failed.iter().min() {
                first_failed.get_or_insert(failed);
            }
            if track_checkpoint {
                storage.save_highest_trace_block(first_failed.unwrap_or(end + 1)).await?;
            }

            report.windows += 1;
            report.written += written;
            report.failed += window.failed.len();
            report.next_block = end + 1;
            info!(?kind, from = start, to = end, written, failed = window.failed.len(), "window downloaded");
            start = end + 1;
        }
        Ok(report)
    }

    async fn fetch_blocks(&self, job: u64, start: u64, end: u64) -> Result<Window, CrawlerError> {
        let request_id = format!("download_blocks_{job}_{start}_{end}");
        let command = Command::GetBlocksRange { request_id, from: start, to: end };
        let handle = self.ctx.bus.dispatch_and_wait(BLOCK_FETCHER, command).await?.into_slot_handle("get_blocks_range")?;
        let mut window = Window { items: Vec::new(), failed: Vec::new() };
        for (slot, number) in self.ctx.blocks.take_array(&handle)?.into_iter().zip(start..) {
            match slot.and_then(|r| r.raw.filter(|_| r.error.is_none())) {
                Some(raw) => window.items.push((number, raw)),
                None => {
                    warn!(block = number, "skipping block that failed to fetch");
                    window.failed.push(number);
                }
            }
        }
        Ok(window)
    }

    async fn fetch_traces(&self, job: u64, start: u64, end: u64) -> Result<Window, CrawlerError> {
        let request_id = format!("download_traces_{job}_{start}_{end}");
        let command = Command::TraceBlocksRange { request_id, from: start, to: end };
        let handle = self.ctx.bus.dispatch_and_wait(BLOCK_TRACER, command).await?.into_slot_handle("trace_blocks_range")?;
        let mut window = Window { items: Vec::new(), failed: Vec::new() };
        for (slot, number) in self.ctx.traces.take_array(&handle)?.into_iter().zip(start..) {
            match slot.and_then(|r| r.raw.filter(|_| r.error.is_none())) {
                Some(raw) => window.items.push((number, raw)),
                None => {
                    warn!(block = number, "skipping block whose trace failed");
                    window.failed.push(number);
                }
            }
        }
        Ok(window)
    }
}

#[async_trait]
impl PoolHandler<DownloadJob> for DownloadRunner {
    async fn handle(&self, _worker_id: u64, job: DownloadJob) {
        let reply = match self.run(job.kind, job.params).await {
            Ok(report) => Reply::Downloaded(report),
            Err(e) => {
                warn!(kind = ?job.kind, error = %e, "download failed");
                Reply::Failed(e.to_string())
            }
        };
        if let Some(slot) = job.returns {
            slot.send(reply);
        }
    }
}

pub struct Downloader {
    pool: WorkerPool<DownloadJob, DownloadRunner>,
}

impl Downloader {
    pub fn new(ctx: &ServiceContext) -> Self {
        let runner = Arc::new(DownloadRunner::new(ctx.clone()));
        Self { pool: WorkerPool::new(DOWNLOADER, runner, POOL_CAPACITY) }
    }
}

#[async_trait]
impl BackgroundService for Downloader {
    fn service_id(&self) -> &str {
        DOWNLOADER
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
        let job = match command {
            Command::DownloadBlocks(params) => DownloadJob { kind: DownloadKind::Blocks, params, returns },
            Command::DownloadBlockTraces(params) => DownloadJob { kind: DownloadKind::Traces, params, returns },
            other => return reject_unsupported(DOWNLOADER, &other, returns),
        };
        if let Err(e) = self.pool.submit(job).await {
            warn!(service = DOWNLOADER, error = %e, "job dropped");
        }
    }
}
