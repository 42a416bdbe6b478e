//! Sinks: raw JSON files (`FsWriter`) and classified rows (`DbWriter`).

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use chaincrawl_bus::command::{BatchReport, Command, GetBlockResult, Reply, ReturnSlot, ServiceMessage};
use chaincrawl_bus::{BackgroundService, PoolHandler, WorkerPool};
use chaincrawl_core::chain::ChainBlock;
use chaincrawl_core::error::CrawlerError;
use chaincrawl_core::fs::FileSystem;
use chaincrawl_core::storage::Storage;

use crate::classify::{persist, prepare_batch, ClassifyOptions};
use crate::context::ServiceContext;
use crate::{reject_unsupported, DB_WRITER, FS_WRITER, POOL_CAPACITY};

/// Sub-directory for `eth_getBlockByNumber` dumps.
pub const BLOCKS_DIR: &str = "getBlockByNumber";
/// Sub-directory for `debug_traceBlockByNumber` dumps.
pub const TRACES_DIR: &str = "traceBlockByNumber";

// ─── FsWriter ────────────────────────────────────────────────────────────────

pub struct WriteFilesJob {
    pub dir: &'static str,
    pub root: PathBuf,
    pub items: Vec<(u64, String)>,
    pub returns: Option<ReturnSlot>,
}

pub struct FileSink {
    fs: Arc<dyn FileSystem>,
}

impl FileSink {
    pub fn new(fs: Arc<dyn FileSystem>) -> Self {
        Self { fs }
    }

    /// Write `<root>/<dir>/<n>.json` per item. A failed file is logged and
    /// skipped; returns how many were written.
    pub async fn write_all(&self, root: &Path, dir: &str, items: &[(u64, String)]) -> usize {
        if root.as_os_str().is_empty() {
            warn!(dir, items = items.len(), "output root is empty, no files will be written");
            return 0;
        }
        let out = root.join(dir);
        let mut written = 0;
        for (number, raw) in items {
            let path = out.join(format!("{number}.json"));
            match self.fs.write_file(&path, raw.as_bytes()).await {
                Ok(()) => written += 1,
                Err(e) => error!(block = number, path = %path.display(), error = %e, "failed to write file"),
            }
        }
        debug!(dir, written, "files written");
        written
    }
}

#[async_trait]
impl PoolHandler<WriteFilesJob> for FileSink {
    async fn handle(&self, _worker_id: u64, job: WriteFilesJob) {
        let files = self.write_all(&job.root, job.dir, &job.items).await;
        if let Some(slot) = job.returns {
            slot.send(Reply::Written { files });
        }
    }
}

pub struct FsWriter {
    pool: WorkerPool<WriteFilesJob, FileSink>,
}

impl FsWriter {
    pub fn new(ctx: &ServiceContext) -> Self {
        let sink = Arc::new(FileSink::new(ctx.fs.clone()));
        Self { pool: WorkerPool::new(FS_WRITER, sink, POOL_CAPACITY) }
    }
}

#[async_trait]
impl BackgroundService for FsWriter {
    fn service_id(&self) -> &str {
        FS_WRITER
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
            Command::WriteBlockFiles { root, items } => WriteFilesJob { dir: BLOCKS_DIR, root, items, returns },
            Command::WriteTraceFiles { root, items } => WriteFilesJob { dir: TRACES_DIR, root, items, returns },
            other => return reject_unsupported(FS_WRITER, &other, returns),
        };
        if let Err(e) = self.pool.submit(job).await {
            warn!(service = FS_WRITER, error = %e, "job dropped");
        }
    }
}

// ─── DbWriter ────────────────────────────────────────────────────────────────

pub struct WriteBlocksJob {
    pub blocks: Vec<ChainBlock>,
    pub returns: Option<ReturnSlot>,
}

pub struct RowSink {
    storage: Arc<dyn Storage>,
    options: ClassifyOptions,
}

impl RowSink {
    pub fn new(storage: Arc<dyn Storage>, options: ClassifyOptions) -> Self {
        Self { storage, options }
    }

    /// Classify and persist `blocks`. The index checkpoint is not touched.
    pub async fn write_blocks(&self, blocks: Vec<ChainBlock>) -> Result<BatchReport, CrawlerError> {
        let next_block = blocks
            .iter()
            .filter_map(|b| b.checked_number().ok())
            .map(|n| n + 1)
            .max()
            .unwrap_or_default();
        let results: Vec<GetBlockResult> = blocks
            .into_iter()
            .map(|block| GetBlockResult { number: block.number_u64(), block: Some(block), raw: None, error: None, retries: 0 })
            .collect();

        let batch = prepare_batch(self.storage.as_ref(), &results, self.options).await?;
        let inserted = persist(self.storage.as_ref(), &batch).await?;

        let mut report = BatchReport { windows: 1, next_block, ..Default::default() };
        batch.tally(&mut report, inserted);
        info!(
            new_blocks = report.new_blocks,
            changed_blocks = report.changed_blocks,
            issues = inserted,
            "blocks written"
        );
        Ok(report)
    }
}

#[async_trait]
impl PoolHandler<WriteBlocksJob> for RowSink {
    async fn handle(&self, _worker_id: u64, job: WriteBlocksJob) {
        let reply = match self.write_blocks(job.blocks).await {
            Ok(report) => Reply::Persisted(report),
            Err(e) => {
                error!(error = %e, "write_blocks failed");
                Reply::Failed(e.to_string())
            }
        };
        if let Some(slot) = job.returns {
            slot.send(reply);
        }
    }
}

pub struct DbWriter {
    pool: WorkerPool<WriteBlocksJob, RowSink>,
}

impl DbWriter {
    pub fn new(ctx: &ServiceContext) -> Self {
        let options = ClassifyOptions::from_config(&ctx.config.indexer);
        let sink = Arc::new(RowSink::new(ctx.storage.clone(), options));
        Self { pool: WorkerPool::new(DB_WRITER, sink, POOL_CAPACITY) }
    }
}

#[async_trait]
impl BackgroundService for DbWriter {
    fn service_id(&self) -> &str {
        DB_WRITER
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
            Command::WriteBlocks { blocks } => {
                if let Err(e) = self.pool.submit(WriteBlocksJob { blocks, returns }).await {
                    warn!(service = DB_WRITER, error = %e, "job dropped");
                }
            }
            other => reject_unsupported(DB_WRITER, &other, returns),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use chaincrawl_core::issue::IssueKind;
    use chaincrawl_core::model::BlockRow;
    use chaincrawl_storage::{FailPoint, MemoryStorage};

    use crate::testing::{chain_block, MemoryFs};

    const OPTIONS: ClassifyOptions = ClassifyOptions { recover_signers: false, index_transactions: true };

    struct BrokenFs;

    #[async_trait]
    impl FileSystem for BrokenFs {
        async fn write_file(&self, path: &Path, _bytes: &[u8]) -> Result<(), CrawlerError> {
            Err(CrawlerError::Io(format!("read-only: {}", path.display())))
        }
    }

    #[tokio::test]
    async fn files_land_under_their_directory() {
        let fs = Arc::new(MemoryFs::default());
        let sink = FileSink::new(fs.clone());
        let items = vec![(7, "{\"n\":7}".to_string()), (8, "{\"n\":8}".to_string())];

        assert_eq!(sink.write_all(&PathBuf::from("/data"), BLOCKS_DIR, &items).await, 2);
        let files = fs.files.lock().unwrap();
        assert_eq!(files[Path::new("/data/getBlockByNumber/7.json")], b"{\"n\":7}");
        assert!(files.contains_key(Path::new("/data/getBlockByNumber/8.json")));
    }

    #[tokio::test]
    async fn empty_root_writes_nothing() {
        let fs = Arc::new(MemoryFs::default());
        let sink = FileSink::new(fs.clone());
        assert_eq!(sink.write_all(&PathBuf::new(), TRACES_DIR, &[(1, "[]".into())]).await, 0);
        assert!(fs.files.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_files_are_skipped() {
        let sink = FileSink::new(Arc::new(BrokenFs));
        assert_eq!(sink.write_all(&PathBuf::from("/data"), TRACES_DIR, &[(1, "[]".into())]).await, 0);
    }

    #[tokio::test]
    async fn write_blocks_classifies_without_checkpoint() {
        let storage = Arc::new(MemoryStorage::new());
        storage.insert_block(BlockRow::from_chain(&chain_block(11, 0)));
        let sink = RowSink::new(storage.clone(), OPTIONS);

        let report = sink.write_blocks(vec![chain_block(10, 0), chain_block(11, 1)]).await.unwrap();
        assert_eq!(report.new_blocks, 1);
        assert_eq!(report.changed_blocks, 1);
        assert_eq!(report.reorgs, 1);
        assert_eq!(report.next_block, 12);
        assert_eq!(storage.issues().await.unwrap()[0].kind, IssueKind::Reorg);
        assert_eq!(storage.highest_index_block().await.unwrap(), None);
    }

    #[tokio::test]
    async fn storage_failure_is_reported() {
        let storage = Arc::new(MemoryStorage::new());
        storage.fail_on(FailPoint::SaveBlocks);
        let sink = Arc::new(RowSink::new(storage, OPTIONS));

        let (slot, rx) = ReturnSlot::channel();
        sink.handle(1, WriteBlocksJob { blocks: vec![chain_block(1, 0)], returns: Some(slot) }).await;
        assert!(matches!(rx.await.unwrap(), Reply::Failed(_)));
    }
}
