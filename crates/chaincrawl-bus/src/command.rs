//! Commands, replies, and the message envelope that carries them.
//!
//! Each command is a variant with its own typed parameters, and each reply
//! is a variant with its own typed result; there is no string-keyed
//! parameter bag.

use std::path::PathBuf;

use serde_json::Value;
use tokio::sync::oneshot;

use chaincrawl_core::chain::ChainBlock;
use chaincrawl_core::error::RpcError;

use crate::cache::SlotHandle;
use crate::error::BusError;

/// Parameters of the `index` command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexParams {
    pub from: u64,
    /// `None` follows the chain head.
    pub to: Option<u64>,
    pub batch_size: u64,
    pub use_checkpoint: bool,
}

/// Parameters of the `download_blocks` / `download_block_traces` commands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadParams {
    pub from: u64,
    pub to: u64,
    pub batch_size: u64,
    pub root: PathBuf,
    /// Resume from (and advance) the trace checkpoint. Ignored for blocks.
    pub use_checkpoint: bool,
}

/// A unit of work addressed to a service.
#[derive(Debug, Clone)]
pub enum Command {
    GetBlock { number: u64 },
    GetBlockNumber,
    GetBlocks { request_id: String, numbers: Vec<u64> },
    GetBlocksRange { request_id: String, from: u64, to: u64 },
    TraceBlock { number: u64 },
    TraceBlocksRange { request_id: String, from: u64, to: u64 },
    TraceTransaction { hash: String },
    Index(IndexParams),
    DownloadBlocks(DownloadParams),
    DownloadBlockTraces(DownloadParams),
    /// `(block number, raw JSON)` pairs.
    WriteBlockFiles { root: PathBuf, items: Vec<(u64, String)> },
    /// `(block number, raw JSON)` pairs.
    WriteTraceFiles { root: PathBuf, items: Vec<(u64, String)> },
    WriteBlocks { blocks: Vec<ChainBlock> },
    SetWorker { service_id: String, count: u16 },
    Exit,
}

impl Command {
    /// The command's name in the bus vocabulary.
    pub fn name(&self) -> &'static str {
        match self {
            Self::GetBlock { .. } => "get_block",
            Self::GetBlockNumber => "get_block_number",
            Self::GetBlocks { .. } => "get_blocks",
            Self::GetBlocksRange { .. } => "get_blocks_range",
            Self::TraceBlock { .. } => "trace_block",
            Self::TraceBlocksRange { .. } => "trace_blocks_range",
            Self::TraceTransaction { .. } => "trace_transaction",
            Self::Index(_) => "index",
            Self::DownloadBlocks(_) => "download_blocks",
            Self::DownloadBlockTraces(_) => "download_block_traces",
            Self::WriteBlockFiles { .. } => "write_block_files",
            Self::WriteTraceFiles { .. } => "write_trace_files",
            Self::WriteBlocks { .. } => "write_blocks",
            Self::SetWorker { .. } => "set_worker",
            Self::Exit => "exit",
        }
    }
}

/// Outcome of fetching one block.
#[derive(Debug, Clone, PartialEq)]
pub struct GetBlockResult {
    pub number: u64,
    pub block: Option<ChainBlock>,
    pub raw: Option<String>,
    pub error: Option<RpcError>,
    /// Retry credits consumed.
    pub retries: u32,
}

impl GetBlockResult {
    pub fn is_ok(&self) -> bool {
        self.error.is_none() && self.block.is_some()
    }
}

/// Outcome of `get_block_number`.
#[derive(Debug, Clone, PartialEq)]
pub struct GetBlockNumberResult {
    pub number: Option<u64>,
    pub error: Option<RpcError>,
}

/// Outcome of tracing one block.
#[derive(Debug, Clone, PartialEq)]
pub struct TraceBlockResult {
    pub number: u64,
    pub traces: Option<Vec<Value>>,
    pub raw: Option<String>,
    pub error: Option<RpcError>,
    pub retries: u32,
}

impl TraceBlockResult {
    pub fn is_ok(&self) -> bool {
        self.error.is_none() && self.traces.is_some()
    }
}

/// Outcome of tracing one transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct TraceTransactionResult {
    pub hash: String,
    pub trace: Option<Value>,
    pub error: Option<RpcError>,
}

/// Summary of persisted batches.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub windows: u64,
    pub new_blocks: usize,
    pub changed_blocks: usize,
    pub new_transactions: usize,
    pub changed_transactions: usize,
    pub transactions: usize,
    /// Issues found (before storage dedup).
    pub issues: usize,
    pub failed_blocks: usize,
    pub reorgs: usize,
    /// Where the next run resumes.
    pub next_block: u64,
}

/// Summary of a download run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DownloadReport {
    pub windows: u64,
    pub written: usize,
    pub failed: usize,
    pub next_block: u64,
}

/// The answer a service sends through a [`ReturnSlot`].
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Ack,
    Block(GetBlockResult),
    BlockNumber(GetBlockNumberResult),
    /// The range is complete; take the results from the cache.
    BlocksReady(SlotHandle),
    Trace(TraceBlockResult),
    TracesReady(SlotHandle),
    TransactionTrace(TraceTransactionResult),
    Indexed(BatchReport),
    Persisted(BatchReport),
    Downloaded(DownloadReport),
    Written { files: usize },
    Rejected(String),
    Failed(String),
}

impl Reply {
    fn variant(&self) -> &'static str {
        match self {
            Self::Ack => "Ack",
            Self::Block(_) => "Block",
            Self::BlockNumber(_) => "BlockNumber",
            Self::BlocksReady(_) => "BlocksReady",
            Self::Trace(_) => "Trace",
            Self::TracesReady(_) => "TracesReady",
            Self::TransactionTrace(_) => "TransactionTrace",
            Self::Indexed(_) => "Indexed",
            Self::Persisted(_) => "Persisted",
            Self::Downloaded(_) => "Downloaded",
            Self::Written { .. } => "Written",
            Self::Rejected(_) => "Rejected",
            Self::Failed(_) => "Failed",
        }
    }

    fn unexpected(self, command: &str) -> BusError {
        match self {
            Self::Rejected(reason) | Self::Failed(reason) => BusError::Rejected(reason),
            other => BusError::UnexpectedReply {
                command: command.to_string(),
                reply: other.variant().to_string(),
            },
        }
    }

    pub fn into_slot_handle(self, command: &str) -> Result<SlotHandle, BusError> {
        match self {
            Self::BlocksReady(h) | Self::TracesReady(h) => Ok(h),
            other => Err(other.unexpected(command)),
        }
    }

    pub fn into_block_number(self, command: &str) -> Result<GetBlockNumberResult, BusError> {
        match self {
            Self::BlockNumber(r) => Ok(r),
            other => Err(other.unexpected(command)),
        }
    }

    pub fn into_block(self, command: &str) -> Result<GetBlockResult, BusError> {
        match self {
            Self::Block(r) => Ok(r),
            other => Err(other.unexpected(command)),
        }
    }

    pub fn into_trace(self, command: &str) -> Result<TraceBlockResult, BusError> {
        match self {
            Self::Trace(r) => Ok(r),
            other => Err(other.unexpected(command)),
        }
    }

    pub fn into_batch_report(self, command: &str) -> Result<BatchReport, BusError> {
        match self {
            Self::Indexed(r) | Self::Persisted(r) => Ok(r),
            other => Err(other.unexpected(command)),
        }
    }

    pub fn into_download_report(self, command: &str) -> Result<DownloadReport, BusError> {
        match self {
            Self::Downloaded(r) => Ok(r),
            other => Err(other.unexpected(command)),
        }
    }

    pub fn into_written(self, command: &str) -> Result<usize, BusError> {
        match self {
            Self::Written { files } => Ok(files),
            other => Err(other.unexpected(command)),
        }
    }
}

/// Where a service sends its [`Reply`]. Dropping it unanswered wakes the
/// waiter with [`BusError::NoReply`].
#[derive(Debug)]
pub struct ReturnSlot(oneshot::Sender<Reply>);

impl ReturnSlot {
    pub fn channel() -> (Self, oneshot::Receiver<Reply>) {
        let (tx, rx) = oneshot::channel();
        (Self(tx), rx)
    }

    /// Deliver the reply. A waiter that gave up is not an error.
    pub fn send(self, reply: Reply) {
        let _ = self.0.send(reply);
    }
}

/// A command plus its optional return slot.
#[derive(Debug)]
pub struct ServiceMessage {
    pub command: Command,
    pub returns: Option<ReturnSlot>,
}

impl ServiceMessage {
    /// Fire-and-forget message.
    pub fn new(command: Command) -> Self {
        Self { command, returns: None }
    }

    /// Message whose reply arrives on the returned receiver.
    pub fn expect_returns(command: Command) -> (Self, oneshot::Receiver<Reply>) {
        let (slot, rx) = ReturnSlot::channel();
        (Self { command, returns: Some(slot) }, rx)
    }

    /// Answer the message if anyone is waiting.
    pub fn reply(self, reply: Reply) {
        if let Some(slot) = self.returns {
            slot.send(reply);
        }
    }
}
