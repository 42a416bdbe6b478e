//! chaincrawl-bus — the in-process runtime the crawler's services run on.
//!
//! - [`ServiceController`]: named services behind one FIFO mailbox
//! - [`WorkerPool`]: persistent, resizable worker pools
//! - [`RangeQueue`]: single-active queue for ranged fan-out requests
//! - [`EphemeralCache`]: write-once slot arrays that carry fan-out results
//! - [`Scheduler`]: fixed-tick job loop on top of the bus

pub mod cache;
pub mod command;
pub mod controller;
pub mod counter;
pub mod error;
pub mod pool;
pub mod queue;
pub mod scheduler;
pub mod service;
pub mod wait;

pub use cache::{EphemeralCache, SlotHandle};
pub use command::{
    BatchReport, Command, DownloadParams, DownloadReport, GetBlockNumberResult, GetBlockResult, IndexParams,
    Reply, ReturnSlot, ServiceMessage, TraceBlockResult, TraceTransactionResult,
};
pub use controller::{BusHandle, ServiceController, CONTROLLER_ID};
pub use counter::WorkerCounter;
pub use error::{BusError, CacheError};
pub use pool::{PoolHandler, WorkerPool};
pub use queue::{RangeDrainer, RangeQueue, RangeRequest};
pub use scheduler::{JobMetadata, Scheduler};
pub use service::BackgroundService;
pub use wait::WaitGroup;
