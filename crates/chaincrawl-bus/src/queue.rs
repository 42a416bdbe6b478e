//! Single-active range queue.
//!
//! Range requests can arrive from many callers at once, but at most one
//! drainer task works through them. A request either starts the drainer (if
//! idle) or waits in the queue for the running one. Each request id owns a
//! wait group sized to its item count; a second request with an id that is
//! still pending is rejected.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tracing::{debug, info, warn};

use crate::command::{Reply, ReturnSlot};
use crate::counter::WorkerCounter;
use crate::wait::WaitGroup;

/// A batch of block numbers to process as one request.
#[derive(Debug)]
pub struct RangeRequest {
    pub request_id: String,
    pub numbers: Vec<u64>,
    pub returns: Option<ReturnSlot>,
}

impl RangeRequest {
    /// `from..=to` as a request; empty when `from > to`.
    pub fn inclusive(request_id: impl Into<String>, from: u64, to: u64, returns: Option<ReturnSlot>) -> Self {
        let numbers = if from <= to { (from..=to).collect() } else { Vec::new() };
        Self { request_id: request_id.into(), numbers, returns }
    }
}

/// Does the work of one request. Must call `wait.done()` once per number
/// (directly or through the workers it fans out to) and answer `returns`.
#[async_trait]
pub trait RangeDrainer: Send + Sync + 'static {
    async fn drain(&self, drainer_id: u64, request: RangeRequest, wait: WaitGroup);
}

type Waits = Arc<Mutex<HashMap<String, WaitGroup>>>;

pub struct RangeQueue<D> {
    name: String,
    drainer: Arc<D>,
    waits: Waits,
    drainers: Arc<WorkerCounter>,
    sender: mpsc::UnboundedSender<RangeRequest>,
    receiver: Arc<AsyncMutex<mpsc::UnboundedReceiver<RangeRequest>>>,
    next_drainer_id: Arc<AtomicU64>,
}

impl<D: RangeDrainer> RangeQueue<D> {
    pub fn new(name: impl Into<String>, drainer: Arc<D>) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            name: name.into(),
            drainer,
            waits: Arc::new(Mutex::new(HashMap::new())),
            drainers: Arc::new(WorkerCounter::new()),
            sender,
            receiver: Arc::new(AsyncMutex::new(receiver)),
            next_drainer_id: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Drainer tasks alive (0 or 1).
    pub fn active(&self) -> u16 {
        self.drainers.value_relaxed()
    }

    /// Requests accepted and not finished yet.
    pub fn pending(&self) -> usize {
        self.waits.lock().unwrap().len()
    }

    /// Accept a request, or reject it if its id is still pending.
    pub fn enqueue(&self, request: RangeRequest) {
        {
            let mut waits = self.waits.lock().unwrap();
            if waits.contains_key(&request.request_id) {
                drop(waits);
                warn!(service = %self.name, request_id = %request.request_id, "request already queued");
                if let Some(slot) = request.returns {
                    slot.send(Reply::Rejected(format!(
                        "request '{}' is already queued",
                        request.request_id
                    )));
                }
                return;
            }
            let wait = WaitGroup::new();
            wait.add(request.numbers.len());
            waits.insert(request.request_id.clone(), wait);

            // the drainer only exits while holding this lock with an empty
            // map, so it cannot miss the entry inserted above
            if self.drainers.value() == 0 {
                self.drainers.increase();
                let drainer_id = self.next_drainer_id.fetch_add(1, Ordering::SeqCst) + 1;
                tokio::spawn(drain_loop(
                    self.name.clone(),
                    drainer_id,
                    self.drainer.clone(),
                    self.waits.clone(),
                    self.drainers.clone(),
                    self.receiver.clone(),
                ));
            }
        }
        debug!(service = %self.name, request_id = %request.request_id, len = request.numbers.len(), "request queued");
        // the receiver lives as long as `self`
        let _ = self.sender.send(request);
    }
}

async fn drain_loop<D: RangeDrainer>(
    name: String,
    drainer_id: u64,
    drainer: Arc<D>,
    waits: Waits,
    drainers: Arc<WorkerCounter>,
    receiver: Arc<AsyncMutex<mpsc::UnboundedReceiver<RangeRequest>>>,
) {
    info!(service = %name, drainer_id, "queue drainer started");
    loop {
        let request = {
            let mut rx = receiver.lock().await;
            rx.recv().await
        };
        let Some(request) = request else { break };
        let request_id = request.request_id.clone();
        let wait = waits.lock().unwrap().get(&request_id).cloned().unwrap_or_default();
        drainer.drain(drainer_id, request, wait).await;

        let mut waits = waits.lock().unwrap();
        waits.remove(&request_id);
        if waits.is_empty() {
            drainers.decrease();
            break;
        }
    }
    info!(service = %name, drainer_id, "queue drainer exited");
}
