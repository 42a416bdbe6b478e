//! Persistent worker pool.
//!
//! Workers share one bounded queue. Scaling up spawns new workers; scaling
//! down enqueues one exit sentinel per worker to remove, and whichever worker
//! picks a sentinel up finishes there (after the item it was already on).

use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info};

use crate::counter::WorkerCounter;
use crate::error::BusError;

/// Processes the jobs of a [`WorkerPool`].
#[async_trait]
pub trait PoolHandler<J>: Send + Sync + 'static {
    async fn handle(&self, worker_id: u64, job: J);
}

enum PoolItem<J> {
    Job(J),
    Exit,
}

pub struct WorkerPool<J, H> {
    name: String,
    handler: Arc<H>,
    sender: mpsc::Sender<PoolItem<J>>,
    receiver: Arc<Mutex<mpsc::Receiver<PoolItem<J>>>>,
    counter: Arc<WorkerCounter>,
    target: AtomicU16,
    next_worker_id: AtomicU64,
}

impl<J, H> WorkerPool<J, H>
where
    J: Send + 'static,
    H: PoolHandler<J>,
{
    /// A pool with no workers; call [`set_worker`](Self::set_worker) to start some.
    pub fn new(name: impl Into<String>, handler: Arc<H>, capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        Self {
            name: name.into(),
            handler,
            sender,
            receiver: Arc::new(Mutex::new(receiver)),
            counter: Arc::new(WorkerCounter::new()),
            target: AtomicU16::new(0),
            next_worker_id: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn handler(&self) -> &Arc<H> {
        &self.handler
    }

    /// Live workers, read without locking.
    pub fn worker_count(&self) -> u16 {
        self.counter.value_relaxed()
    }

    /// The size the last accepted `set_worker` asked for.
    pub fn target(&self) -> u16 {
        self.target.load(Ordering::SeqCst)
    }

    /// Scale to `count` workers.
    pub async fn set_worker(&self, count: u16) {
        let (spawn, retire) = {
            let guard = self.counter.lock();
            let current = guard.value();
            let target = self.target.load(Ordering::SeqCst);
            if current != target {
                debug!(service = %self.name, current, target, requested = count, "scale transition in progress");
                return;
            }
            self.target.store(count, Ordering::SeqCst);
            (count.saturating_sub(current), current.saturating_sub(count))
        };

        for _ in 0..spawn {
            let worker_id = self.next_worker_id.fetch_add(1, Ordering::SeqCst) + 1;
            tokio::spawn(run_worker(
                self.name.clone(),
                worker_id,
                self.handler.clone(),
                self.receiver.clone(),
                self.counter.clone(),
            ));
        }
        for _ in 0..retire {
            if self.sender.send(PoolItem::Exit).await.is_err() {
                break;
            }
        }
        if spawn + retire > 0 {
            info!(service = %self.name, workers = count, spawned = spawn, retired = retire, "scaling worker pool");
        }
    }

    /// Retire every worker regardless of a transition in flight. Sentinels
    /// already queued cover `live - target`, so `target` more drain the pool.
    pub async fn shutdown(&self) {
        let retire = {
            let _guard = self.counter.lock();
            self.target.swap(0, Ordering::SeqCst)
        };
        for _ in 0..retire {
            if self.sender.send(PoolItem::Exit).await.is_err() {
                break;
            }
        }
        if retire > 0 {
            info!(service = %self.name, retired = retire, "worker pool shut down");
        }
    }

    /// Queue a job for the next free worker.
    pub async fn submit(&self, job: J) -> Result<(), BusError> {
        self.sender
            .send(PoolItem::Job(job))
            .await
            .map_err(|_| BusError::Closed)
    }
}

async fn run_worker<J, H>(
    name: String,
    worker_id: u64,
    handler: Arc<H>,
    receiver: Arc<Mutex<mpsc::Receiver<PoolItem<J>>>>,
    counter: Arc<WorkerCounter>,
) where
    J: Send + 'static,
    H: PoolHandler<J>,
{
    counter.increase();
    info!(service = %name, worker_id, "worker started");
    loop {
        let item = {
            let mut rx = receiver.lock().await;
            rx.recv().await
        };
        match item {
            Some(PoolItem::Job(job)) => handler.handle(worker_id, job).await,
            Some(PoolItem::Exit) | None => break,
        }
    }
    counter.decrease();
    info!(service = %name, worker_id, "worker exited");
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[derive(Default)]
    pub(crate) struct Counting {
        pub seen: AtomicUsize,
    }

    #[async_trait]
    impl PoolHandler<u64> for Counting {
        async fn handle(&self, _worker_id: u64, _job: u64) {
            self.seen.fetch_add(1, Ordering::SeqCst);
        }
    }

    pub(crate) async fn settle<F: Fn() -> bool>(cond: F) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !cond() {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn scaling_converges_up_and_down() {
        let pool = WorkerPool::new("test", Arc::new(Counting::default()), 16);
        pool.set_worker(4).await;
        settle(|| pool.worker_count() == 4).await;

        pool.set_worker(1).await;
        settle(|| pool.worker_count() == 1).await;
        assert_eq!(pool.target(), 1);

        pool.set_worker(0).await;
        settle(|| pool.worker_count() == 0).await;
    }

    #[tokio::test]
    async fn scale_request_during_transition_is_ignored() {
        let pool = WorkerPool::new("test", Arc::new(Counting::default()), 16);
        pool.set_worker(3).await;
        // the spawned workers have not run yet on this runtime
        pool.set_worker(5).await;
        settle(|| pool.worker_count() == 3).await;
        assert_eq!(pool.target(), 3);

        pool.set_worker(5).await;
        settle(|| pool.worker_count() == 5).await;
    }

    #[tokio::test]
    async fn shutdown_drains_a_pool_mid_transition() {
        let pool = WorkerPool::new("test", Arc::new(Counting::default()), 16);
        pool.set_worker(4).await;
        // ignored: the four workers have not started yet
        pool.set_worker(0).await;
        assert_eq!(pool.target(), 4);

        pool.shutdown().await;
        assert_eq!(pool.target(), 0);
        settle(|| pool.worker_count() == 0).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(pool.worker_count(), 0);
    }

    #[tokio::test]
    async fn shutdown_after_partial_scale_down() {
        let pool = WorkerPool::new("test", Arc::new(Counting::default()), 16);
        pool.set_worker(5).await;
        settle(|| pool.worker_count() == 5).await;
        pool.set_worker(2).await;
        pool.shutdown().await;
        settle(|| pool.worker_count() == 0).await;
    }

    #[tokio::test]
    async fn every_job_is_handled_once() {
        let handler = Arc::new(Counting::default());
        let pool = WorkerPool::new("test", handler.clone(), 4);
        pool.set_worker(3).await;
        for i in 0..50 {
            pool.submit(i).await.unwrap();
        }
        settle(|| handler.seen.load(Ordering::SeqCst) == 50).await;
    }
}
