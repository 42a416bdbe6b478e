//! Fixed-tick job scheduler.
//!
//! Every tick, each due job that is not still waiting for its previous reply
//! is dispatched through the bus. A job that is due but in flight is skipped
//! for this round.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::command::{Command, Reply, ServiceMessage};
use crate::controller::BusHandle;
use crate::error::BusError;
use crate::service::BackgroundService;

pub const MIN_TICK: Duration = Duration::from_millis(250);
pub const MAX_TICK: Duration = Duration::from_secs(60);

/// One scheduled job.
#[derive(Debug, Clone)]
pub struct JobMetadata {
    pub id: String,
    pub interval: Duration,
    pub service_id: String,
    pub command: Command,
    pub next_execution: Instant,
    in_flight: Arc<AtomicBool>,
}

impl JobMetadata {
    /// A job that is due on the first tick.
    pub fn new(id: impl Into<String>, interval: Duration, service_id: impl Into<String>, command: Command) -> Self {
        Self {
            id: id.into(),
            interval,
            service_id: service_id.into(),
            command,
            next_execution: Instant::now(),
            in_flight: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn in_flight(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst)
    }
}

pub struct Scheduler {
    id: String,
    bus: BusHandle,
    tick: Duration,
    jobs: Arc<Mutex<Vec<JobMetadata>>>,
    started: AtomicBool,
    shutdown: Arc<watch::Sender<bool>>,
}

impl Scheduler {
    /// `tick` is clamped to 250 ms – 60 s.
    pub fn new(id: impl Into<String>, bus: BusHandle, tick: Duration) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            id: id.into(),
            bus,
            tick: tick.clamp(MIN_TICK, MAX_TICK),
            jobs: Arc::new(Mutex::new(Vec::new())),
            started: AtomicBool::new(false),
            shutdown: Arc::new(shutdown),
        }
    }

    pub fn tick(&self) -> Duration {
        self.tick
    }

    /// Add a job; a job with the same id is replaced.
    pub fn add_job(&self, job: JobMetadata) {
        let mut jobs = self.jobs.lock().unwrap();
        jobs.retain(|j| j.id != job.id);
        info!(job = %job.id, service = %job.service_id, command = job.command.name(), interval_ms = job.interval.as_millis() as u64, "job scheduled");
        jobs.push(job);
    }

    pub fn remove_job(&self, id: &str) -> bool {
        let mut jobs = self.jobs.lock().unwrap();
        let before = jobs.len();
        jobs.retain(|j| j.id != id);
        before != jobs.len()
    }

    pub fn jobs(&self) -> Vec<JobMetadata> {
        self.jobs.lock().unwrap().clone()
    }

    pub fn is_stopped(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Start the tick loop (once). With `background = true`, suspend until
    /// [`stop`](Self::stop).
    pub async fn run(&self, background: bool) {
        if !self.started.swap(true, Ordering::SeqCst) {
            tokio::spawn(tick_loop(
                self.id.clone(),
                self.bus.clone(),
                self.tick,
                self.jobs.clone(),
                self.shutdown.subscribe(),
            ));
        }
        if background {
            let mut rx = self.shutdown.subscribe();
            let _ = rx.wait_for(|stopped| *stopped).await;
        }
    }

    pub fn stop(&self) {
        if !self.shutdown.send_replace(true) {
            info!(scheduler = %self.id, "scheduler stopping");
        }
    }
}

async fn tick_loop(
    id: String,
    bus: BusHandle,
    tick: Duration,
    jobs: Arc<Mutex<Vec<JobMetadata>>>,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(scheduler = %id, tick_ms = tick.as_millis() as u64, "scheduler started");
    let mut interval = tokio::time::interval(tick);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shutdown.wait_for(|stopped| *stopped) => break,
        }
        for job in due_jobs(&jobs, Instant::now()) {
            fire(&bus, job);
        }
    }
    info!(scheduler = %id, "scheduler stopped");
}

/// Jobs to fire now. Recomputes `next_execution` for every due job,
/// including the in-flight ones that are skipped.
fn due_jobs(jobs: &Mutex<Vec<JobMetadata>>, now: Instant) -> Vec<JobMetadata> {
    let mut jobs = jobs.lock().unwrap();
    let mut fire = Vec::new();
    for job in jobs.iter_mut().filter(|j| j.next_execution <= now) {
        job.next_execution = now + job.interval;
        if job.in_flight.swap(true, Ordering::SeqCst) {
            debug!(job = %job.id, "previous run still in flight, skipping");
            continue;
        }
        fire.push(job.clone());
    }
    fire
}

fn fire(bus: &BusHandle, job: JobMetadata) {
    let bus = bus.clone();
    tokio::spawn(async move {
        debug!(job = %job.id, service = %job.service_id, "firing job");
        match bus.dispatch_and_wait(&job.service_id, job.command.clone()).await {
            Ok(Reply::Rejected(reason)) | Ok(Reply::Failed(reason)) => {
                warn!(job = %job.id, %reason, "job did not complete");
            }
            Ok(_) => {}
            Err(BusError::Closed) => debug!(job = %job.id, "bus closed"),
            Err(e) => warn!(job = %job.id, error = %e, "job dispatch failed"),
        }
        job.in_flight.store(false, Ordering::SeqCst);
    });
}

#[async_trait]
impl BackgroundService for Scheduler {
    fn service_id(&self) -> &str {
        &self.id
    }

    /// The tick loop is a single task.
    async fn set_worker(&self, count: u16) {
        if count == 0 {
            self.stop();
        }
    }

    fn worker_count(&self) -> u16 {
        u16::from(self.started.load(Ordering::SeqCst) && !self.is_stopped())
    }

    async fn exec(&self, message: ServiceMessage) {
        match message.command {
            Command::Exit => {
                self.stop();
                message.reply(Reply::Ack);
            }
            ref other => {
                let reason = format!("scheduler does not handle '{}'", other.name());
                message.reply(Reply::Rejected(reason));
            }
        }
    }
}
