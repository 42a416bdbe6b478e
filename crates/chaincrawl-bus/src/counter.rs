//! Worker counter — how many workers of a pool are alive.
//!
//! The count is an atomic so pool-size queries can read it without locking
//! (an approximate answer is fine there). Scale transitions take the lock
//! and read through the guard, so "is a transition in progress" and "start
//! the next one" happen atomically.

use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Default)]
pub struct WorkerCounter {
    count: AtomicU16,
    lock: Mutex<()>,
}

impl WorkerCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Locked read.
    pub fn value(&self) -> u16 {
        self.lock().value()
    }

    /// Unlocked, possibly racy read.
    pub fn value_relaxed(&self) -> u16 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn increase(&self) {
        self.lock().increase();
    }

    pub fn decrease(&self) {
        self.lock().decrease();
    }

    /// Hold the counter for a compound read-modify-write.
    pub fn lock(&self) -> CounterGuard<'_> {
        CounterGuard {
            count: &self.count,
            _guard: self.lock.lock().unwrap(),
        }
    }
}

/// Exclusive access to a [`WorkerCounter`].
pub struct CounterGuard<'a> {
    count: &'a AtomicU16,
    _guard: MutexGuard<'a, ()>,
}

impl CounterGuard<'_> {
    pub fn value(&self) -> u16 {
        self.count.load(Ordering::SeqCst)
    }

    pub fn increase(&self) {
        let v = self.value();
        self.count.store(v.saturating_add(1), Ordering::SeqCst);
    }

    pub fn decrease(&self) {
        let v = self.value();
        self.count.store(v.saturating_sub(1), Ordering::SeqCst);
    }

    pub fn set(&self, value: u16) {
        self.count.store(value, Ordering::SeqCst);
    }
}
