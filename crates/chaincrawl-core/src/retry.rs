//! Randomized-gap retry policy for calls against a flaky node.
//!
//! Between attempts the caller sleeps a uniformly random gap in
//! `[min_gap, max_gap]`, so a pool of workers that failed together does not
//! retry together. An [`RpcError::Unavailable`] answer only costs a retry
//! credit every other time it is seen.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::RpcError;

/// Configuration for the retry policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of retry credits (not counting the first try).
    pub max_retries: u32,
    /// Lower bound of the gap between attempts, in milliseconds.
    pub min_gap_ms: u64,
    /// Upper bound of the gap between attempts, in milliseconds.
    pub max_gap_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            min_gap_ms: 0,
            max_gap_ms: 200,
        }
    }
}

/// Stateless retry policy.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub config: RetryConfig,
}

/// Result of a call made through [`RetryPolicy::run`].
#[derive(Debug)]
pub struct RetryOutcome<T> {
    pub result: Result<T, RpcError>,
    /// Retry credits consumed.
    pub retries: u32,
    /// Total calls made, including the first one.
    pub attempts: u32,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// A random gap in `[min_gap, max_gap]`.
    pub fn next_delay(&self) -> Duration {
        let lo = self.config.min_gap_ms.min(self.config.max_gap_ms);
        let hi = self.config.max_gap_ms.max(self.config.min_gap_ms);
        if lo == hi {
            return Duration::from_millis(lo);
        }
        Duration::from_millis(rand::thread_rng().gen_range(lo..=hi))
    }

    /// Returns `true` if another attempt is allowed after `retries` credits
    /// have been consumed.
    pub fn should_retry(&self, retries: u32) -> bool {
        retries < self.config.max_retries
    }

    /// Run `call` until it succeeds, fails permanently, or the credits run out.
    ///
    /// `label` only feeds the warning log.
    pub async fn run<T, F, Fut>(&self, label: &str, mut call: F) -> RetryOutcome<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RpcError>>,
    {
        let mut result = call().await;
        let mut attempts = 1u32;
        let mut retries = 0u32;
        let mut half_credit = false;

        while let Err(err) = &result {
            if !err.is_retryable() || !self.should_retry(retries) {
                break;
            }
            let consumes = if err.is_unavailable() {
                let consumes = half_credit;
                half_credit = !half_credit;
                consumes
            } else {
                warn!(call = label, attempt = attempts, error = %err, "retrying");
                true
            };
            if consumes {
                retries += 1;
            }
            tokio::time::sleep(self.next_delay()).await;
            result = call().await;
            attempts += 1;
        }

        RetryOutcome { result, retries, attempts }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy::new(RetryConfig { max_retries, min_gap_ms: 0, max_gap_ms: 0 })
    }

    /// Replays a scripted sequence of results.
    fn scripted(results: Vec<Result<u64, RpcError>>) -> Mutex<VecDeque<Result<u64, RpcError>>> {
        Mutex::new(results.into())
    }

    #[test]
    fn delay_stays_within_bounds() {
        let p = RetryPolicy::new(RetryConfig { max_retries: 3, min_gap_ms: 50, max_gap_ms: 80 });
        for _ in 0..100 {
            let d = p.next_delay();
            assert!(d >= Duration::from_millis(50) && d <= Duration::from_millis(80), "{d:?}");
        }
    }

    #[test]
    fn inverted_bounds_are_tolerated() {
        let p = RetryPolicy::new(RetryConfig { max_retries: 1, min_gap_ms: 30, max_gap_ms: 10 });
        let d = p.next_delay();
        assert!(d >= Duration::from_millis(10) && d <= Duration::from_millis(30));
    }

    #[tokio::test]
    async fn unavailable_twice_then_success_costs_one_credit() {
        let script = scripted(vec![
            Err(RpcError::Unavailable { status: 503 }),
            Err(RpcError::Unavailable { status: 503 }),
            Ok(42),
        ]);
        let out = policy(3)
            .run("get_block", || {
                let next = script.lock().unwrap().pop_front().unwrap();
                async move { next }
            })
            .await;
        assert_eq!(out.result.unwrap(), 42);
        assert_eq!(out.retries, 1);
        assert_eq!(out.attempts, 3);
    }

    #[tokio::test]
    async fn transport_errors_exhaust_the_budget() {
        let calls = Mutex::new(0u32);
        let out = policy(3)
            .run("get_block", || {
                *calls.lock().unwrap() += 1;
                async { Err::<u64, _>(RpcError::Transport("reset".into())) }
            })
            .await;
        assert!(out.result.is_err());
        assert_eq!(out.retries, 3);
        assert_eq!(*calls.lock().unwrap(), 4);
    }

    #[tokio::test]
    async fn unavailable_alone_gets_twice_the_attempts() {
        let calls = Mutex::new(0u32);
        let out = policy(2)
            .run("get_block_number", || {
                *calls.lock().unwrap() += 1;
                async { Err::<u64, _>(RpcError::Unavailable { status: 503 }) }
            })
            .await;
        assert!(out.result.unwrap_err().is_unavailable());
        assert_eq!(out.retries, 2);
        assert_eq!(out.attempts, 5);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let calls = Mutex::new(0u32);
        let out = policy(3)
            .run("get_block", || {
                *calls.lock().unwrap() += 1;
                async { Err::<u64, _>(RpcError::Decode("bad block".into())) }
            })
            .await;
        assert!(out.result.is_err());
        assert_eq!(out.attempts, 1);
        assert_eq!(out.retries, 0);
    }
}
