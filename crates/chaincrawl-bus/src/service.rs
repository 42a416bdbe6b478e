//! The background service contract.

use async_trait::async_trait;

use crate::command::ServiceMessage;

/// A named service registered on the controller.
///
/// `exec` must not run the work itself: it hands the message to the
/// service's own pool or queue and returns, so the bus dispatcher is never
/// held up by one slow service.
#[async_trait]
pub trait BackgroundService: Send + Sync {
    fn service_id(&self) -> &str;

    /// Scale the worker pool to `count`. Ignored while a previous scale
    /// transition is still in progress.
    async fn set_worker(&self, count: u16);

    /// Stop every worker, even while a scale transition is in progress.
    /// Called once by the controller on `exit`.
    async fn shutdown(&self) {
        self.set_worker(0).await;
    }

    /// Live workers (approximate).
    fn worker_count(&self) -> u16;

    async fn exec(&self, message: ServiceMessage);
}
