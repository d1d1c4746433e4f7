//! Replay outcome callbacks.

use crate::task::RetryTask;

/// Observes the outcome of each replayed task.
///
/// Called from the retry pass after the store has been updated: a task is
/// already deleted when `on_retry_success` runs and back to `PENDING` when
/// `on_retry_failure` runs. Both run on the scheduler's worker thread, so
/// keep them short.
pub trait RetryListener: Send + Sync + 'static {
    /// A replay succeeded.
    fn on_retry_success(&self, _task: &RetryTask) {}

    /// A replay failed (errors and panics alike).
    fn on_retry_failure(&self, _task: &RetryTask, _error: &anyhow::Error) {}
}
