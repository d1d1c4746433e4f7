//! Per-tick replay of one handler's pending tasks.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::capture::InFlight;
use crate::codec::Codec;
use crate::error::RetryError;
use crate::handler::RetryHandler;
use crate::listener::RetryListener;
use crate::task::{RetryTask, TaskId, TaskStore};

/// What a scheduler fires: one retry pass for one identity.
pub trait Tick: Send + Sync + 'static {
    /// Identity the pass works on.
    fn identity(&self) -> &str;
    /// Run the pass. Only failing to load the task list is an error;
    /// per-task problems are counted in the report.
    fn run(&self) -> Result<TickReport, RetryError>;
}

/// Outcome counters for one pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    /// Tasks replayed successfully and deleted.
    pub succeeded: usize,
    /// Tasks whose replay failed; back to `PENDING`.
    pub failed: usize,
    /// Tasks whose payload could not be decoded; back to `PENDING`.
    pub undecodable: usize,
    /// Tasks skipped or left behind because a store call failed.
    pub store_errors: usize,
    /// Tasks left alone because their live call was still running.
    pub in_flight: usize,
}

impl TickReport {
    /// Tasks touched in this pass; in-flight skips are not counted.
    pub fn total(&self) -> usize {
        self.succeeded + self.failed + self.undecodable + self.store_errors
    }
}

/// Replays the stored arguments of one handler.
///
/// The handler is called directly, never through [`crate::capture::FailureCapture`],
/// so a failed replay does not create a second task.
pub struct RetryProcessor<H: RetryHandler> {
    handler: Arc<H>,
    store: Arc<dyn TaskStore>,
    codec: Codec,
    listener: Option<Arc<dyn RetryListener>>,
    in_flight: Option<Arc<InFlight>>,
}

impl<H: RetryHandler> RetryProcessor<H> {
    /// Processor for `handler` over `store`. The handler's listener, if any,
    /// is told about each replay.
    pub fn new(handler: Arc<H>, store: Arc<dyn TaskStore>, codec: Codec) -> Self {
        let listener = handler.listener();
        Self { handler, store, codec, listener, in_flight: None }
    }

    /// Skip tasks whose live call is listed in `in_flight`.
    pub fn with_in_flight(mut self, in_flight: Arc<InFlight>) -> Self {
        self.in_flight = Some(in_flight);
        self
    }

    fn is_in_flight(&self, id: TaskId) -> bool {
        self.in_flight.as_ref().is_some_and(|live| live.contains(id))
    }

    fn notify_failure(&self, task: &RetryTask, error: &anyhow::Error) {
        if let Some(listener) = &self.listener {
            listener.on_retry_failure(task, error);
        }
    }

    fn revert(&self, id: TaskId, report: &mut TickReport) -> bool {
        match self.store.revert_to_pending(id) {
            Ok(()) => true,
            Err(e) => {
                error!(identity = self.handler.identity(), task = %id, error = %e, "failed to revert task to pending");
                report.store_errors += 1;
                false
            }
        }
    }
}

impl<H: RetryHandler> Tick for RetryProcessor<H> {
    fn identity(&self) -> &str {
        self.handler.identity()
    }

    fn run(&self) -> Result<TickReport, RetryError> {
        let identity = self.handler.identity();
        let tasks = self.store.list_pending(identity)?;
        let mut report = TickReport::default();

        for task in tasks {
            if self.is_in_flight(task.id) {
                debug!(identity, task = %task.id, "live call still running, not replaying");
                report.in_flight += 1;
                continue;
            }
            if let Err(e) = self.store.mark_retrying(task.id) {
                error!(identity, task = %task.id, error = %e, "failed to mark task retrying");
                report.store_errors += 1;
                continue;
            }

            let arg = match self.codec.decode::<H::Arg>(&task.payload) {
                Ok(arg) => arg,
                Err(e) => {
                    error!(identity, task = %task.id, error = %e, "undecodable task payload");
                    if self.revert(task.id, &mut report) {
                        report.undecodable += 1;
                    }
                    self.notify_failure(&task, &anyhow::Error::new(e));
                    continue;
                }
            };

            let outcome = catch_unwind(AssertUnwindSafe(|| self.handler.handle(&arg)))
                .unwrap_or_else(|_| Err(anyhow::anyhow!("handler panicked")));
            match outcome {
                Ok(_) => match self.store.delete(task.id) {
                    Ok(()) => {
                        report.succeeded += 1;
                        if let Some(listener) = &self.listener {
                            listener.on_retry_success(&task);
                        }
                    }
                    Err(e) => {
                        error!(identity, task = %task.id, error = %e, "replay succeeded but task could not be deleted");
                        report.store_errors += 1;
                    }
                },
                Err(e) => {
                    warn!(identity, task = %task.id, attempts = task.attempts + 1, error = %e, "retry failed");
                    if self.revert(task.id, &mut report) {
                        report.failed += 1;
                    }
                    self.notify_failure(&task, &e);
                }
            }
        }
        Ok(report)
    }
}

/// Result of asking an [`ExclusiveTick`] to fire.
#[derive(Debug)]
pub enum TickOutcome {
    /// The pass ran to completion.
    Completed(TickReport),
    /// Another pass for the same identity was still running.
    Skipped,
    /// The pass could not load its tasks.
    Failed(RetryError),
}

/// Guarantees at most one running pass per identity; overlapping fires are
/// skipped, not queued.
pub struct ExclusiveTick {
    tick: Arc<dyn Tick>,
    running: AtomicBool,
}

struct Running<'a>(&'a AtomicBool);

impl Drop for Running<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl ExclusiveTick {
    /// Guard `tick`.
    pub fn new(tick: Arc<dyn Tick>) -> Self {
        Self { tick, running: AtomicBool::new(false) }
    }

    /// Identity of the guarded pass.
    pub fn identity(&self) -> &str {
        self.tick.identity()
    }

    /// Whether a pass is executing right now.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Run one pass unless one is already in flight. Blocking.
    pub fn fire(&self) -> TickOutcome {
        let identity = self.tick.identity();
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!(identity, "previous tick still running, skipping");
            return TickOutcome::Skipped;
        }
        let _running = Running(&self.running);

        match self.tick.run() {
            Ok(report) if report.total() == 0 && report.in_flight == 0 => {
                debug!(identity, "tick: nothing to retry");
                TickOutcome::Completed(report)
            }
            Ok(report) => {
                info!(
                    identity,
                    succeeded = report.succeeded,
                    failed = report.failed,
                    undecodable = report.undecodable,
                    store_errors = report.store_errors,
                    in_flight = report.in_flight,
                    "tick finished"
                );
                TickOutcome::Completed(report)
            }
            Err(e) => {
                error!(identity, error = %e, "tick failed");
                TickOutcome::Failed(e)
            }
        }
    }
}
