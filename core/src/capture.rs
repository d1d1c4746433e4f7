//! Failure-capture wrapper: turns a failed call into a persisted retry task.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, error, warn};

use crate::codec::Codec;
use crate::error::RetryError;
use crate::handler::{BackendKind, RetryHandler};
use crate::listener::RetryListener;
use crate::task::{TaskId, TaskStore};

/// Tasks written ahead of a live call that has not returned yet.
///
/// The retry pass of the same process skips these, so a task is never
/// replayed while its original call is still running. Other processes
/// sharing the store do not see this set.
#[derive(Debug, Default)]
pub struct InFlight {
    ids: Mutex<HashSet<TaskId>>,
}

impl InFlight {
    /// Empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the live call behind `id` is still running.
    pub fn contains(&self, id: TaskId) -> bool {
        self.lock().contains(&id)
    }

    /// Live calls currently running.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// No live call is running.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, HashSet<TaskId>> {
        self.ids.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Retry-capable face of a handler.
///
/// With `persist_before` the argument is written as a `PENDING` task before
/// the handler runs and removed on success, so a crash mid-call loses nothing.
/// Without it the task is written only after a failure, which saves a write
/// per successful call but loses the task if the process dies in between.
///
/// Handler errors always propagate to the caller once bookkeeping is done.
pub struct FailureCapture<H: RetryHandler> {
    inner: Arc<H>,
    store: Arc<dyn TaskStore>,
    codec: Codec,
    persist_before: bool,
    capturing: bool,
    in_flight: Arc<InFlight>,
}

impl<H: RetryHandler> std::fmt::Debug for FailureCapture<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FailureCapture")
            .field("codec", &self.codec)
            .field("persist_before", &self.persist_before)
            .field("capturing", &self.capturing)
            .field("in_flight", &self.in_flight)
            .finish_non_exhaustive()
    }
}

impl<H: RetryHandler> FailureCapture<H> {
    /// Decorate `inner`.
    pub fn wrap(inner: Arc<H>, store: Arc<dyn TaskStore>, codec: Codec, persist_before: bool) -> Self {
        Self { inner, store, codec, persist_before, capturing: true, in_flight: Arc::new(InFlight::new()) }
    }

    /// Wrapper that calls `inner` and records nothing.
    pub fn passthrough(inner: Arc<H>, store: Arc<dyn TaskStore>, codec: Codec) -> Self {
        Self { capturing: false, ..Self::wrap(inner, store, codec, false) }
    }

    /// Whether failed calls are recorded at all.
    pub fn is_capturing(&self) -> bool {
        self.capturing
    }

    /// Tasks of live calls still running; share with the retry pass.
    pub fn in_flight(&self) -> Arc<InFlight> {
        self.in_flight.clone()
    }

    /// The undecorated handler (what the retry processor replays against).
    pub fn inner(&self) -> &Arc<H> {
        &self.inner
    }

    /// Whether tasks are written ahead of the call.
    pub fn persists_before(&self) -> bool {
        self.persist_before
    }

    /// Call the handler, recording `arg` for retry if it fails.
    ///
    /// In persist-before mode a failed task write aborts the call before the
    /// handler runs, since the task could not be guaranteed.
    pub fn invoke(&self, arg: &H::Arg) -> anyhow::Result<H::Output> {
        let identity = self.inner.identity();
        if !self.capturing {
            return self.inner.handle(arg);
        }
        if self.persist_before {
            let id = {
                // Saved and marked under one lock so a concurrent pass either
                // misses the task or sees it in flight.
                let mut live = self.in_flight.lock();
                let id = self.persist(arg)?;
                live.insert(id);
                id
            };
            let result = self.inner.handle(arg);
            let mut live = self.in_flight.lock();
            let out = match result {
                Ok(out) => {
                    if let Err(e) = self.store.delete(id) {
                        // The task stays behind and gets replayed once more.
                        warn!(identity, task = %id, error = %e, "failed to drop task after success");
                    }
                    Ok(out)
                }
                Err(err) => {
                    debug!(identity, task = %id, error = %err, "invocation failed, task kept for retry");
                    Err(err)
                }
            };
            live.remove(&id);
            out
        } else {
            match self.inner.handle(arg) {
                Ok(out) => Ok(out),
                Err(err) => {
                    match self.persist(arg) {
                        Ok(id) => debug!(identity, task = %id, error = %err, "invocation failed, task saved for retry"),
                        Err(e) => error!(identity, error = %e, "invocation failed and the retry task could not be saved"),
                    }
                    Err(err)
                }
            }
        }
    }

    fn persist(&self, arg: &H::Arg) -> Result<TaskId, RetryError> {
        let payload = self.codec.encode(arg)?;
        Ok(self.store.save(self.inner.identity(), &payload)?)
    }
}

impl<H: RetryHandler> RetryHandler for FailureCapture<H> {
    type Arg = H::Arg;
    type Output = H::Output;

    fn identity(&self) -> &str {
        self.inner.identity()
    }
    fn name(&self) -> &str {
        self.inner.name()
    }
    fn cron(&self) -> Option<&str> {
        self.inner.cron()
    }
    fn interval_secs(&self) -> Option<u64> {
        self.inner.interval_secs()
    }
    fn auto_start(&self) -> bool {
        self.inner.auto_start()
    }
    fn backend(&self) -> Option<BackendKind> {
        self.inner.backend()
    }
    fn listener(&self) -> Option<Arc<dyn RetryListener>> {
        self.inner.listener()
    }
    fn handle(&self, arg: &Self::Arg) -> anyhow::Result<Self::Output> {
        self.invoke(arg)
    }
}
