//! Scheduling backends that drive the retry processors.

use std::sync::Arc;
use tokio::sync::watch;

use crate::error::Result;
use crate::handler::{BackendKind, HandlerDescriptor};
use crate::job::JobInfo;
use crate::processor::Tick;

/// Cluster-coordinated scheduling.
pub mod distributed;
/// In-process coordination service for the distributed backend.
pub mod embedded;
/// Single-process scheduling.
pub mod local;

pub use distributed::{CoordinatedJob, Coordinator, DistributedScheduler};
pub use embedded::{EmbeddedCoordinator, FireLedger, MemoryFireLedger};
pub use local::{LocalScheduler, LocalSchedulerConfig};

/// The backend a handler is bound to, chosen per handler at registration.
#[derive(Clone)]
pub enum SchedulerBackend {
    /// In-process timers.
    Local(Arc<LocalScheduler>),
    /// Coordination-service jobs.
    Distributed(Arc<DistributedScheduler>),
}

impl SchedulerBackend {
    /// Which variant this is.
    pub fn kind(&self) -> BackendKind {
        match self {
            SchedulerBackend::Local(_) => BackendKind::Local,
            SchedulerBackend::Distributed(_) => BackendKind::Distributed,
        }
    }

    /// Bind `tick` to a job for `descriptor`.
    pub fn register(&self, descriptor: &HandlerDescriptor, tick: Arc<dyn Tick>, auto_start: bool) -> Result<JobInfo> {
        match self {
            SchedulerBackend::Local(s) => s.register(descriptor, tick, auto_start),
            SchedulerBackend::Distributed(s) => s.register(descriptor, tick, auto_start),
        }
    }

    /// Reject a descriptor this backend cannot schedule, before any side effect.
    pub fn check(&self, descriptor: &HandlerDescriptor) -> Result<()> {
        match self {
            SchedulerBackend::Local(_) => Ok(()),
            SchedulerBackend::Distributed(_) => DistributedScheduler::check(descriptor).map(|_| ()),
        }
    }
}

/// Resolves once `rx` reads `true` or its sender is gone.
pub(crate) async fn shutdown_requested(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}
