//! Cluster-sharded scheduling through a coordination service.
//!
//! Every node registers the same job definition; the coordinator decides
//! which node runs each cron fire. Only cron schedules are accepted because
//! nodes agree on fires by their cron-aligned timestamps.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::info;

use crate::error::{Result, RetryError};
use crate::handler::{CronExpr, HandlerDescriptor, Schedule};
use crate::job::{JobInfo, JobStatus};
use crate::processor::{ExclusiveTick, Tick};

/// Single logical shard: one winner runs the whole pass.
pub const DEFAULT_SHARDING_TOTAL_COUNT: u32 = 1;

/// Job definition handed to the coordination service.
pub struct CoordinatedJob {
    /// Job name (the handler identity).
    pub name: String,
    /// Fire schedule.
    pub cron: CronExpr,
    /// Number of shards a fire is split into.
    pub sharding_total_count: u32,
    /// Human-readable description (handler display name).
    pub description: String,
    /// Registered disabled; the coordinator owns enable/disable from then on.
    pub disabled: bool,
    /// Pass to run on the winning node.
    pub tick: Arc<ExclusiveTick>,
}

/// Cluster coordination service contract.
pub trait Coordinator: Send + Sync + 'static {
    /// Register a job on this node.
    fn register(&self, job: CoordinatedJob) -> Result<()>;
    /// Allow the job to fire.
    fn enable(&self, name: &str) -> Result<()>;
    /// Stop the job from firing.
    fn disable(&self, name: &str) -> Result<()>;
    /// Whether the job is enabled; `None` if unknown.
    fn is_enabled(&self, name: &str) -> Option<bool>;
    /// Stop scheduling on this node. Running passes are not interrupted.
    fn shutdown(&self);
}

/// Backend that hands retry jobs to a [`Coordinator`].
pub struct DistributedScheduler {
    coordinator: Arc<dyn Coordinator>,
    job_index: AtomicUsize,
}

impl DistributedScheduler {
    /// Backend over `coordinator`.
    pub fn new(coordinator: Arc<dyn Coordinator>) -> Self {
        Self { coordinator, job_index: AtomicUsize::new(0) }
    }

    /// The cron expression of `descriptor`, or the configuration error for
    /// an interval schedule.
    pub fn check(descriptor: &HandlerDescriptor) -> Result<&CronExpr> {
        match &descriptor.schedule {
            Schedule::Cron(expr) => Ok(expr),
            Schedule::Interval(_) => Err(RetryError::CronRequired(descriptor.identity.clone())),
        }
    }

    /// Register the job with the coordination service.
    pub fn register(&self, descriptor: &HandlerDescriptor, tick: Arc<dyn Tick>, auto_start: bool) -> Result<JobInfo> {
        let cron = Self::check(descriptor)?.clone();
        let index = self.job_index.fetch_add(1, Ordering::Relaxed) + 1;
        let period = cron.as_str().to_string();

        self.coordinator.register(CoordinatedJob {
            name: descriptor.identity.clone(),
            cron,
            sharding_total_count: DEFAULT_SHARDING_TOTAL_COUNT,
            description: descriptor.name.clone(),
            disabled: !auto_start,
            tick: Arc::new(ExclusiveTick::new(tick)),
        })?;
        info!(identity = %descriptor.identity, "retry job registered with the coordination service");

        Ok(JobInfo {
            job_name: format!("job.{}.{index}", descriptor.identity),
            group: "distributed".to_string(),
            identity: descriptor.identity.clone(),
            name: descriptor.name.clone(),
            period,
            status: if auto_start { JobStatus::Running } else { JobStatus::Prepare },
        })
    }

    /// Enable a job cluster-wide (as far as the coordinator propagates it).
    pub fn enable(&self, identity: &str) -> Result<()> {
        self.coordinator.enable(identity)
    }

    /// Disable a job.
    pub fn disable(&self, identity: &str) -> Result<()> {
        self.coordinator.disable(identity)
    }

    /// Status as reported by the coordinator.
    pub fn status(&self, identity: &str) -> Option<JobStatus> {
        self.coordinator
            .is_enabled(identity)
            .map(|on| if on { JobStatus::Running } else { JobStatus::Stopped })
    }

    /// Stop scheduling on this node.
    pub fn shutdown(&self) {
        self.coordinator.shutdown();
    }
}
