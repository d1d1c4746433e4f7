//! Single-process scheduler: one timer loop per job, ticks executed on the
//! runtime's blocking pool, optionally capped.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{error, info};

use crate::error::{Result, RetryError};
use crate::handler::{CronExpr, HandlerDescriptor, Schedule};
use crate::job::{JobInfo, JobStatus};
use crate::processor::{ExclusiveTick, Tick, TickOutcome};
use crate::scheduler::shutdown_requested;

/// Local scheduler settings.
#[derive(Debug, Clone)]
pub struct LocalSchedulerConfig {
    /// Wait before an auto-started job fires for the first time.
    pub startup_delay: Duration,
    /// Cap on ticks running at the same time across all jobs. `None` leaves
    /// it unbounded, so a slow handler never holds up another one.
    pub max_workers: Option<usize>,
}

impl Default for LocalSchedulerConfig {
    fn default() -> Self {
        Self { startup_delay: Duration::from_secs(30), max_workers: None }
    }
}

struct LocalJob {
    index: usize,
    info: JobInfo,
    control: watch::Sender<JobStatus>,
    tick: Arc<ExclusiveTick>,
    handle: Option<JoinHandle<()>>,
}

/// In-process cron / fixed-rate scheduler for retry jobs.
pub struct LocalScheduler {
    config: LocalSchedulerConfig,
    pool: Option<Arc<Semaphore>>,
    jobs: Mutex<HashMap<String, LocalJob>>,
    job_index: AtomicUsize,
    shutdown: watch::Sender<bool>,
    runtime: Handle,
}

impl LocalScheduler {
    /// Scheduler bound to the current Tokio runtime.
    pub fn new(config: LocalSchedulerConfig) -> Result<Self> {
        Ok(Self::with_runtime(config, Handle::try_current()?))
    }

    /// Scheduler spawning its job loops on `runtime`.
    pub fn with_runtime(config: LocalSchedulerConfig, runtime: Handle) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            pool: config.max_workers.map(|n| Arc::new(Semaphore::new(n.max(1)))),
            config,
            jobs: Mutex::new(HashMap::new()),
            job_index: AtomicUsize::new(0),
            shutdown,
            runtime,
        }
    }

    /// Settings in effect.
    pub fn config(&self) -> &LocalSchedulerConfig {
        &self.config
    }

    /// Create the job for `descriptor`. Auto-started jobs begin firing after
    /// the startup delay; the others wait in `PREPARE` for [`start`](Self::start).
    pub fn register(&self, descriptor: &HandlerDescriptor, tick: Arc<dyn Tick>, auto_start: bool) -> Result<JobInfo> {
        let mut jobs = self.jobs.lock().unwrap_or_else(PoisonError::into_inner);
        if jobs.contains_key(&descriptor.identity) {
            return Err(RetryError::DuplicateIdentity(descriptor.identity.clone()));
        }

        let index = self.job_index.fetch_add(1, Ordering::Relaxed) + 1;
        let status = if auto_start { JobStatus::Running } else { JobStatus::Prepare };
        let info = JobInfo {
            job_name: format!("JOB.{index}.{}", descriptor.identity),
            group: format!("RETRY_JOB_GROUP_{index}"),
            identity: descriptor.identity.clone(),
            name: descriptor.name.clone(),
            period: descriptor.schedule.to_string(),
            status,
        };

        let (control, control_rx) = watch::channel(status);
        let tick = Arc::new(ExclusiveTick::new(tick));
        let job_loop = JobLoop {
            trigger: Trigger::from(&descriptor.schedule),
            tick: tick.clone(),
            pool: self.pool.clone(),
            control: control_rx,
            shutdown: self.shutdown.subscribe(),
            startup_delay: if auto_start { self.config.startup_delay } else { Duration::ZERO },
        };
        let handle = self.runtime.spawn(job_loop.run());

        info!(
            identity = %info.identity,
            job = %info.job_name,
            period = %info.period,
            status = ?status,
            "retry job registered"
        );
        jobs.insert(descriptor.identity.clone(), LocalJob { index, info: info.clone(), control, tick, handle: Some(handle) });
        Ok(info)
    }

    /// Begin firing a `PREPARE` or `STOPPED` job.
    pub fn start(&self, identity: &str) -> Result<()> {
        self.set_status(identity, JobStatus::Running)
    }

    /// Stop firing. A tick already running finishes first.
    pub fn stop(&self, identity: &str) -> Result<()> {
        self.set_status(identity, JobStatus::Stopped)
    }

    fn set_status(&self, identity: &str, status: JobStatus) -> Result<()> {
        let jobs = self.jobs.lock().unwrap_or_else(PoisonError::into_inner);
        let job = jobs.get(identity).ok_or_else(|| RetryError::UnknownJob(identity.to_string()))?;
        let changed = job.control.send_if_modified(|current| {
            let changed = *current != status;
            *current = status;
            changed
        });
        if changed {
            info!(identity, status = ?status, "retry job status changed");
        }
        Ok(())
    }

    /// Current status of a job.
    pub fn status(&self, identity: &str) -> Option<JobStatus> {
        let jobs = self.jobs.lock().unwrap_or_else(PoisonError::into_inner);
        jobs.get(identity).map(|j| *j.control.borrow())
    }

    /// All jobs, in registration order.
    pub fn jobs(&self) -> Vec<JobInfo> {
        let jobs = self.jobs.lock().unwrap_or_else(PoisonError::into_inner);
        let mut out: Vec<(usize, JobInfo)> = jobs
            .values()
            .map(|j| {
                let mut info = j.info.clone();
                info.status = *j.control.borrow();
                (j.index, info)
            })
            .collect();
        out.sort_by_key(|(i, _)| *i);
        out.into_iter().map(|(_, info)| info).collect()
    }

    /// Fire one tick right now, whatever the job status. Overlap with a
    /// scheduled tick of the same identity yields [`TickOutcome::Skipped`].
    pub async fn trigger(&self, identity: &str) -> Result<TickOutcome> {
        let tick = {
            let jobs = self.jobs.lock().unwrap_or_else(PoisonError::into_inner);
            jobs.get(identity)
                .map(|j| j.tick.clone())
                .ok_or_else(|| RetryError::UnknownJob(identity.to_string()))?
        };
        let permit = match &self.pool {
            Some(pool) => Some(pool.clone().acquire_owned().await.map_err(|_| RetryError::SchedulerClosed)?),
            None => None,
        };
        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            tick.fire()
        })
        .await
        .map_err(|e| {
            error!(identity, error = %e, "manual tick panicked");
            RetryError::TickAborted(identity.to_string())
        })
    }

    /// Stop every job loop and wait for in-flight ticks to finish.
    pub async fn shutdown(&self) {
        self.shutdown.send_replace(true);
        let handles: Vec<JoinHandle<()>> = {
            let mut jobs = self.jobs.lock().unwrap_or_else(PoisonError::into_inner);
            jobs.values_mut()
                .filter_map(|j| {
                    j.control.send_replace(JobStatus::Stopped);
                    j.handle.take()
                })
                .collect()
        };
        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "retry job loop ended abnormally");
            }
        }
        info!("local retry scheduler stopped");
    }
}

/* --------------------- triggers --------------------- */

#[derive(Debug, Clone)]
enum Trigger {
    Cron(CronExpr),
    FixedRate(Duration),
}

#[derive(Debug, Clone, Copy)]
enum Fire {
    At(Instant),
    Cron(DateTime<Utc>),
}

impl From<&Schedule> for Trigger {
    fn from(schedule: &Schedule) -> Self {
        match schedule {
            Schedule::Cron(expr) => Trigger::Cron(expr.clone()),
            Schedule::Interval(secs) => Trigger::FixedRate(Duration::from_secs(*secs)),
        }
    }
}

impl Trigger {
    /// Delay until the next fire after `last`, and the mark to record for it.
    /// Slots missed while a tick overran are skipped, not replayed.
    fn next(&self, last: Option<Fire>) -> Option<(Duration, Fire)> {
        match (self, last) {
            (Trigger::FixedRate(_), None) | (Trigger::FixedRate(_), Some(Fire::Cron(_))) => {
                Some((Duration::ZERO, Fire::At(Instant::now())))
            }
            (Trigger::FixedRate(period), Some(Fire::At(last))) => {
                let now = Instant::now();
                let elapsed = now.saturating_duration_since(last);
                let periods = (elapsed.as_nanos() / period.as_nanos().max(1) + 1).min(u32::MAX as u128) as u32;
                // An interval too large to represent never fires again.
                let due = period.checked_mul(periods).and_then(|d| last.checked_add(d))?;
                Some((due.saturating_duration_since(now), Fire::At(due)))
            }
            (Trigger::Cron(expr), last) => {
                let now = Utc::now();
                let after = match last {
                    Some(Fire::Cron(prev)) if prev > now => prev,
                    _ => now,
                };
                let next = expr.next_after(after)?;
                let delay = (next - now).to_std().unwrap_or(Duration::ZERO);
                Some((delay, Fire::Cron(next)))
            }
        }
    }
}

/* --------------------- job loop --------------------- */

struct JobLoop {
    trigger: Trigger,
    tick: Arc<ExclusiveTick>,
    pool: Option<Arc<Semaphore>>,
    control: watch::Receiver<JobStatus>,
    shutdown: watch::Receiver<bool>,
    startup_delay: Duration,
}

impl JobLoop {
    async fn run(mut self) {
        let identity = self.tick.identity().to_string();

        if !self.startup_delay.is_zero() {
            tokio::select! {
                _ = sleep(self.startup_delay) => {}
                _ = shutdown_requested(&mut self.shutdown) => return,
            }
        }

        let mut last: Option<Fire> = None;
        loop {
            let status = *self.control.borrow_and_update();
            if status != JobStatus::Running {
                tokio::select! {
                    changed = self.control.changed() => {
                        if changed.is_err() { return; }
                        continue;
                    }
                    _ = shutdown_requested(&mut self.shutdown) => return,
                }
            }

            let Some((delay, fire)) = self.trigger.next(last) else {
                info!(identity = %identity, "trigger has no further fire times");
                return;
            };
            tokio::select! {
                _ = sleep(delay) => {}
                changed = self.control.changed() => {
                    if changed.is_err() { return; }
                    continue;
                }
                _ = shutdown_requested(&mut self.shutdown) => return,
            }
            last = Some(fire);

            let permit = match self.pool.clone() {
                Some(pool) => tokio::select! {
                    permit = pool.acquire_owned() => match permit {
                        Ok(p) => Some(p),
                        Err(_) => return,
                    },
                    _ = shutdown_requested(&mut self.shutdown) => return,
                },
                None => None,
            };
            let tick = self.tick.clone();
            // Awaited before the next fire is computed: one tick per identity
            // at a time, and shutdown lets it finish.
            let done = tokio::task::spawn_blocking(move || {
                let _permit = permit;
                tick.fire()
            })
            .await;
            if let Err(e) = done {
                error!(identity = %identity, error = %e, "retry tick panicked");
            }
        }
    }
}
