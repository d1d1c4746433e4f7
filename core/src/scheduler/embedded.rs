//! Embedded coordination service.
//!
//! Each node runs its own cron loop per job and asks a shared [`FireLedger`]
//! for every fire; only the node granted the claim runs the pass. Nodes in one
//! process can share a [`MemoryFireLedger`]; a multi-host cluster plugs in a
//! ledger backed by shared storage.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info};

use crate::error::{Result, RetryError};
use crate::handler::CronExpr;
use crate::processor::ExclusiveTick;
use crate::scheduler::distributed::{CoordinatedJob, Coordinator};
use crate::scheduler::shutdown_requested;

/// Grants each `(job, fire time)` to exactly one node, and holds the job
/// until the winner releases it so a pass never overlaps another node's.
pub trait FireLedger: Send + Sync + 'static {
    /// Claim the fire for `node`. Returns `true` for the single winner;
    /// asking again as the winner is idempotent. A fire is refused while any
    /// node still holds an earlier claim on the same job.
    fn try_claim(&self, job: &str, fire_at: DateTime<Utc>, node: &str) -> bool;

    /// Give the job back once `node` has finished the pass for `fire_at`.
    fn release(&self, job: &str, fire_at: DateTime<Utc>, node: &str);
}

#[derive(Debug)]
struct Claim {
    fire_at: DateTime<Utc>,
    owner: String,
    held: bool,
}

/// In-process ledger keeping the latest claimed fire per job.
#[derive(Debug, Default)]
pub struct MemoryFireLedger {
    claims: Mutex<HashMap<String, Claim>>,
}

impl MemoryFireLedger {
    /// Empty ledger.
    pub fn new() -> Self {
        Self::default()
    }
}

impl FireLedger for MemoryFireLedger {
    fn try_claim(&self, job: &str, fire_at: DateTime<Utc>, node: &str) -> bool {
        let mut claims = self.claims.lock().unwrap_or_else(PoisonError::into_inner);
        match claims.get(job) {
            Some(c) if c.fire_at == fire_at => c.owner == node,
            // Late arrival for a fire that has already been superseded.
            Some(c) if c.fire_at > fire_at => false,
            // The previous pass is still running somewhere.
            Some(c) if c.held => false,
            _ => {
                claims.insert(job.to_string(), Claim { fire_at, owner: node.to_string(), held: true });
                true
            }
        }
    }

    fn release(&self, job: &str, fire_at: DateTime<Utc>, node: &str) {
        let mut claims = self.claims.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(c) = claims.get_mut(job) {
            if c.fire_at == fire_at && c.owner == node {
                c.held = false;
            }
        }
    }
}

/// Releases a granted claim when the pass ends, panics included.
struct ClaimGuard<'a> {
    ledger: &'a dyn FireLedger,
    job: &'a str,
    node: &'a str,
    fire_at: DateTime<Utc>,
}

impl Drop for ClaimGuard<'_> {
    fn drop(&mut self) {
        self.ledger.release(self.job, self.fire_at, self.node);
    }
}

struct EmbeddedJob {
    enabled: watch::Sender<bool>,
    handle: Option<JoinHandle<()>>,
}

/// One node's view of the embedded coordination service.
pub struct EmbeddedCoordinator {
    node_id: String,
    ledger: Arc<dyn FireLedger>,
    jobs: Mutex<HashMap<String, EmbeddedJob>>,
    shutdown: watch::Sender<bool>,
    runtime: Handle,
}

impl EmbeddedCoordinator {
    /// Node `node_id` sharing `ledger` with its peers, on the current runtime.
    pub fn new(node_id: impl Into<String>, ledger: Arc<dyn FireLedger>) -> Result<Self> {
        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            node_id: node_id.into(),
            ledger,
            jobs: Mutex::new(HashMap::new()),
            shutdown,
            runtime: Handle::try_current()?,
        })
    }

    /// This node's id.
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Signal shutdown and wait for every job loop (and its running pass).
    pub async fn shutdown_and_wait(&self) {
        self.shutdown.send_replace(true);
        let handles: Vec<JoinHandle<()>> = {
            let mut jobs = self.jobs.lock().unwrap_or_else(PoisonError::into_inner);
            jobs.values_mut().filter_map(|j| j.handle.take()).collect()
        };
        for handle in handles {
            if let Err(e) = handle.await {
                error!(node = %self.node_id, error = %e, "coordinated job loop ended abnormally");
            }
        }
    }

    fn set_enabled(&self, name: &str, on: bool) -> Result<()> {
        let jobs = self.jobs.lock().unwrap_or_else(PoisonError::into_inner);
        let job = jobs.get(name).ok_or_else(|| RetryError::UnknownJob(name.to_string()))?;
        job.enabled.send_replace(on);
        info!(node = %self.node_id, job = name, enabled = on, "coordinated job toggled");
        Ok(())
    }
}

impl Coordinator for EmbeddedCoordinator {
    fn register(&self, job: CoordinatedJob) -> Result<()> {
        if job.sharding_total_count != 1 {
            return Err(RetryError::Coordination(format!(
                "job {}: embedded coordinator runs a single shard, got {}",
                job.name, job.sharding_total_count
            )));
        }
        let mut jobs = self.jobs.lock().unwrap_or_else(PoisonError::into_inner);
        if jobs.contains_key(&job.name) {
            return Err(RetryError::Coordination(format!("job {} already registered on this node", job.name)));
        }

        let (enabled, enabled_rx) = watch::channel(!job.disabled);
        let job_loop = NodeLoop {
            node_id: self.node_id.clone(),
            name: job.name.clone(),
            cron: job.cron,
            tick: job.tick,
            ledger: self.ledger.clone(),
            enabled: enabled_rx,
            shutdown: self.shutdown.subscribe(),
        };
        let handle = self.runtime.spawn(job_loop.run());
        debug!(node = %self.node_id, job = %job.name, description = %job.description, "coordinated job added");
        jobs.insert(job.name, EmbeddedJob { enabled, handle: Some(handle) });
        Ok(())
    }

    fn enable(&self, name: &str) -> Result<()> {
        self.set_enabled(name, true)
    }

    fn disable(&self, name: &str) -> Result<()> {
        self.set_enabled(name, false)
    }

    fn is_enabled(&self, name: &str) -> Option<bool> {
        let jobs = self.jobs.lock().unwrap_or_else(PoisonError::into_inner);
        jobs.get(name).map(|j| *j.enabled.borrow())
    }

    fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }
}

struct NodeLoop {
    node_id: String,
    name: String,
    cron: CronExpr,
    tick: Arc<ExclusiveTick>,
    ledger: Arc<dyn FireLedger>,
    enabled: watch::Receiver<bool>,
    shutdown: watch::Receiver<bool>,
}

impl NodeLoop {
    async fn run(mut self) {
        let mut last: Option<DateTime<Utc>> = None;
        loop {
            if !*self.enabled.borrow_and_update() {
                tokio::select! {
                    changed = self.enabled.changed() => {
                        if changed.is_err() { return; }
                        continue;
                    }
                    _ = shutdown_requested(&mut self.shutdown) => return,
                }
            }

            let now = Utc::now();
            let after = last.filter(|l| *l > now).unwrap_or(now);
            let Some(fire_at) = self.cron.next_after(after) else {
                info!(node = %self.node_id, job = %self.name, "cron has no further fire times");
                return;
            };
            let delay = (fire_at - now).to_std().unwrap_or(Duration::ZERO);
            tokio::select! {
                _ = sleep(delay) => {}
                changed = self.enabled.changed() => {
                    if changed.is_err() { return; }
                    continue;
                }
                _ = shutdown_requested(&mut self.shutdown) => return,
            }
            last = Some(fire_at);

            if !self.ledger.try_claim(&self.name, fire_at, &self.node_id) {
                debug!(node = %self.node_id, job = %self.name, %fire_at, "fire won or held by another node");
                continue;
            }
            let _claim = ClaimGuard { ledger: self.ledger.as_ref(), job: &self.name, node: &self.node_id, fire_at };
            let tick = self.tick.clone();
            if let Err(e) = tokio::task::spawn_blocking(move || tick.fire()).await {
                error!(node = %self.node_id, job = %self.name, error = %e, "coordinated tick panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::{Tick, TickReport};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn ledger_grants_one_winner_per_fire() {
        let ledger = MemoryFireLedger::new();
        let t0 = Utc::now();
        let t1 = t0 + chrono::Duration::seconds(1);

        assert!(ledger.try_claim("job", t0, "a"));
        assert!(!ledger.try_claim("job", t0, "b"));
        assert!(ledger.try_claim("job", t0, "a"));
        ledger.release("job", t0, "a");
        assert!(ledger.try_claim("job", t1, "b"));
        assert!(!ledger.try_claim("job", t0, "c"));
        assert!(ledger.try_claim("other", t0, "c"));
    }

    #[test]
    fn ledger_holds_the_job_until_released() {
        let ledger = MemoryFireLedger::new();
        let t0 = Utc::now();
        let t1 = t0 + chrono::Duration::seconds(1);
        let t2 = t0 + chrono::Duration::seconds(2);

        assert!(ledger.try_claim("job", t0, "a"));
        assert!(!ledger.try_claim("job", t1, "b"));
        assert!(!ledger.try_claim("job", t1, "a"));

        // Only the holder can release.
        ledger.release("job", t0, "b");
        assert!(!ledger.try_claim("job", t2, "b"));

        ledger.release("job", t0, "a");
        assert!(ledger.try_claim("job", t2, "b"));
    }

    #[derive(Default)]
    struct Shared {
        runs: AtomicUsize,
        active: AtomicUsize,
        peak: AtomicUsize,
        hold: Duration,
    }

    impl Shared {
        fn holding(hold: Duration) -> Arc<Self> {
            Arc::new(Self { hold, ..Self::default() })
        }
        fn runs(&self) -> usize {
            self.runs.load(Ordering::SeqCst)
        }
    }

    impl Tick for Shared {
        fn identity(&self) -> &str {
            "shared"
        }
        fn run(&self) -> Result<TickReport> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(self.hold);
            self.active.fetch_sub(1, Ordering::SeqCst);
            Ok(TickReport::default())
        }
    }

    fn job(tick: &Arc<Shared>, disabled: bool) -> CoordinatedJob {
        CoordinatedJob {
            name: "shared".into(),
            cron: CronExpr::parse("* * * * * *").unwrap(),
            sharding_total_count: 1,
            description: "every second".into(),
            disabled,
            tick: Arc::new(ExclusiveTick::new(tick.clone())),
        }
    }

    fn cluster(ledger: &Arc<dyn FireLedger>, tick: &Arc<Shared>) -> Vec<EmbeddedCoordinator> {
        let nodes: Vec<EmbeddedCoordinator> = ["n1", "n2", "n3"]
            .into_iter()
            .map(|id| EmbeddedCoordinator::new(id, ledger.clone()).unwrap())
            .collect();
        for node in &nodes {
            node.register(job(tick, false)).unwrap();
        }
        nodes
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn three_nodes_run_each_fire_once() {
        let ledger: Arc<dyn FireLedger> = Arc::new(MemoryFireLedger::new());
        let tick = Shared::holding(Duration::ZERO);
        let nodes = cluster(&ledger, &tick);

        sleep(Duration::from_millis(3500)).await;
        for node in &nodes {
            node.shutdown_and_wait().await;
        }
        // One run per elapsed second, never one per node.
        let total = tick.runs();
        assert!((2..=4).contains(&total), "expected one run per second, got {total}");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn slow_pass_is_never_overlapped_by_another_node() {
        let ledger: Arc<dyn FireLedger> = Arc::new(MemoryFireLedger::new());
        let tick = Shared::holding(Duration::from_millis(1500));
        let nodes = cluster(&ledger, &tick);

        sleep(Duration::from_millis(4500)).await;
        for node in &nodes {
            node.shutdown_and_wait().await;
        }
        assert!(tick.runs() >= 2, "only {} passes ran", tick.runs());
        assert_eq!(tick.peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn disabled_job_waits_for_enable() {
        let node = EmbeddedCoordinator::new("n1", Arc::new(MemoryFireLedger::new())).unwrap();
        let tick = Shared::holding(Duration::ZERO);
        node.register(job(&tick, true)).unwrap();
        assert_eq!(node.is_enabled("shared"), Some(false));

        sleep(Duration::from_millis(1200)).await;
        assert_eq!(tick.runs(), 0);

        node.enable("shared").unwrap();
        sleep(Duration::from_millis(2200)).await;
        assert!(tick.runs() >= 1);
        node.shutdown_and_wait().await;
    }

    #[tokio::test]
    async fn rejects_multi_shard_jobs() {
        let node = EmbeddedCoordinator::new("n1", Arc::new(MemoryFireLedger::new())).unwrap();
        let mut j = job(&Shared::holding(Duration::ZERO), false);
        j.sharding_total_count = 4;
        assert!(matches!(node.register(j), Err(RetryError::Coordination(_))));
    }
}
