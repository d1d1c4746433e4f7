//! Registration: validate, wrap, schedule, publish.
//!
//! A handler goes through [`RetryEngine::register`] once at startup. The
//! engine checks its descriptor, refuses a second handler with the same
//! identity, wraps it in [`FailureCapture`], binds a [`RetryProcessor`] to a
//! scheduler backend and finally publishes the wrapper in the dispatch
//! registry. A failure at any step leaves no job and no dispatch entry.
//!
//! With retries switched off ([`RetryEngineBuilder::enabled`]) registration
//! only validates the handler and hands back a wrapper that records nothing.

use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{info, warn};

use crate::cfg::{Config, StoreKind};
use crate::capture::FailureCapture;
use crate::codec::Codec;
use crate::error::{Result, RetryError};
use crate::handler::{BackendKind, HandlerDescriptor, MethodHandler, RetryAttrs, RetryHandler};
use crate::intercept::{HandlerClassInterceptor, RetryFunctionInterceptor};
use crate::job::JobInfo;
use crate::processor::RetryProcessor;
use crate::registry::DispatchRegistry;
use crate::scheduler::{Coordinator, DistributedScheduler, LocalScheduler, LocalSchedulerConfig, SchedulerBackend};
use crate::store::open_fs;
use crate::task::{KvTaskStore, MemoryTaskStore, TaskStore};

/// Builder for [`RetryEngine`].
pub struct RetryEngineBuilder {
    enabled: bool,
    store: Option<Arc<dyn TaskStore>>,
    codec: Codec,
    persist_before: bool,
    auto_startup: bool,
    default_backend: BackendKind,
    local: Option<LocalSchedulerConfig>,
    coordinator: Option<Arc<dyn Coordinator>>,
    registry: Option<DispatchRegistry>,
}

impl Default for RetryEngineBuilder {
    fn default() -> Self {
        Self {
            enabled: true,
            store: None,
            codec: Codec::default(),
            persist_before: true,
            auto_startup: true,
            default_backend: BackendKind::Local,
            local: None,
            coordinator: None,
            registry: None,
        }
    }
}

impl RetryEngineBuilder {
    /// Builder preloaded from `cfg`; a filesystem store path resolves
    /// against `base_dir`.
    pub fn from_config(cfg: &Config, base_dir: &Path) -> Result<Self> {
        let store: Arc<dyn TaskStore> = match cfg.store.kind {
            StoreKind::Fs => Arc::new(KvTaskStore::new(open_fs(cfg.store.resolve(base_dir))?)),
            StoreKind::Memory => Arc::new(MemoryTaskStore::new()),
        };
        // The local backend is always available so interval handlers can pin
        // it even when the default backend is distributed.
        Ok(Self::default()
            .enabled(cfg.retry.enabled)
            .store(store)
            .codec(cfg.retry.codec)
            .persist_before(cfg.retry.before_task)
            .auto_startup(cfg.job.auto_startup)
            .default_backend(cfg.job.backend)
            .local(LocalSchedulerConfig {
                startup_delay: cfg.job.startup_delay(),
                max_workers: cfg.job.workers(),
            }))
    }

    /// Master switch. When off, handlers are validated but get no retry job,
    /// no dispatch entry, and their failures are not recorded.
    pub fn enabled(mut self, on: bool) -> Self {
        self.enabled = on;
        self
    }

    /// Durable task store (defaults to an in-memory store).
    pub fn store(mut self, store: Arc<dyn TaskStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Argument codec.
    pub fn codec(mut self, codec: Codec) -> Self {
        self.codec = codec;
        self
    }

    /// Persist tasks before (`true`, default) or after a failed invocation.
    pub fn persist_before(mut self, before: bool) -> Self {
        self.persist_before = before;
        self
    }

    /// Global auto-start switch, combined with each handler's own flag.
    pub fn auto_startup(mut self, on: bool) -> Self {
        self.auto_startup = on;
        self
    }

    /// Backend for handlers that do not pin one.
    pub fn default_backend(mut self, kind: BackendKind) -> Self {
        self.default_backend = kind;
        self
    }

    /// Enable the local backend.
    pub fn local(mut self, config: LocalSchedulerConfig) -> Self {
        self.local = Some(config);
        self
    }

    /// Enable the distributed backend over `coordinator`.
    pub fn distributed(mut self, coordinator: Arc<dyn Coordinator>) -> Self {
        self.coordinator = Some(coordinator);
        self
    }

    /// Share an existing dispatch registry.
    pub fn registry(mut self, registry: DispatchRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Build the engine. Must run inside a Tokio runtime when the local
    /// backend is used.
    pub fn build(self) -> Result<RetryEngine> {
        let local_config = match (self.local, self.default_backend, &self.coordinator) {
            (Some(c), _, _) => Some(c),
            // Nothing configured at all: fall back to a default local backend.
            (None, BackendKind::Local, None) => Some(LocalSchedulerConfig::default()),
            (None, _, _) => None,
        };
        let local = local_config.map(LocalScheduler::new).transpose()?.map(Arc::new);
        let distributed = self.coordinator.map(|c| Arc::new(DistributedScheduler::new(c)));

        let store = self.store.unwrap_or_else(|| {
            warn!("no task store configured, failed invocations are kept in memory only");
            Arc::new(MemoryTaskStore::new())
        });

        if !self.enabled {
            info!("retries disabled, handlers will be called without capture");
        }
        Ok(RetryEngine {
            enabled: self.enabled,
            store,
            codec: self.codec,
            persist_before: self.persist_before,
            auto_startup: self.auto_startup,
            default_backend: self.default_backend,
            local,
            distributed,
            registry: self.registry.unwrap_or_default(),
            identities: Mutex::new(HashSet::new()),
        })
    }
}

/// Owns the registration pipeline and the scheduling backends.
pub struct RetryEngine {
    enabled: bool,
    store: Arc<dyn TaskStore>,
    codec: Codec,
    persist_before: bool,
    auto_startup: bool,
    default_backend: BackendKind,
    local: Option<Arc<LocalScheduler>>,
    distributed: Option<Arc<DistributedScheduler>>,
    registry: DispatchRegistry,
    identities: Mutex<HashSet<String>>,
}

impl RetryEngine {
    /// Start building an engine.
    pub fn builder() -> RetryEngineBuilder {
        RetryEngineBuilder::default()
    }

    /// Register a handler. Returns the retry-capable wrapper callers should
    /// invoke.
    pub fn register<H: RetryHandler>(&self, handler: H) -> Result<Arc<FailureCapture<H>>> {
        self.register_shared(Arc::new(handler))
    }

    /// Register a handler that is also used elsewhere.
    pub fn register_shared<H: RetryHandler>(&self, handler: Arc<H>) -> Result<Arc<FailureCapture<H>>> {
        let descriptor = HandlerDescriptor::of(&*handler)?;
        if !self.enabled {
            info!(identity = %descriptor.identity, "retries disabled, handler not scheduled");
            return Ok(Arc::new(FailureCapture::passthrough(handler, self.store.clone(), self.codec)));
        }
        let backend = self.backend_for(&descriptor)?;
        backend.check(&descriptor)?;

        self.reserve(&descriptor.identity)?;

        let wrapped = Arc::new(FailureCapture::wrap(
            handler.clone(),
            self.store.clone(),
            self.codec,
            self.persist_before,
        ));
        let processor = Arc::new(
            RetryProcessor::new(handler, self.store.clone(), self.codec).with_in_flight(wrapped.in_flight()),
        );
        let auto_start = descriptor.auto_start && self.auto_startup;

        let job = match backend.register(&descriptor, processor, auto_start) {
            Ok(job) => job,
            Err(e) => {
                self.release(&descriptor.identity);
                return Err(e);
            }
        };
        self.registry.register(&descriptor.identity, wrapped.clone());

        info!(
            identity = %descriptor.identity,
            name = %descriptor.name,
            backend = backend.kind().as_str(),
            job = %job.job_name,
            "retry handler registered"
        );
        Ok(wrapped)
    }

    /// Register a method of `receiver` as a retry function.
    pub fn register_function<T, A, R>(
        &self,
        receiver: Arc<T>,
        attrs: RetryAttrs,
        method: fn(&T, &A) -> anyhow::Result<R>,
    ) -> Result<Arc<FailureCapture<MethodHandler<T, A, R>>>>
    where
        T: Send + Sync + 'static,
        A: serde::Serialize + serde::de::DeserializeOwned + Send + Sync + 'static,
        R: Send + 'static,
    {
        self.register(MethodHandler::new(receiver, attrs, method))
    }

    fn backend_for(&self, descriptor: &HandlerDescriptor) -> Result<SchedulerBackend> {
        let kind = descriptor.backend.unwrap_or(self.default_backend);
        let unavailable = || RetryError::BackendUnavailable { identity: descriptor.identity.clone(), backend: kind.as_str() };
        match kind {
            BackendKind::Local => self.local.clone().map(SchedulerBackend::Local).ok_or_else(unavailable),
            BackendKind::Distributed => self.distributed.clone().map(SchedulerBackend::Distributed).ok_or_else(unavailable),
        }
    }

    fn reserve(&self, identity: &str) -> Result<()> {
        let mut ids = self.identities.lock().unwrap_or_else(PoisonError::into_inner);
        if !ids.insert(identity.to_string()) {
            return Err(RetryError::DuplicateIdentity(identity.to_string()));
        }
        Ok(())
    }

    fn release(&self, identity: &str) {
        self.identities.lock().unwrap_or_else(PoisonError::into_inner).remove(identity);
    }

    /// Whether registrations capture and schedule retries.
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Dispatch registry shared with the interceptors.
    pub fn registry(&self) -> &DispatchRegistry {
        &self.registry
    }

    /// Interceptor for handler types.
    pub fn class_interceptor(&self) -> HandlerClassInterceptor {
        HandlerClassInterceptor::new(self.registry.clone())
    }

    /// Interceptor for retry functions.
    pub fn function_interceptor(&self) -> RetryFunctionInterceptor {
        RetryFunctionInterceptor::new(self.registry.clone())
    }

    /// Task store in use.
    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    /// Local backend, for job control.
    pub fn local(&self) -> Option<&Arc<LocalScheduler>> {
        self.local.as_ref()
    }

    /// Distributed backend.
    pub fn distributed(&self) -> Option<&Arc<DistributedScheduler>> {
        self.distributed.as_ref()
    }

    /// Jobs held by the local backend.
    pub fn jobs(&self) -> Vec<JobInfo> {
        self.local.as_ref().map(|l| l.jobs()).unwrap_or_default()
    }

    /// Stop all backends; local in-flight ticks are awaited.
    pub async fn shutdown(&self) {
        if let Some(local) = &self.local {
            local.shutdown().await;
        }
        if let Some(distributed) = &self.distributed {
            distributed.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::tests::Picky;
    use crate::job::JobStatus;
    use crate::scheduler::{EmbeddedCoordinator, MemoryFireLedger};
    use std::time::Duration;

    fn engine() -> RetryEngine {
        RetryEngine::builder()
            .local(LocalSchedulerConfig { startup_delay: Duration::from_secs(60), max_workers: Some(1) })
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn second_identity_is_rejected_without_side_effects() {
        let engine = engine();
        let first = engine.register(Picky::new()).unwrap();

        let err = engine.register(Picky::new()).unwrap_err();
        assert!(matches!(err, RetryError::DuplicateIdentity(ref id) if id == "picky"));
        assert!(err.is_configuration());

        assert_eq!(engine.jobs().len(), 1);
        let live = engine.registry().lookup::<FailureCapture<Picky>>("picky").unwrap();
        assert!(Arc::ptr_eq(&live, &first));
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn invalid_handler_leaves_nothing_behind() {
        let engine = engine();
        let receiver = Arc::new(());
        let noop: fn(&(), &u8) -> anyhow::Result<()> = |_, _| Ok(());

        let err = engine
            .register_function(receiver.clone(), RetryAttrs::new("x".repeat(51)).interval_secs(1), noop)
            .unwrap_err();
        assert!(matches!(err, RetryError::IdentityTooLong { len: 51, .. }));

        let err = engine
            .register_function(receiver.clone(), RetryAttrs::new("both").interval_secs(1).cron("* * * * *"), noop)
            .unwrap_err();
        assert!(matches!(err, RetryError::InvalidSchedule { .. }));

        assert!(engine.jobs().is_empty());
        assert!(engine.registry().identities().is_empty());

        // A rejected identity stays free.
        engine
            .register_function(receiver, RetryAttrs::new("both").interval_secs(1), noop)
            .unwrap();
        assert_eq!(engine.registry().identities(), vec!["both".to_string()]);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn distributed_handler_needs_a_coordinator() {
        let engine = engine();
        let err = engine
            .register_function(
                Arc::new(()),
                RetryAttrs::new("refunds").cron("0 * * * * *").backend(BackendKind::Distributed),
                |_: &(), _: &u8| Ok(()),
            )
            .unwrap_err();
        assert!(matches!(err, RetryError::BackendUnavailable { backend: "distributed", .. }));
        assert!(!engine.registry().contains("refunds"));
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn auto_start_needs_both_switches() {
        let engine = RetryEngine::builder()
            .local(LocalSchedulerConfig { startup_delay: Duration::from_secs(60), max_workers: Some(1) })
            .auto_startup(false)
            .build()
            .unwrap();
        engine.register(Picky::new()).unwrap();
        assert_eq!(engine.jobs()[0].status, JobStatus::Prepare);
        assert_eq!(engine.jobs()[0].job_name, "JOB.1.picky");
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn disabled_engine_only_validates() {
        let store = Arc::new(crate::task::MemoryTaskStore::new());
        let engine = RetryEngine::builder()
            .enabled(false)
            .store(store.clone())
            .local(LocalSchedulerConfig { startup_delay: Duration::ZERO, max_workers: None })
            .build()
            .unwrap();
        assert!(!engine.is_enabled());

        let picky = engine.register(Picky::new()).unwrap();
        assert!(!picky.is_capturing());
        assert!(picky.invoke(&"bad".to_string()).is_err());
        assert_eq!(store.count("picky").unwrap(), 0);

        assert!(engine.jobs().is_empty());
        assert!(engine.registry().identities().is_empty());
        assert!(engine.class_interceptor().intercept(&Picky::new(), &"x".to_string()).is_none());

        // Bad metadata is still refused.
        let err = engine
            .register_function(Arc::new(()), RetryAttrs::new("x".repeat(51)).interval_secs(1), |_: &(), _: &u8| Ok(()))
            .unwrap_err();
        assert!(matches!(err, RetryError::IdentityTooLong { .. }));
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn config_switch_turns_retries_off() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = Config::default();
        cfg.retry.enabled = false;
        cfg.store.kind = StoreKind::Memory;
        let engine = RetryEngineBuilder::from_config(&cfg, dir.path()).unwrap().build().unwrap();
        assert!(!engine.is_enabled());
        engine.register(Picky::new()).unwrap();
        assert!(engine.jobs().is_empty());
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn backends_are_chosen_per_handler() {
        let coordinator = Arc::new(EmbeddedCoordinator::new("n1", Arc::new(MemoryFireLedger::new())).unwrap());
        let engine = RetryEngine::builder()
            .local(LocalSchedulerConfig { startup_delay: Duration::from_secs(60), max_workers: Some(1) })
            .distributed(coordinator.clone())
            .build()
            .unwrap();

        engine.register(Picky::new()).unwrap();
        engine
            .register_function(
                Arc::new(()),
                RetryAttrs::new("refunds").cron("0 0 * * * *").backend(BackendKind::Distributed),
                |_: &(), _: &u8| Ok(()),
            )
            .unwrap();

        assert_eq!(engine.jobs().len(), 1);
        assert_eq!(coordinator.is_enabled("refunds"), Some(true));
        assert_eq!(engine.registry().identities(), vec!["picky".to_string(), "refunds".to_string()]);

        engine.shutdown().await;
        coordinator.shutdown_and_wait().await;
    }
}
