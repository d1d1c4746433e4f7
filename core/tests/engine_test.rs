use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use retry_core::engine::RetryEngine;
use retry_core::processor::TickOutcome;
use retry_core::scheduler::LocalSchedulerConfig;
use retry_core::store::open_fs;
use retry_core::task::{KvTaskStore, MemoryTaskStore};
use retry_core::{JobStatus, RetryAttrs, RetryHandler, TaskStore};

/// Refuses each argument the first time it sees it.
#[derive(Default)]
struct Flaky {
    seen: Mutex<HashSet<u32>>,
    calls: AtomicUsize,
}

impl RetryHandler for Flaky {
    type Arg = u32;
    type Output = u32;

    fn identity(&self) -> &str {
        "flaky"
    }
    fn interval_secs(&self) -> Option<u64> {
        Some(1)
    }
    fn handle(&self, arg: &u32) -> anyhow::Result<u32> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        anyhow::ensure!(!self.seen.lock().unwrap().insert(*arg), "first attempt for {arg}");
        Ok(arg * 2)
    }
}

fn quick() -> LocalSchedulerConfig {
    LocalSchedulerConfig { startup_delay: Duration::ZERO, max_workers: Some(2) }
}

async fn eventually(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..80 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    cond()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_call_is_replayed_until_it_succeeds() {
    let store = Arc::new(MemoryTaskStore::new());
    let engine = RetryEngine::builder().store(store.clone()).local(quick()).build().unwrap();
    let flaky = engine.register(Flaky::default()).unwrap();
    // Let the immediate first fire pass over an empty store.
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert!(flaky.invoke(&21).is_err());
    assert_eq!(store.count("flaky").unwrap(), 1);

    assert!(eventually(|| store.count("flaky").unwrap() == 0).await);
    assert_eq!(flaky.inner().calls.load(Ordering::SeqCst), 2);

    // Success leaves nothing behind.
    assert_eq!(flaky.invoke(&21).unwrap(), 42);
    assert_eq!(store.count("flaky").unwrap(), 0);
    engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn manual_trigger_on_prepared_job() {
    let store = Arc::new(MemoryTaskStore::new());
    let engine = RetryEngine::builder()
        .store(store.clone())
        .local(quick())
        .auto_startup(false)
        .persist_before(false)
        .build()
        .unwrap();
    let flaky = engine.register(Flaky::default()).unwrap();
    let local = engine.local().unwrap();
    assert_eq!(local.status("flaky"), Some(JobStatus::Prepare));

    assert!(flaky.invoke(&1).is_err());
    assert!(flaky.invoke(&2).is_err());
    assert_eq!(store.count("flaky").unwrap(), 2);

    match local.trigger("flaky").await.unwrap() {
        TickOutcome::Completed(report) => {
            assert_eq!(report.succeeded, 2);
            assert_eq!(report.failed, 0);
        }
        other => panic!("unexpected outcome {other:?}"),
    }
    assert_eq!(store.count("flaky").unwrap(), 0);
    engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn tasks_survive_a_restart() {
    let dir = tempfile::tempdir().unwrap();

    {
        let store = Arc::new(KvTaskStore::new(open_fs(dir.path()).unwrap()));
        let engine = RetryEngine::builder()
            .store(store.clone())
            .local(quick())
            .auto_startup(false)
            .build()
            .unwrap();
        let flaky = engine.register(Flaky::default()).unwrap();
        assert!(flaky.invoke(&5).is_err());
        engine.shutdown().await;
    }

    let store = Arc::new(KvTaskStore::new(open_fs(dir.path()).unwrap()));
    assert_eq!(store.count("flaky").unwrap(), 1);

    // A fresh process has a fresh handler: the first replay fails, the second succeeds.
    let engine = RetryEngine::builder().store(store.clone()).local(quick()).build().unwrap();
    let flaky = engine.register(Flaky::default()).unwrap();
    assert!(eventually(|| store.count("flaky").unwrap() == 0).await);

    assert_eq!(flaky.inner().calls.load(Ordering::SeqCst), 2);
    engine.shutdown().await;
}

struct Mailer;

impl Mailer {
    fn send(&self, to: &String) -> anyhow::Result<usize> {
        anyhow::ensure!(to.contains('@'), "bad address {to}");
        Ok(to.len())
    }
}

#[tokio::test]
async fn interceptors_route_to_the_registered_wrappers() {
    let store = Arc::new(MemoryTaskStore::new());
    let engine = RetryEngine::builder()
        .store(store.clone())
        .local(LocalSchedulerConfig { startup_delay: Duration::from_secs(60), max_workers: Some(1) })
        .build()
        .unwrap();
    engine
        .register_function(Arc::new(Mailer), RetryAttrs::new(" mail.send ").cron("0 0 * * *"), Mailer::send)
        .unwrap();

    let functions = engine.function_interceptor();
    let ok = functions.intercept::<Mailer, String, usize>("mail.send", &"a@b".to_string());
    assert_eq!(ok.unwrap().unwrap(), 3);
    let failed = functions.intercept::<Mailer, String, usize>("mail.send", &"nobody".to_string());
    assert!(failed.unwrap().is_err());
    assert_eq!(store.count("mail.send").unwrap(), 1);

    // Not registered: the caller falls back to a direct call.
    let classes = engine.class_interceptor();
    assert!(classes.intercept(&Flaky::default(), &1).is_none());
    engine.shutdown().await;
}
