mod module;
mod samples;
mod traffic;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use retry_core::cfg::{self, AppId, Config};
use retry_core::engine::RetryEngineBuilder;
use retry_core::logx;
use retry_core::scheduler::{EmbeddedCoordinator, MemoryFireLedger};
use retry_core::BackendKind;
use tokio::sync::watch;
use tokio::time::{sleep, Duration};
use tracing::{info, warn};

use crate::module::{Module, ModuleCtx};
use crate::traffic::Traffic;

const APP: AppId = AppId {
    qualifier: "com",
    organization: "local",
    application: env!("CARGO_PKG_NAME"),
};

#[derive(Parser)]
#[command(name=env!("CARGO_PKG_NAME"), version, about="Durable retry daemon running the sample handlers")]
struct Cli {
    /// Config file; defaults to config.toml in the app config dir.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Exit after this many seconds instead of waiting for Ctrl-C.
    #[arg(long, value_name = "SECS")]
    run_for: Option<u64>,
    /// Do not generate sample calls.
    #[arg(long)]
    no_traffic: bool,
    /// Seconds between sample calls.
    #[arg(long, default_value_t = 2)]
    traffic_period: u64,
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    runtime()?.block_on(run(cli))
}

#[cfg(feature = "rt-single")]
fn runtime() -> std::io::Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_current_thread().enable_all().build()
}

#[cfg(not(feature = "rt-single"))]
fn runtime() -> std::io::Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread().enable_all().build()
}

fn load_config(path: Option<&Path>) -> anyhow::Result<(Config, PathBuf)> {
    match path {
        Some(p) => {
            let base = p.parent().map(Path::to_path_buf).unwrap_or_default();
            Ok((cfg::load_from(p)?, base))
        }
        None => {
            let dir = cfg::config_dir(&APP)?;
            Ok((cfg::load_from(&dir.join("config.toml"))?, dir))
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let (cfg, base) = load_config(cli.config.as_deref())?;
    let level = match cli.verbose { 0 => cfg.log_level.as_str(), 1 => "debug", _ => "trace" };
    logx::init(level, cfg.log_json);
    info!("{} boot", APP.application);
    info!(
        store = ?cfg.store.kind,
        backend = cfg.job.backend.as_str(),
        enabled = cfg.retry.enabled,
        before_task = cfg.retry.before_task,
        "config loaded"
    );

    let mut builder = RetryEngineBuilder::from_config(&cfg, &base).context("open task store")?;
    let coordinator = if cfg.job.backend == BackendKind::Distributed {
        let node = format!("{}-{}", APP.application, std::process::id());
        let coordinator = Arc::new(EmbeddedCoordinator::new(node, Arc::new(MemoryFireLedger::new()))?);
        builder = builder.distributed(coordinator.clone());
        Some(coordinator)
    } else {
        None
    };
    let engine = Arc::new(builder.build()?);
    let samples = samples::register(&engine).context("register sample handlers")?;
    for job in engine.jobs() {
        info!(job = %job.job_name, group = %job.group, period = %job.period, status = ?job.status, "job");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let ctx = ModuleCtx { engine: engine.clone(), shutdown: shutdown_rx };
    let mut modules: Vec<Box<dyn Module>> = Vec::new();
    if !cli.no_traffic {
        modules.push(Box::new(Traffic::new(
            Duration::from_secs(cli.traffic_period.max(1)),
            samples.notifier.clone(),
            samples.billing.clone(),
        )));
    }
    let handles: Vec<_> = modules
        .into_iter()
        .map(|m| {
            let name = m.name();
            info!(module = name, "module started");
            (name, m.spawn(ctx.clone()))
        })
        .collect();

    match cli.run_for {
        Some(secs) => tokio::select! {
            _ = sleep(Duration::from_secs(secs)) => info!(secs, "run time elapsed"),
            r = tokio::signal::ctrl_c() => { r?; info!("ctrl-c received"); }
        },
        None => {
            tokio::signal::ctrl_c().await?;
            info!("ctrl-c received");
        }
    }

    shutdown_tx.send_replace(true);
    for (name, handle) in handles {
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(module = name, error = %e, "module failed"),
            Err(e) => warn!(module = name, error = %e, "module panicked"),
        }
    }
    engine.shutdown().await;
    if let Some(coordinator) = coordinator {
        coordinator.shutdown_and_wait().await;
    }

    for identity in engine.registry().identities() {
        match engine.store().count(&identity) {
            Ok(pending) => info!(identity = %identity, pending, "tasks left"),
            Err(e) => warn!(identity = %identity, error = %e, "could not count tasks"),
        }
    }
    info!("{} stopped", APP.application);
    Ok(())
}
