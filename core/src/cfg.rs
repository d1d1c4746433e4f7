use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::codec::Codec;
use crate::handler::BackendKind;

/// Identifier used to compute per-app configuration directories.
#[derive(Clone, Copy)]
pub struct AppId {
    /// Reverse-DNS style qualifier, e.g. `"com"`.
    pub qualifier: &'static str,
    /// Organization or vendor name, e.g. `"local"`.
    pub organization: &'static str,
    /// Application name, e.g. `"retryd"`.
    pub application: &'static str,
}

/// Application configuration persisted to `config.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Tracing level to use if `RUST_LOG` is not set (e.g. `"info"`).
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Emit JSON log lines instead of plain text.
    #[serde(default)]
    pub log_json: bool,
    /// Failure-capture settings.
    #[serde(default)]
    pub retry: RetrySection,
    /// Retry job scheduling.
    #[serde(default)]
    pub job: JobSection,
    /// Task store.
    #[serde(default)]
    pub store: StoreSection,
}

/// `[retry]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrySection {
    /// Master switch; `false` registers handlers without capture or jobs.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Persist the task before invoking the handler.
    #[serde(default = "default_true")]
    pub before_task: bool,
    /// Argument codec.
    #[serde(default)]
    pub codec: Codec,
}

/// `[job]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSection {
    /// Global auto-start switch; `false` leaves every job in `PREPARE`.
    #[serde(default = "default_true")]
    pub auto_startup: bool,
    /// Seconds to wait before auto-started jobs fire.
    #[serde(default = "default_startup_delay")]
    pub startup_delay_secs: u64,
    /// Cap on concurrently running ticks; unbounded when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_workers: Option<usize>,
    /// Backend for handlers that do not pick one.
    #[serde(default = "default_backend")]
    pub backend: BackendKind,
}

/// Task store kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreKind {
    /// Files under `path`.
    Fs,
    /// Process memory; tasks are lost on exit.
    Memory,
}

/// `[store]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreSection {
    /// Store kind.
    #[serde(default = "default_store_kind")]
    pub kind: StoreKind,
    /// Store directory; relative paths resolve against the config dir.
    #[serde(default = "default_store_path")]
    pub path: String,
}

fn default_log_level() -> String { "info".to_string() }
const fn default_true() -> bool { true }
const fn default_startup_delay() -> u64 { 30 }
const fn default_backend() -> BackendKind { BackendKind::Local }
const fn default_store_kind() -> StoreKind { StoreKind::Fs }
fn default_store_path() -> String { "tasks".to_string() }

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_json: false,
            retry: RetrySection::default(),
            job: JobSection::default(),
            store: StoreSection::default(),
        }
    }
}

impl Default for RetrySection {
    fn default() -> Self {
        Self { enabled: true, before_task: true, codec: Codec::default() }
    }
}

impl Default for JobSection {
    fn default() -> Self {
        Self {
            auto_startup: true,
            startup_delay_secs: default_startup_delay(),
            max_workers: None,
            backend: default_backend(),
        }
    }
}

impl Default for StoreSection {
    fn default() -> Self {
        Self { kind: default_store_kind(), path: default_store_path() }
    }
}

impl JobSection {
    /// Startup delay as a `Duration`.
    pub fn startup_delay(&self) -> Duration {
        Duration::from_secs(self.startup_delay_secs)
    }

    /// Tick concurrency cap, if one is configured.
    pub fn workers(&self) -> Option<usize> {
        self.max_workers.map(|n| n.max(1))
    }
}

impl StoreSection {
    /// Store directory resolved against `base`.
    pub fn resolve(&self, base: &Path) -> PathBuf {
        let p = Path::new(&self.path);
        if p.is_absolute() { p.to_path_buf() } else { base.join(p) }
    }
}

/// Return the configuration directory for this app, creating it if needed.
pub fn config_dir(app: &AppId) -> Result<PathBuf> {
    let pd = ProjectDirs::from(app.qualifier, app.organization, app.application)
        .ok_or_else(|| anyhow::anyhow!("failed to resolve ProjectDirs"))?;
    let dir = pd.config_dir().to_path_buf();
    fs::create_dir_all(&dir).with_context(|| format!("create config dir {}", dir.display()))?;
    Ok(dir)
}

/// Load `config.toml` from the app config dir or create a default one.
pub fn load_or_init(app: &AppId) -> Result<Config> {
    load_from(&config_dir(app)?.join("config.toml"))
}

/// Load `path`, writing the defaults there first if it does not exist.
pub fn load_from(path: &Path) -> Result<Config> {
    if path.exists() {
        let txt = fs::read_to_string(path)
            .with_context(|| format!("read {}", path.display()))?;
        let cfg: Config = toml::from_str(&txt)
            .with_context(|| format!("parse {}", path.display()))?;
        Ok(cfg)
    } else {
        let cfg = Config::default();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| format!("create config dir {}", parent.display()))?;
        }
        save_config(path, &cfg)?;
        Ok(cfg)
    }
}

fn save_config(path: &Path, cfg: &Config) -> Result<()> {
    let s = toml::to_string_pretty(cfg)?;
    fs::write(path, s).with_context(|| format!("write {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_defaults_then_reads_them_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let first = load_from(&path).unwrap();
        assert!(path.exists());
        assert_eq!(first.log_level, "info");
        assert!(first.retry.enabled);
        assert!(first.retry.before_task);
        assert_eq!(first.job.startup_delay_secs, 30);
        assert_eq!(first.job.workers(), None);
        assert_eq!(load_from(&path).unwrap(), first);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            "log_level = \"debug\"\n[retry]\nbefore_task = false\ncodec = \"bincode\"\n[job]\nbackend = \"distributed\"\n",
        )
        .unwrap();

        let cfg = load_from(&path).unwrap();
        assert!(!cfg.retry.before_task);
        assert_eq!(cfg.retry.codec, Codec::Bincode);
        assert_eq!(cfg.job.backend, BackendKind::Distributed);
        assert!(cfg.job.auto_startup);
        assert_eq!(cfg.store.kind, StoreKind::Fs);
        assert_eq!(cfg.store.resolve(dir.path()), dir.path().join("tasks"));
    }

    #[test]
    fn retries_can_be_switched_off() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[retry]\nenabled = false\n[job]\nmax_workers = 0\n").unwrap();

        let cfg = load_from(&path).unwrap();
        assert!(!cfg.retry.enabled);
        assert!(cfg.retry.before_task);
        assert_eq!(cfg.job.workers(), Some(1));
    }
}
