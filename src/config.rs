//! Configuration for sensord.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (SENSORD_HOME, SENSORD_WORKSPACE)
//! 2. Config file (.sensord/config.yaml)
//! 3. Defaults (~/.sensord)
//!
//! Config file discovery:
//! - Searches current directory and parents for .sensord/config.yaml
//! - Paths in config file are relative to the config file's directory

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::domain::TickStatus;

/// Global cached configuration (stores Result to handle init errors)
static CONFIG: OnceLock<Result<ResolvedConfig, String>> = OnceLock::new();

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigFile {
    pub version: String,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub daemon: Option<DaemonConfig>,
    /// Days to keep ticks of each status; zero or negative keeps forever
    #[serde(default)]
    pub tick_retention: BTreeMap<TickStatus, i64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// Daemon state directory (relative to .sensord/)
    pub home: Option<String>,
    /// Directory of workspace location files (relative to .sensord/)
    pub workspace: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DaemonConfig {
    pub use_threads: Option<bool>,
    pub num_workers: Option<usize>,
    pub num_submit_workers: Option<usize>,
    pub loop_interval_seconds: Option<u64>,
    pub evaluation_timeout_seconds: Option<u64>,
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// Absolute path to sensord home (storage)
    pub home: PathBuf,
    /// Directory containing one YAML file per workspace location
    pub workspace: PathBuf,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
    pub daemon: DaemonSettings,
    pub retention: TickRetention,
}

/// Knobs for the daemon loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonSettings {
    /// Evaluate instigators on a worker pool instead of inline
    pub use_threads: bool,
    /// Size of the evaluation worker pool
    pub num_workers: usize,
    /// Size of the run submission pool (0 submits inline)
    pub num_submit_workers: usize,
    pub loop_interval_seconds: u64,
    pub evaluation_timeout_seconds: u64,
}

impl Default for DaemonSettings {
    fn default() -> Self {
        Self {
            use_threads: false,
            num_workers: 4,
            num_submit_workers: 0,
            loop_interval_seconds: 5,
            evaluation_timeout_seconds: 60,
        }
    }
}

impl DaemonSettings {
    pub fn loop_interval(&self) -> Duration {
        Duration::from_secs(self.loop_interval_seconds)
    }

    pub fn evaluation_timeout(&self) -> Duration {
        Duration::from_secs(self.evaluation_timeout_seconds)
    }

    fn merge(mut self, config: &DaemonConfig) -> Self {
        if let Some(v) = config.use_threads {
            self.use_threads = v;
        }
        if let Some(v) = config.num_workers {
            self.num_workers = v.max(1);
        }
        if let Some(v) = config.num_submit_workers {
            self.num_submit_workers = v;
        }
        if let Some(v) = config.loop_interval_seconds {
            self.loop_interval_seconds = v;
        }
        if let Some(v) = config.evaluation_timeout_seconds {
            self.evaluation_timeout_seconds = v;
        }
        self
    }
}

/// Per-status tick retention in days
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TickRetention {
    days: BTreeMap<TickStatus, i64>,
}

impl Default for TickRetention {
    fn default() -> Self {
        let days = [
            (TickStatus::Started, -1),
            (TickStatus::Skipped, 7),
            (TickStatus::Success, -1),
            (TickStatus::Failure, -1),
        ]
        .into_iter()
        .collect();
        Self { days }
    }
}

impl TickRetention {
    /// Retention with per-status overrides applied on top of the defaults
    pub fn with_overrides(overrides: &BTreeMap<TickStatus, i64>) -> Self {
        let mut retention = Self::default();
        retention
            .days
            .extend(overrides.iter().map(|(status, days)| (*status, *days)));
        retention
    }

    /// Keep everything
    pub fn keep_all() -> Self {
        Self {
            days: BTreeMap::new(),
        }
    }

    pub fn with_days(mut self, status: TickStatus, days: i64) -> Self {
        self.days.insert(status, days);
        self
    }

    /// Day offset for a status, if ticks of that status ever expire
    pub fn day_offset(&self, status: TickStatus) -> Option<i64> {
        self.days.get(&status).copied().filter(|days| *days > 0)
    }

    /// Statuses that expire, grouped by their day offset
    pub fn statuses_by_offset(&self) -> BTreeMap<i64, Vec<TickStatus>> {
        let mut grouped: BTreeMap<i64, Vec<TickStatus>> = BTreeMap::new();
        for (status, days) in &self.days {
            if *days > 0 {
                grouped.entry(*days).or_default().push(*status);
            }
        }
        grouped
    }
}

/// Find config file by searching current directory and parents
fn find_config_file() -> Option<PathBuf> {
    let mut current = std::env::current_dir().ok()?;

    loop {
        let config_path = current.join(".sensord").join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to the config file's directory
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
            .canonicalize()
            .unwrap_or_else(|_| base.join(path_str))
    }
}

/// Load configuration from all sources
fn load_config() -> Result<ResolvedConfig> {
    let default_home = dirs::home_dir()
        .context("Failed to determine home directory")?
        .join(".sensord");

    let config_file = find_config_file();
    let parsed = match config_file {
        Some(ref path) => Some(load_config_file(path)?),
        None => None,
    };
    let sensord_dir = config_file
        .as_deref()
        .and_then(Path::parent)
        .unwrap_or(Path::new("."));

    let home = match std::env::var("SENSORD_HOME") {
        Ok(env_home) => PathBuf::from(env_home),
        Err(_) => parsed
            .as_ref()
            .and_then(|c| c.paths.home.as_deref())
            .map(|p| resolve_path(sensord_dir, p))
            .unwrap_or(default_home),
    };

    let workspace = match std::env::var("SENSORD_WORKSPACE") {
        Ok(env_workspace) => PathBuf::from(env_workspace),
        Err(_) => parsed
            .as_ref()
            .and_then(|c| c.paths.workspace.as_deref())
            .map(|p| resolve_path(sensord_dir, p))
            .unwrap_or_else(|| home.join("workspace")),
    };

    let daemon = match parsed.as_ref().and_then(|c| c.daemon.as_ref()) {
        Some(daemon) => DaemonSettings::default().merge(daemon),
        None => DaemonSettings::default(),
    };

    let retention = parsed
        .as_ref()
        .map(|c| TickRetention::with_overrides(&c.tick_retention))
        .unwrap_or_default();

    Ok(ResolvedConfig {
        home,
        workspace,
        config_file,
        daemon,
        retention,
    })
}

/// Get the global configuration (loads once, then cached)
pub fn config() -> Result<&'static ResolvedConfig> {
    let result = CONFIG.get_or_init(|| load_config().map_err(|e| e.to_string()));

    match result {
        Ok(config) => Ok(config),
        Err(e) => anyhow::bail!("{}", e),
    }
}

/// Get the sensord home directory
pub fn sensord_home() -> Result<PathBuf> {
    Ok(config()?.home.clone())
}

/// Get the storage directory ($SENSORD_HOME/storage)
pub fn storage_dir() -> Result<PathBuf> {
    Ok(config()?.home.join("storage"))
}

/// Get the workspace directory
pub fn workspace_dir() -> Result<PathBuf> {
    Ok(config()?.workspace.clone())
}
