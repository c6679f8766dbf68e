use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::backend::{BackendKind, SimulatorOptions};
use crate::channel::DEFAULT_CAPACITY;
use crate::profile::MiningProfile;
use crate::session::{RestartPolicy, SessionOptions};

pub const ENV_WALLET: &str = "MINING_WALLET_ADDRESS";
pub const ENV_POOL: &str = "MINING_POOL_URL";
pub const ENV_WORKER: &str = "MINING_WORKER_NAME";
pub const ENV_INSTALL_ROOT: &str = "MINING_INSTALL_ROOT";

/// Application configuration, stored as TOML
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Backend used when none is given on the command line
    pub backend: BackendKind,

    /// Directory holding one sub-directory per backend
    pub install_root: PathBuf,

    pub profile: MiningProfile,

    pub session: SessionSettings,

    pub simulator: SimulatorOptions,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    /// Upper bound for download + extraction, in seconds
    pub provision_timeout_secs: u64,

    /// Time a worker gets to exit after SIGTERM, in seconds
    pub stop_grace_secs: u64,

    /// Crash restarts per session (0 = never restart)
    pub max_restarts: u32,

    /// First restart delay in seconds, doubled on each further attempt
    pub restart_backoff_secs: u64,

    pub poll_interval_ms: u64,

    pub channel_capacity: usize,

    /// Empty the session log at session start
    pub truncate_log: bool,

    /// Override for `<install>/session.log`
    pub log_file: Option<PathBuf>,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            provision_timeout_secs: 300,
            stop_grace_secs: 10,
            max_restarts: 0,
            restart_backoff_secs: 2,
            poll_interval_ms: 250,
            channel_capacity: DEFAULT_CAPACITY,
            truncate_log: false,
            log_file: None,
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Xmrig,
            install_root: Self::default_install_root(),
            profile: MiningProfile::default(),
            session: SessionSettings::default(),
            simulator: SimulatorOptions::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from `path` (or the default location), creating it
    /// with defaults when missing, then apply environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config_path = match path {
            Some(path) => path.to_path_buf(),
            None => Self::config_path()?,
        };

        let mut config = if config_path.exists() {
            let contents = fs::read_to_string(&config_path)
                .with_context(|| format!("Failed to read {}", config_path.display()))?;
            toml::from_str(&contents)
                .with_context(|| format!("Failed to parse {}", config_path.display()))?
        } else {
            let config = AppConfig::default();
            config.save_to(&config_path)?;
            config
        };

        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Save configuration to `path`
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).context("Failed to create config directory")?;
        }
        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(path, contents).context("Failed to write config file")?;
        Ok(())
    }

    /// Get the configuration file path
    pub fn config_path() -> Result<PathBuf> {
        let dir = dirs::config_dir().context("Failed to get config directory")?;
        Ok(dir.join("mining-session").join("config.toml"))
    }

    pub fn default_install_root() -> PathBuf {
        dirs::data_local_dir()
            .map(|dir| dir.join("mining-session").join("miners"))
            .unwrap_or_else(|| PathBuf::from("miners"))
    }

    /// Overlay non-empty environment values onto the loaded file
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let value = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(wallet) = value(ENV_WALLET) {
            self.profile.wallet = wallet;
        }
        if let Some(pool) = value(ENV_POOL) {
            self.profile.pool = pool;
        }
        if let Some(worker) = value(ENV_WORKER) {
            self.profile.worker = worker;
        }
        if let Some(root) = value(ENV_INSTALL_ROOT) {
            self.install_root = PathBuf::from(root);
        }
    }

    pub fn session_options(&self) -> SessionOptions {
        let settings = &self.session;
        SessionOptions {
            install_root: self.install_root.clone(),
            provision_timeout: Duration::from_secs(settings.provision_timeout_secs),
            grace_period: Duration::from_secs(settings.stop_grace_secs),
            restart: RestartPolicy {
                max_restarts: settings.max_restarts,
                initial_backoff: Duration::from_secs(settings.restart_backoff_secs),
            },
            poll_interval: Duration::from_millis(settings.poll_interval_ms.max(10)),
            channel_capacity: settings.channel_capacity.max(1),
            log_file: settings.log_file.clone(),
            truncate_log: settings.truncate_log,
            simulator: self.simulator.clone(),
        }
    }
}
