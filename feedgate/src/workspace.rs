use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use feedgate_cache::quota::ENVIRONMENT_VAR;
use feedgate_cache::{ContentGovernor, Environment, FileSessionStore, GovernorConfig, SystemClock};
use tracing::info;

/// Session file holding cache records and quota counters
pub const SESSION_FILE: &str = "session.json";

/// Config file looked up in the data directory when `--config` is not given
pub const CONFIG_FILE: &str = "config.json";

/// A data directory opened for maintenance
pub struct Workspace {
    data_dir: PathBuf,
    governor: Arc<ContentGovernor>,
}

impl Workspace {
    /// Platform data directory, falling back to `./data`
    pub fn default_data_dir() -> PathBuf {
        dirs::data_local_dir()
            .map(|dir| dir.join("feedgate"))
            .unwrap_or_else(|| PathBuf::from("./data"))
    }

    /// Read the config file (defaults when absent); `FEEDGATE_ENV` overrides
    /// the file's environment
    pub fn load_config(data_dir: &Path, config_path: Option<&Path>) -> Result<GovernorConfig> {
        let path = config_path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| data_dir.join(CONFIG_FILE));

        let mut config = GovernorConfig::load(&path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?;

        if std::env::var(ENVIRONMENT_VAR).is_ok() {
            config.environment = Environment::from_env();
        }
        Ok(config)
    }

    pub fn new(data_dir: &Path, config: GovernorConfig) -> Result<Self> {
        std::fs::create_dir_all(data_dir)
            .with_context(|| format!("Failed to create data directory {}", data_dir.display()))?;

        let session_path = data_dir.join(SESSION_FILE);
        let session = FileSessionStore::open(&session_path, session_quota(&config))
            .with_context(|| format!("Failed to open {}", session_path.display()))?;

        let governor = ContentGovernor::new(config, Arc::new(session), Arc::new(SystemClock))?;
        info!(data_dir = %data_dir.display(), "Opened workspace");

        Ok(Self {
            data_dir: data_dir.to_path_buf(),
            governor: Arc::new(governor),
        })
    }

    pub fn open(data_dir: &Path, config_path: Option<&Path>) -> Result<Self> {
        let config = Self::load_config(data_dir, config_path)?;
        Self::new(data_dir, config)
    }

    pub fn governor(&self) -> &Arc<ContentGovernor> {
        &self.governor
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn session_path(&self) -> PathBuf {
        self.data_dir.join(SESSION_FILE)
    }
}

/// The file also holds quota counters, so allow a quarter on top of the
/// cache budget
fn session_quota(config: &GovernorConfig) -> usize {
    config.persisted_max_bytes + config.persisted_max_bytes / 4
}
