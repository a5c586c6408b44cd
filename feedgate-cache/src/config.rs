//! Configuration for the content governor
//!
//! Everything that differs between deployments lives here: key prefixes,
//! tier budgets, the priority → TTL table and the provider limit tables.
//! Configuration can be built programmatically, loaded from a JSON file, or
//! assembled from `FEEDGATE_*` environment variables (with `.env` support).

use crate::error::{CacheError, Result};
use crate::freshness::PriorityTtls;
use crate::quota::{Environment, QuotaTables};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

/// Configuration for the cache, quota ledger and orchestration layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GovernorConfig {
    /// Prefix for cache records in the persistent tier
    pub cache_prefix: String,

    /// Prefix for quota counters in the persistent tier
    /// Kept apart from `cache_prefix` so clearing the cache never resets quota
    pub quota_prefix: String,

    /// Byte budget of the fast tier
    pub memory_max_bytes: usize,

    /// Entry budget of the fast tier
    pub memory_max_entries: usize,

    /// Byte budget of the persistent tier (cache records only)
    pub persisted_max_bytes: usize,

    /// Fraction of a budget that eviction brings usage down to (0.0 - 1.0]
    pub target_load_factor: f64,

    /// Read-time TTL per priority
    pub priority_ttls: PriorityTtls,

    /// Random variation applied to write-time TTLs of orchestrated writes (0.0 - 1.0)
    /// Spreads expiry of content fetched together
    pub ttl_jitter: f64,

    /// Which limit table applies
    pub environment: Environment,

    /// Provider limit tables
    pub quota: QuotaTables,

    /// Run periodic cleanup when `start_auto_cleanup` is used
    pub enable_auto_cleanup: bool,

    /// Interval for automatic cleanup
    #[serde(rename = "cleanupIntervalMs", with = "serde_millis")]
    pub cleanup_interval: Duration,

    /// Coalesce concurrent requests for the same key into one fetch
    pub single_flight: bool,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            cache_prefix: "feedgate_cache_".to_string(),
            quota_prefix: "feedgate_quota_".to_string(),
            // 10 MB in-process
            memory_max_bytes: 10 * 1024 * 1024,
            memory_max_entries: 1_000,
            // 4 MB, under the usual 5 MB session-storage quota
            persisted_max_bytes: 4 * 1024 * 1024,
            target_load_factor: 0.8,
            priority_ttls: PriorityTtls::default(),
            ttl_jitter: 0.1,
            environment: Environment::Production,
            quota: QuotaTables::default(),
            enable_auto_cleanup: true,
            // Cleanup every 5 minutes
            cleanup_interval: Duration::from_secs(300),
            single_flight: true,
        }
    }
}

impl GovernorConfig {
    /// Create a new builder for governor configuration
    pub fn builder() -> GovernorConfigBuilder {
        GovernorConfigBuilder::default()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.cache_prefix.is_empty() || self.quota_prefix.is_empty() {
            return Err(CacheError::ConfigError("key prefixes must not be empty".to_string()));
        }

        if self.cache_prefix.starts_with(&self.quota_prefix) || self.quota_prefix.starts_with(&self.cache_prefix) {
            return Err(CacheError::ConfigError(
                "cache_prefix and quota_prefix must not overlap".to_string(),
            ));
        }

        if self.memory_max_entries == 0 {
            return Err(CacheError::ConfigError("memory_max_entries must be greater than 0".to_string()));
        }

        if self.memory_max_bytes == 0 || self.persisted_max_bytes == 0 {
            return Err(CacheError::ConfigError("byte budgets must be greater than 0".to_string()));
        }

        if !(self.target_load_factor > 0.0 && self.target_load_factor <= 1.0) {
            return Err(CacheError::ConfigError("target_load_factor must be in (0.0, 1.0]".to_string()));
        }

        if !(0.0..=1.0).contains(&self.ttl_jitter) {
            return Err(CacheError::ConfigError("ttl_jitter must be between 0.0 and 1.0".to_string()));
        }

        self.priority_ttls.validate()?;
        self.quota.validate()?;

        Ok(())
    }

    /// Apply TTL jitter to a base TTL; never returns less than one millisecond
    pub fn ttl_with_jitter(&self, base: Duration) -> Duration {
        if self.ttl_jitter == 0.0 {
            return base;
        }

        let base_ms = base.as_millis() as f64;
        let jitter_range = base_ms * self.ttl_jitter;
        let jitter = (rand::random::<f64>() * 2.0 - 1.0) * jitter_range;
        let final_ms = (base_ms + jitter).max(1.0);

        Duration::from_millis(final_ms as u64)
    }

    /// Load configuration from a JSON file, falling back to defaults when the
    /// file is absent and for missing fields
    pub fn load(path: &Path) -> Result<Self> {
        let config = if path.exists() {
            let data = std::fs::read_to_string(path)?;
            serde_json::from_str::<GovernorConfig>(&data)
                .map_err(|e| CacheError::ConfigError(format!("{}: {}", path.display(), e)))?
        } else {
            warn!("Config file not found at {:?}, using defaults", path);
            GovernorConfig::default()
        };

        config.validate()?;
        info!(environment = %config.environment, "Loaded governor configuration");
        Ok(config)
    }

    /// Build from defaults overridden by `FEEDGATE_*` variables (reads `.env`)
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();

        let mut config = GovernorConfig {
            environment: Environment::from_env(),
            ..Default::default()
        };

        if let Ok(prefix) = std::env::var("FEEDGATE_CACHE_PREFIX") {
            config.cache_prefix = prefix;
        }
        if let Some(bytes) = env_usize("FEEDGATE_MEMORY_MAX_BYTES")? {
            config.memory_max_bytes = bytes;
        }
        if let Some(bytes) = env_usize("FEEDGATE_PERSISTED_MAX_BYTES")? {
            config.persisted_max_bytes = bytes;
        }

        config.validate()?;
        Ok(config)
    }

    /// Byte count eviction brings a tier down to
    pub fn target_bytes(&self, max_bytes: usize) -> usize {
        (max_bytes as f64 * self.target_load_factor) as usize
    }
}

fn env_usize(name: &str) -> Result<Option<usize>> {
    match std::env::var(name) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| CacheError::ConfigError(format!("{} must be an integer, got '{}'", name, value))),
        Err(_) => Ok(None),
    }
}

/// Builder for governor configuration
#[derive(Debug, Default)]
pub struct GovernorConfigBuilder {
    cache_prefix: Option<String>,
    quota_prefix: Option<String>,
    memory_max_bytes: Option<usize>,
    memory_max_entries: Option<usize>,
    persisted_max_bytes: Option<usize>,
    target_load_factor: Option<f64>,
    priority_ttls: Option<PriorityTtls>,
    ttl_jitter: Option<f64>,
    environment: Option<Environment>,
    quota: Option<QuotaTables>,
    enable_auto_cleanup: Option<bool>,
    cleanup_interval: Option<Duration>,
    single_flight: Option<bool>,
}

impl GovernorConfigBuilder {
    pub fn cache_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.cache_prefix = Some(prefix.into());
        self
    }

    pub fn quota_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.quota_prefix = Some(prefix.into());
        self
    }

    /// Set the fast tier byte budget
    pub fn memory_max_bytes(mut self, bytes: usize) -> Self {
        self.memory_max_bytes = Some(bytes);
        self
    }

    /// Set the fast tier entry budget
    pub fn memory_max_entries(mut self, entries: usize) -> Self {
        self.memory_max_entries = Some(entries);
        self
    }

    /// Set the persistent tier byte budget
    pub fn persisted_max_bytes(mut self, bytes: usize) -> Self {
        self.persisted_max_bytes = Some(bytes);
        self
    }

    pub fn target_load_factor(mut self, factor: f64) -> Self {
        self.target_load_factor = Some(factor);
        self
    }

    pub fn priority_ttls(mut self, ttls: PriorityTtls) -> Self {
        self.priority_ttls = Some(ttls);
        self
    }

    /// Set TTL jitter factor (0.0 - 1.0)
    pub fn ttl_jitter(mut self, jitter: f64) -> Self {
        self.ttl_jitter = Some(jitter);
        self
    }

    pub fn environment(mut self, environment: Environment) -> Self {
        self.environment = Some(environment);
        self
    }

    pub fn quota(mut self, quota: QuotaTables) -> Self {
        self.quota = Some(quota);
        self
    }

    /// Enable or disable automatic cleanup
    pub fn enable_auto_cleanup(mut self, enable: bool) -> Self {
        self.enable_auto_cleanup = Some(enable);
        self
    }

    /// Set cleanup interval
    pub fn cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = Some(interval);
        self
    }

    pub fn single_flight(mut self, enable: bool) -> Self {
        self.single_flight = Some(enable);
        self
    }

    /// Build the configuration
    pub fn build(self) -> GovernorConfig {
        let defaults = GovernorConfig::default();

        GovernorConfig {
            cache_prefix: self.cache_prefix.unwrap_or(defaults.cache_prefix),
            quota_prefix: self.quota_prefix.unwrap_or(defaults.quota_prefix),
            memory_max_bytes: self.memory_max_bytes.unwrap_or(defaults.memory_max_bytes),
            memory_max_entries: self.memory_max_entries.unwrap_or(defaults.memory_max_entries),
            persisted_max_bytes: self.persisted_max_bytes.unwrap_or(defaults.persisted_max_bytes),
            target_load_factor: self.target_load_factor.unwrap_or(defaults.target_load_factor),
            priority_ttls: self.priority_ttls.unwrap_or(defaults.priority_ttls),
            ttl_jitter: self.ttl_jitter.unwrap_or(defaults.ttl_jitter),
            environment: self.environment.unwrap_or(defaults.environment),
            quota: self.quota.unwrap_or(defaults.quota),
            enable_auto_cleanup: self
                .enable_auto_cleanup
                .unwrap_or(defaults.enable_auto_cleanup),
            cleanup_interval: self.cleanup_interval.unwrap_or(defaults.cleanup_interval),
            single_flight: self.single_flight.unwrap_or(defaults.single_flight),
        }
    }
}

/// Preset configurations
impl GovernorConfig {
    /// Staging deployment: staging limits, shorter TTLs for quicker iteration
    pub fn staging() -> Self {
        Self {
            environment: Environment::Staging,
            priority_ttls: PriorityTtls {
                high: Duration::from_secs(30 * 60),
                medium: Duration::from_secs(2 * 3600),
                low: Duration::from_secs(6 * 3600),
            },
            ..Default::default()
        }
    }

    /// Memory-constrained environments
    pub fn small() -> Self {
        Self {
            memory_max_bytes: 1024 * 1024,
            memory_max_entries: 100,
            persisted_max_bytes: 1024 * 1024,
            ..Default::default()
        }
    }
}

/// Serialize a `Duration` as whole milliseconds
pub mod serde_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
