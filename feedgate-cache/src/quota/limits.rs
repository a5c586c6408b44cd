//! Per-provider call limits, selected by deployment environment

use crate::error::{CacheError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use tracing::warn;

/// Environment variable consulted by [`Environment::from_env`]
pub const ENVIRONMENT_VAR: &str = "FEEDGATE_ENV";

/// Deployment environment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Staging,
    #[default]
    Production,
}

impl Environment {
    /// Resolve from `FEEDGATE_ENV`; unset or unknown values resolve to production
    pub fn from_env() -> Self {
        match std::env::var(ENVIRONMENT_VAR) {
            Ok(value) => value.parse().unwrap_or_else(|_| {
                warn!(value = %value, "Unknown {}, using production limits", ENVIRONMENT_VAR);
                Environment::Production
            }),
            Err(_) => Environment::Production,
        }
    }
}

impl FromStr for Environment {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "staging" | "development" | "dev" => Ok(Environment::Staging),
            "production" | "prod" => Ok(Environment::Production),
            other => Err(CacheError::ConfigError(format!("unknown environment: {}", other))),
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Environment::Staging => write!(f, "staging"),
            Environment::Production => write!(f, "production"),
        }
    }
}

/// Call limits for one provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderLimits {
    /// Calls allowed per rolling day window
    pub daily_limit: u32,

    /// Calls allowed per rolling hour window
    pub hourly_limit: u32,

    /// Minimum spacing between two calls, in milliseconds
    pub cooldown_ms: u64,
}

impl ProviderLimits {
    pub const fn new(daily_limit: u32, hourly_limit: u32, cooldown_ms: u64) -> Self {
        Self {
            daily_limit,
            hourly_limit,
            cooldown_ms,
        }
    }

    /// Limits applied to providers with no configured table entry
    pub const fn unlimited() -> Self {
        Self::new(u32::MAX, u32::MAX, 0)
    }

    pub fn is_unlimited(&self) -> bool {
        *self == Self::unlimited()
    }
}

/// Limit tables for every environment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotaTables {
    pub staging: HashMap<String, ProviderLimits>,
    pub production: HashMap<String, ProviderLimits>,
}

impl Default for QuotaTables {
    fn default() -> Self {
        let staging = HashMap::from([
            ("gnews".to_string(), ProviderLimits::new(20, 5, 120_000)),
            ("gemini".to_string(), ProviderLimits::new(100, 20, 5_000)),
        ]);
        let production = HashMap::from([
            ("gnews".to_string(), ProviderLimits::new(100, 10, 60_000)),
            ("gemini".to_string(), ProviderLimits::new(1_500, 60, 1_000)),
        ]);

        Self { staging, production }
    }
}

impl QuotaTables {
    /// Tables with no configured providers (everything unlimited)
    pub fn empty() -> Self {
        Self {
            staging: HashMap::new(),
            production: HashMap::new(),
        }
    }

    pub fn table(&self, environment: Environment) -> &HashMap<String, ProviderLimits> {
        match environment {
            Environment::Staging => &self.staging,
            Environment::Production => &self.production,
        }
    }

    /// Set the same limits for a provider in every environment
    pub fn with_provider(mut self, provider: impl Into<String>, limits: ProviderLimits) -> Self {
        let provider = provider.into();
        self.staging.insert(provider.clone(), limits);
        self.production.insert(provider, limits);
        self
    }

    /// Set limits for a provider in one environment
    pub fn with_provider_in(
        mut self,
        environment: Environment,
        provider: impl Into<String>,
        limits: ProviderLimits,
    ) -> Self {
        match environment {
            Environment::Staging => self.staging.insert(provider.into(), limits),
            Environment::Production => self.production.insert(provider.into(), limits),
        };
        self
    }

    /// Resolve limits; an unconfigured provider is a configuration gap, not a
    /// quota violation, so it is treated as unlimited
    pub fn limits_for(&self, environment: Environment, provider: &str) -> ProviderLimits {
        self.table(environment)
            .get(provider)
            .copied()
            .unwrap_or_else(ProviderLimits::unlimited)
    }

    pub fn validate(&self) -> Result<()> {
        for (env, table) in [("staging", &self.staging), ("production", &self.production)] {
            for (provider, limits) in table {
                if limits.hourly_limit > limits.daily_limit {
                    return Err(CacheError::ConfigError(format!(
                        "{} limits for '{}': hourly limit {} exceeds daily limit {}",
                        env, provider, limits.hourly_limit, limits.daily_limit
                    )));
                }
            }
        }
        Ok(())
    }
}
