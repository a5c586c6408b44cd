//! Priority-aware refresh decisions
//!
//! The TTL stored on an entry reflects the policy in force when it was
//! written. Reads also apply the TTL of the priority requested *now*, and
//! whichever deadline comes first wins, so a caller can tighten freshness for
//! a key without rewriting it but never loosen it.

use crate::cache::entry::{deadline_after, ttl_millis, CacheEntry, Priority};
use crate::cache::eviction::is_expired;
use crate::config::serde_millis;
use crate::error::{CacheError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Read-time TTL per priority class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriorityTtls {
    #[serde(rename = "highMs", with = "serde_millis")]
    pub high: Duration,
    #[serde(rename = "mediumMs", with = "serde_millis")]
    pub medium: Duration,
    #[serde(rename = "lowMs", with = "serde_millis")]
    pub low: Duration,
}

impl Default for PriorityTtls {
    fn default() -> Self {
        Self {
            high: Duration::from_secs(2 * 3600),
            medium: Duration::from_secs(6 * 3600),
            low: Duration::from_secs(12 * 3600),
        }
    }
}

impl PriorityTtls {
    pub fn get(&self, priority: Priority) -> Duration {
        match priority {
            Priority::High => self.high,
            Priority::Medium => self.medium,
            Priority::Low => self.low,
        }
    }

    /// TTLs must be non-zero and strictly increase from high to low priority
    pub fn validate(&self) -> Result<()> {
        if self.high.is_zero() {
            return Err(CacheError::ConfigError("priority TTLs must be greater than 0".to_string()));
        }
        if !(self.high < self.medium && self.medium < self.low) {
            return Err(CacheError::ConfigError(format!(
                "priority TTLs must satisfy high < medium < low (got {:?}, {:?}, {:?})",
                self.high, self.medium, self.low
            )));
        }
        Ok(())
    }
}

/// Decides whether a cached entry should be refreshed before serving
#[derive(Debug, Clone, Copy, Default)]
pub struct FreshnessPolicy {
    ttls: PriorityTtls,
}

impl FreshnessPolicy {
    pub fn new(ttls: PriorityTtls) -> Self {
        Self { ttls }
    }

    pub fn ttls(&self) -> &PriorityTtls {
        &self.ttls
    }

    pub fn ttl_for(&self, priority: Priority) -> Duration {
        self.ttls.get(priority)
    }

    /// True when there is nothing to serve, the entry has outlived its own
    /// TTL, or it is older than the priority's TTL
    pub fn should_refresh(&self, entry: Option<&CacheEntry>, priority: Priority, now: DateTime<Utc>) -> bool {
        match entry {
            None => true,
            Some(entry) => {
                is_expired(entry, now)
                    || self
                        .priority_deadline(entry.written_at, priority)
                        .map_or(false, |deadline| now > deadline)
            }
        }
    }

    /// Earlier of the entry's expiry and its priority deadline; `None` when
    /// neither falls within the calendar
    pub fn next_check_at(&self, entry: &CacheEntry, priority: Priority) -> Option<DateTime<Utc>> {
        match (entry.expires_at(), self.priority_deadline(entry.written_at, priority)) {
            (Some(expiry), Some(deadline)) => Some(expiry.min(deadline)),
            (expiry, deadline) => expiry.or(deadline),
        }
    }

    /// When content written at `written_at` goes stale for `priority`
    pub fn priority_deadline(&self, written_at: DateTime<Utc>, priority: Priority) -> Option<DateTime<Utc>> {
        deadline_after(written_at, ttl_millis(self.ttl_for(priority)))
    }
}
