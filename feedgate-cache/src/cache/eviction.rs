//! Expiry checks, size-budget eviction and cleanup scans
//!
//! Eviction removes the oldest entries by write time until a tier is back
//! under `budget × target_load_factor`, so a tier that crosses its budget is
//! trimmed in one batch instead of one entry per write.

use crate::cache::entry::{deadline_after, CacheEntry};
use crate::cache::store::TieredStore;
use crate::cache::types::{CacheKey, CleanupReport, Tier};
use crate::clock::Clock;
use crate::config::GovernorConfig;
use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// `now > written_at + ttl`; a deadline beyond the calendar never passes
pub fn is_expired(entry: &CacheEntry, now: DateTime<Utc>) -> bool {
    expired(entry.written_at, entry.ttl_ms, now)
}

pub(crate) fn expired(written_at: DateTime<Utc>, ttl_ms: u64, now: DateTime<Utc>) -> bool {
    deadline_after(written_at, ttl_ms).map_or(false, |deadline| now > deadline)
}

/// One stored item considered for eviction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvictionCandidate {
    pub key: CacheKey,
    pub written_at: DateTime<Utc>,
    pub size_bytes: usize,
    /// Record failed to parse; evicted before anything else
    pub corrupt: bool,
}

impl EvictionCandidate {
    /// Eviction order: corrupt first, then oldest write, then key
    fn eviction_order(&self, other: &Self) -> Ordering {
        other
            .corrupt
            .cmp(&self.corrupt)
            .then(self.written_at.cmp(&other.written_at))
            .then_with(|| self.key.cmp(&other.key))
    }
}

/// Size and count limits for one tier
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Budget {
    pub max_bytes: usize,
    pub max_entries: usize,
    pub load_factor: f64,
}

impl Budget {
    pub fn bytes(max_bytes: usize, load_factor: f64) -> Self {
        Self {
            max_bytes,
            max_entries: usize::MAX,
            load_factor,
        }
    }

    pub(crate) fn target_bytes(&self) -> usize {
        (self.max_bytes as f64 * self.load_factor) as usize
    }

    pub(crate) fn target_entries(&self) -> usize {
        if self.max_entries == usize::MAX {
            usize::MAX
        } else {
            (self.max_entries as f64 * self.load_factor) as usize
        }
    }

    pub fn is_exceeded(&self, bytes: usize, entries: usize) -> bool {
        bytes > self.max_bytes || entries > self.max_entries
    }
}

/// Choose victims so the remaining items fit the budget's target load
///
/// Returns nothing when the tier is within budget. `protect` names a key that
/// must survive (the entry being written).
pub fn plan_eviction(candidates: &[EvictionCandidate], budget: &Budget, protect: Option<&str>) -> Vec<CacheKey> {
    let bytes: usize = candidates.iter().map(|c| c.size_bytes).sum();

    if !budget.is_exceeded(bytes, candidates.len()) {
        return Vec::new();
    }

    evict_until(candidates, budget.target_bytes(), budget.target_entries(), protect)
}

/// Choose victims in eviction order until at most `target_bytes` and
/// `target_entries` remain, regardless of any budget
pub fn evict_until(
    candidates: &[EvictionCandidate],
    target_bytes: usize,
    target_entries: usize,
    protect: Option<&str>,
) -> Vec<CacheKey> {
    let mut bytes: usize = candidates.iter().map(|c| c.size_bytes).sum();
    let mut entries = candidates.len();

    let mut ordered: Vec<&EvictionCandidate> = candidates.iter().collect();
    ordered.sort_by(|a, b| a.eviction_order(b));

    let mut victims = Vec::new();

    for candidate in ordered {
        if bytes <= target_bytes && entries <= target_entries {
            break;
        }
        if protect == Some(candidate.key.as_str()) {
            continue;
        }
        bytes = bytes.saturating_sub(candidate.size_bytes);
        entries -= 1;
        victims.push(candidate.key.clone());
    }

    victims
}

/// Keeps both tiers within budget and free of expired or corrupt records
pub struct EvictionEngine {
    store: Arc<TieredStore>,
    clock: Arc<dyn Clock>,
    memory_budget: Budget,
    session_budget: Budget,
}

impl EvictionEngine {
    pub fn new(store: Arc<TieredStore>, clock: Arc<dyn Clock>, config: &GovernorConfig) -> Self {
        Self {
            store,
            clock,
            memory_budget: Budget {
                max_bytes: config.memory_max_bytes,
                max_entries: config.memory_max_entries,
                load_factor: config.target_load_factor,
            },
            session_budget: Budget::bytes(config.persisted_max_bytes, config.target_load_factor),
        }
    }

    /// Remove every expired entry and corrupt record from both tiers
    ///
    /// Entries are re-checked at removal time, so an entry refreshed while the
    /// scan runs is kept. A failure on one record is logged and counted; the
    /// scan continues.
    pub async fn cleanup(&self) -> CleanupReport {
        let now = self.clock.now();
        let mut report = CleanupReport::default();

        for candidate in self.store.memory_candidates().await {
            if self.store.remove_memory_if_expired(&candidate.key, now).await {
                report.expired_memory += 1;
            }
        }

        match self.store.session_keys() {
            Ok(keys) => {
                for key in keys {
                    match self.store.remove_session_if_stale(&key, now) {
                        Ok(Some(SessionRemoval::Expired)) => report.expired_session += 1,
                        Ok(Some(SessionRemoval::Corrupt)) => report.corrupt_removed += 1,
                        Ok(None) => {}
                        Err(e) => {
                            warn!(key = %key, error = %e, "Failed to clean session record");
                            report.failures += 1;
                        }
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "Persistent tier unavailable, cleaned memory tier only");
            }
        }

        self.store.record_expirations((report.expired_memory + report.expired_session) as u64);

        if report.is_empty() {
            debug!("Cleanup found nothing to remove");
        } else {
            info!(%report, "Cleanup pass complete");
        }

        report
    }

    /// Evict oldest entries from `tier` when it holds more than `max_bytes`
    pub async fn enforce_size_budget(&self, tier: Tier, max_bytes: usize) -> usize {
        let budget = match tier {
            Tier::Memory => Budget {
                max_bytes,
                ..self.memory_budget
            },
            Tier::Session => Budget {
                max_bytes,
                ..self.session_budget
            },
        };
        self.store.evict_to_budget(tier, &budget, None).await
    }

    /// Apply the configured budgets to both tiers
    pub async fn enforce_budgets(&self) -> usize {
        let memory = self.store.evict_to_budget(Tier::Memory, &self.memory_budget, None).await;
        let session = self.store.evict_to_budget(Tier::Session, &self.session_budget, None).await;
        memory + session
    }
}

/// Why a persistent record was removed during cleanup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SessionRemoval {
    Expired,
    Corrupt,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::millis_to_datetime;
    use serde_json::json;
    use std::time::Duration;

    fn candidate(key: &str, written_ms: i64, size: usize) -> EvictionCandidate {
        EvictionCandidate {
            key: key.to_string(),
            written_at: millis_to_datetime(written_ms),
            size_bytes: size,
            corrupt: false,
        }
    }

    #[test]
    fn test_is_expired_boundary() {
        let entry = CacheEntry::new("k", json!(1), millis_to_datetime(0), Duration::from_millis(1000));
        assert!(!is_expired(&entry, millis_to_datetime(1000)));
        assert!(is_expired(&entry, millis_to_datetime(1001)));
        assert!(!is_expired(&entry, millis_to_datetime(0)));
    }

    #[test]
    fn test_deadline_past_calendar_never_expires() {
        let mut entry = CacheEntry::new("k", json!(1), millis_to_datetime(1_700_000_000_000), Duration::from_secs(1));
        entry.ttl_ms = i64::MAX as u64;
        assert!(!is_expired(&entry, millis_to_datetime(4_000_000_000_000)));

        entry.ttl_ms = u64::MAX;
        assert!(!is_expired(&entry, millis_to_datetime(1_700_000_000_001)));
    }

    #[test]
    fn test_within_budget_evicts_nothing() {
        let candidates = vec![candidate("a", 0, 10), candidate("b", 1, 10)];
        let budget = Budget::bytes(100, 0.8);
        assert!(plan_eviction(&candidates, &budget, None).is_empty());
    }

    #[test]
    fn test_evicts_oldest_down_to_load_factor() {
        let candidates = vec![
            candidate("newest", 30, 30),
            candidate("oldest", 10, 30),
            candidate("middle", 20, 30),
            candidate("recent", 25, 30),
        ];
        // 120 bytes against a 100 byte budget: must fall to 80
        let budget = Budget::bytes(100, 0.8);
        let victims = plan_eviction(&candidates, &budget, None);
        assert_eq!(victims, vec!["oldest".to_string(), "middle".to_string()]);
    }

    #[test]
    fn test_ties_break_by_key() {
        let candidates = vec![candidate("b", 5, 60), candidate("a", 5, 60)];
        let budget = Budget::bytes(100, 0.8);
        assert_eq!(plan_eviction(&candidates, &budget, None), vec!["a".to_string()]);
    }

    #[test]
    fn test_corrupt_records_go_first() {
        let mut broken = candidate("broken", 50, 10);
        broken.corrupt = true;
        let candidates = vec![candidate("old", 0, 100), broken];
        let budget = Budget::bytes(105, 1.0);
        assert_eq!(plan_eviction(&candidates, &budget, None), vec!["broken".to_string()]);
    }

    #[test]
    fn test_protected_key_survives() {
        let candidates = vec![candidate("new", 0, 90), candidate("other", 1, 20)];
        let budget = Budget::bytes(100, 0.8);
        assert_eq!(plan_eviction(&candidates, &budget, Some("new")), vec!["other".to_string()]);
    }

    #[test]
    fn test_evict_until_ignores_budget() {
        let candidates = vec![candidate("a", 0, 50), candidate("b", 1, 50)];
        assert_eq!(evict_until(&candidates, 60, usize::MAX, None), vec!["a".to_string()]);
        assert!(evict_until(&candidates, 100, usize::MAX, None).is_empty());
    }

    #[test]
    fn test_entry_count_budget() {
        let candidates: Vec<_> = (0..5).map(|i| candidate(&format!("k{}", i), i, 1)).collect();
        let budget = Budget {
            max_bytes: usize::MAX,
            max_entries: 4,
            load_factor: 0.5,
        };
        assert_eq!(plan_eviction(&candidates, &budget, None), vec!["k0", "k1", "k2"]);
    }
}
