//! Core type definitions for the cache system

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Cache key type - caller-assigned, stable for the same logical content
pub type CacheKey = String;

/// Storage tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    /// Fast, volatile, in-process map
    Memory,

    /// Session-scoped persistent string store
    Session,
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tier::Memory => write!(f, "memory"),
            Tier::Session => write!(f, "session"),
        }
    }
}

/// Snapshot of cache occupancy and outcome counters
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct CacheStats {
    /// Entries held in the fast tier
    pub memory_entries: usize,

    /// Bytes held in the fast tier
    pub memory_bytes: usize,

    /// Cache records held in the persistent tier
    pub persisted_entries: usize,

    /// Bytes held in the persistent tier (keys + records)
    pub persisted_bytes: usize,

    /// Orchestrated requests served fresh from cache
    pub hits: u64,

    /// Orchestrated requests served by a successful fetch
    pub misses: u64,

    /// Orchestrated requests served a stale entry
    pub stale_serves: u64,

    /// Orchestrated requests with nothing to serve
    pub empty_results: u64,

    /// Fetch collaborator failures
    pub fetch_failures: u64,

    /// Refreshes skipped because the provider had no quota left
    pub quota_rejections: u64,

    /// Entries evicted due to size budgets
    pub evictions_size: u64,

    /// Entries removed because they expired
    pub evictions_ttl: u64,

    /// Records dropped because they failed to deserialize
    pub corrupt_records: u64,

    /// Persistent-tier writes that failed and were skipped
    pub persist_failures: u64,

    /// Explicit invalidations
    pub invalidations: u64,
}

impl CacheStats {
    /// Share of orchestrated requests answered without an outbound call, as a percentage
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses + self.stale_serves + self.empty_results;
        if total == 0 {
            0.0
        } else {
            (self.hits as f64 / total as f64) * 100.0
        }
    }

    /// Total evictions
    pub fn total_evictions(&self) -> u64 {
        self.evictions_size + self.evictions_ttl
    }
}

impl fmt::Display for CacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "CacheStats {{ memory: {} entries / {} bytes, persisted: {} entries / {} bytes, hits: {}, misses: {}, stale: {}, empty: {}, hit_rate: {:.2}%, evictions: {}, corrupt: {} }}",
            self.memory_entries,
            self.memory_bytes,
            self.persisted_entries,
            self.persisted_bytes,
            self.hits,
            self.misses,
            self.stale_serves,
            self.empty_results,
            self.hit_rate(),
            self.total_evictions(),
            self.corrupt_records
        )
    }
}

/// Shared event counters, updated without taking the tier locks
#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub stale_serves: AtomicU64,
    pub empty_results: AtomicU64,
    pub fetch_failures: AtomicU64,
    pub quota_rejections: AtomicU64,
    pub evictions_size: AtomicU64,
    pub evictions_ttl: AtomicU64,
    pub corrupt_records: AtomicU64,
    pub persist_failures: AtomicU64,
    pub invalidations: AtomicU64,
}

impl Counters {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    /// Copy counter values into a stats snapshot
    pub fn fill(&self, stats: &mut CacheStats) {
        stats.hits = self.hits.load(Ordering::Relaxed);
        stats.misses = self.misses.load(Ordering::Relaxed);
        stats.stale_serves = self.stale_serves.load(Ordering::Relaxed);
        stats.empty_results = self.empty_results.load(Ordering::Relaxed);
        stats.fetch_failures = self.fetch_failures.load(Ordering::Relaxed);
        stats.quota_rejections = self.quota_rejections.load(Ordering::Relaxed);
        stats.evictions_size = self.evictions_size.load(Ordering::Relaxed);
        stats.evictions_ttl = self.evictions_ttl.load(Ordering::Relaxed);
        stats.corrupt_records = self.corrupt_records.load(Ordering::Relaxed);
        stats.persist_failures = self.persist_failures.load(Ordering::Relaxed);
        stats.invalidations = self.invalidations.load(Ordering::Relaxed);
    }
}

/// Outcome of one cleanup pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupReport {
    /// Expired entries removed from the fast tier
    pub expired_memory: usize,

    /// Expired records removed from the persistent tier
    pub expired_session: usize,

    /// Corrupt records removed from the persistent tier
    pub corrupt_removed: usize,

    /// Entries evicted to bring a tier back under budget
    pub evicted_for_size: usize,

    /// Entries that could not be removed (logged, scan continued)
    pub failures: usize,
}

impl CleanupReport {
    pub fn total_removed(&self) -> usize {
        self.expired_memory + self.expired_session + self.corrupt_removed + self.evicted_for_size
    }

    pub fn is_empty(&self) -> bool {
        self.total_removed() == 0 && self.failures == 0
    }
}

impl fmt::Display for CleanupReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "expired: {} memory / {} session, corrupt: {}, evicted: {}, failures: {}",
            self.expired_memory,
            self.expired_session,
            self.corrupt_removed,
            self.evicted_for_size,
            self.failures
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_stats_hit_rate() {
        let stats = CacheStats {
            hits: 80,
            misses: 10,
            stale_serves: 5,
            empty_results: 5,
            ..Default::default()
        };

        assert_eq!(stats.hit_rate(), 80.0);
    }

    #[test]
    fn test_cache_stats_zero_requests() {
        let stats = CacheStats::default();
        assert_eq!(stats.hit_rate(), 0.0);
        assert_eq!(stats.total_evictions(), 0);
    }

    #[test]
    fn test_counters_fill() {
        let counters = Counters::default();
        Counters::bump(&counters.hits);
        Counters::bump(&counters.hits);
        Counters::add(&counters.evictions_ttl, 3);

        let mut stats = CacheStats::default();
        counters.fill(&mut stats);

        assert_eq!(stats.hits, 2);
        assert_eq!(stats.evictions_ttl, 3);
        assert_eq!(stats.total_evictions(), 3);
    }

    #[test]
    fn test_cache_stats_display() {
        let stats = CacheStats {
            memory_entries: 3,
            hits: 100,
            misses: 50,
            ..Default::default()
        };

        let display = format!("{}", stats);
        assert!(display.contains("hits: 100"));
        assert!(display.contains("misses: 50"));
        assert!(display.contains("memory: 3 entries"));
    }

    #[test]
    fn test_tier_display() {
        assert_eq!(Tier::Memory.to_string(), "memory");
        assert_eq!(Tier::Session.to_string(), "session");
    }

    #[test]
    fn test_cleanup_report_totals() {
        let report = CleanupReport {
            expired_memory: 1,
            expired_session: 2,
            corrupt_removed: 1,
            evicted_for_size: 0,
            failures: 0,
        };
        assert_eq!(report.total_removed(), 4);
        assert!(!report.is_empty());
        assert!(CleanupReport::default().is_empty());
    }
}
