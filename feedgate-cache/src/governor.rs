//! Orchestration layer: the single entry point for content requests
//!
//! A request names a cache key, a priority and the provider that can refill
//! it. The governor serves fresh cache when it can, spends quota only when the
//! cached copy is too old for the requested priority, and falls back to stale
//! content (or an explicit empty result) when quota or the provider fails.
//! Callers never see an error from [`ContentGovernor::fetch_content`]; every
//! outcome is encoded in [`FetchStatus`].

use crate::cache::entry::{CacheEntry, EntryMetadata, Priority};
use crate::cache::eviction::EvictionEngine;
use crate::cache::session::{MemorySessionStore, SessionStore};
use crate::cache::store::TieredStore;
use crate::cache::types::{CacheKey, CacheStats, CleanupReport, Counters, Tier};
use crate::clock::{Clock, SystemClock};
use crate::config::GovernorConfig;
use crate::error::Result;
use crate::freshness::FreshnessPolicy;
use crate::quota::{QuotaLedger, QuotaUsage};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{watch, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

/// How a content request was satisfied
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FetchStatus {
    /// Served from cache within the priority's TTL
    Hit,
    /// Fetched from the provider and written back
    Miss,
    /// Cached content past its TTL, served because no refresh was possible
    Stale,
    /// Nothing cached and no refresh possible
    Empty,
}

impl fmt::Display for FetchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FetchStatus::Hit => "hit",
            FetchStatus::Miss => "miss",
            FetchStatus::Stale => "stale",
            FetchStatus::Empty => "empty",
        };
        f.write_str(s)
    }
}

/// Result of [`ContentGovernor::fetch_content`]
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentResponse<T> {
    pub data: Option<T>,
    pub status: FetchStatus,

    /// When the served content was fetched
    pub written_at: Option<DateTime<Utc>>,

    /// When the content falls out of its priority's TTL; `None` for stale and
    /// empty responses, which are due for a refresh immediately
    pub next_check_at: Option<DateTime<Utc>>,
}

impl<T> ContentResponse<T> {
    fn empty() -> Self {
        Self {
            data: None,
            status: FetchStatus::Empty,
            written_at: None,
            next_check_at: None,
        }
    }

    /// Hit or miss: the data is within its TTL
    pub fn is_fresh(&self) -> bool {
        matches!(self.status, FetchStatus::Hit | FetchStatus::Miss)
    }
}

/// Cache, quota ledger and freshness policy behind one API
pub struct ContentGovernor {
    config: GovernorConfig,
    store: Arc<TieredStore>,
    ledger: QuotaLedger,
    freshness: FreshnessPolicy,
    eviction: EvictionEngine,
    clock: Arc<dyn Clock>,

    /// Per-key locks held for the duration of a request (single-flight)
    inflight: Mutex<HashMap<CacheKey, Arc<tokio::sync::Mutex<()>>>>,
}

impl ContentGovernor {
    /// Build a governor over `session`; fails only on invalid configuration
    pub fn new(config: GovernorConfig, session: Arc<dyn SessionStore>, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;

        let store = Arc::new(TieredStore::new(&config, session.clone(), clock.clone()));
        let ledger = QuotaLedger::new(
            config.quota.clone(),
            config.environment,
            session,
            clock.clone(),
            config.quota_prefix.clone(),
        );
        let eviction = EvictionEngine::new(store.clone(), clock.clone(), &config);

        info!(
            environment = %config.environment,
            single_flight = config.single_flight,
            "Content governor ready"
        );

        Ok(Self {
            freshness: FreshnessPolicy::new(config.priority_ttls),
            config,
            store,
            ledger,
            eviction,
            clock,
            inflight: Mutex::new(HashMap::new()),
        })
    }

    /// Governor over an in-process session store and the system clock
    pub fn in_memory(config: GovernorConfig) -> Result<Self> {
        Self::new(config, Arc::new(MemorySessionStore::new()), Arc::new(SystemClock))
    }

    /// Serve `key` from cache, refreshing through `fetch` when the cached copy
    /// is too old for `priority` and `provider` has quota left
    ///
    /// At most one call to `fetch` is made. With single-flight enabled,
    /// concurrent requests for the same key wait for the first one and then
    /// read what it wrote.
    pub async fn fetch_content<T, F, Fut, E>(
        &self,
        key: &str,
        priority: Priority,
        provider: &str,
        fetch: F,
    ) -> ContentResponse<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: fmt::Display,
    {
        let request_id = Uuid::new_v4();
        let span = info_span!("fetch_content", %request_id, key = %key, provider = %provider, %priority);

        async move {
            let _flight = self.begin_flight(key).await;
            let response = self.orchestrate(key, priority, provider, fetch).await;
            debug!(status = %response.status, "Content request complete");
            response
        }
        .instrument(span)
        .await
    }

    async fn orchestrate<T, F, Fut, E>(&self, key: &str, priority: Priority, provider: &str, fetch: F) -> ContentResponse<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: fmt::Display,
    {
        let counters = self.store.counters();
        let cached = self.read_typed::<T>(key).await;
        let now = self.clock.now();

        let cached = match cached {
            Some((entry, data)) if !self.freshness.should_refresh(Some(&entry), priority, now) => {
                Counters::bump(&counters.hits);
                return ContentResponse {
                    data: Some(data),
                    status: FetchStatus::Hit,
                    written_at: Some(entry.written_at),
                    next_check_at: self.freshness.next_check_at(&entry, priority),
                };
            }
            other => other,
        };

        if !self.ledger.can_call(provider).await {
            debug!("Quota unavailable, skipping fetch");
            Counters::bump(&counters.quota_rejections);
            return self.stale_or_empty(cached);
        }

        match fetch().await {
            Ok(data) => {
                let consumed = cached
                    .as_ref()
                    .and_then(|(entry, _)| entry.metadata.as_ref())
                    .map(|m| m.api_calls_consumed)
                    .unwrap_or(0);
                let response_bytes = self.write_back(key, &data, priority, provider, consumed + 1).await;
                self.ledger.record_call(provider, response_bytes, None).await;
                Counters::bump(&counters.misses);

                let now = self.clock.now();
                ContentResponse {
                    data: Some(data),
                    status: FetchStatus::Miss,
                    written_at: Some(now),
                    next_check_at: self.freshness.priority_deadline(now, priority),
                }
            }
            Err(e) => {
                warn!(error = %e, "Fetch failed, falling back to cached content");
                self.ledger.record_call(provider, None, None).await;
                Counters::bump(&counters.fetch_failures);
                self.stale_or_empty(cached)
            }
        }
    }

    /// Cache a freshly fetched value; returns its serialized size
    async fn write_back<T: Serialize>(
        &self,
        key: &str,
        data: &T,
        priority: Priority,
        provider: &str,
        api_calls_consumed: u32,
    ) -> Option<u64> {
        let value = match serde_json::to_value(data) {
            Ok(value) => value,
            Err(e) => {
                warn!(error = %e, "Fetched content is not serializable, not caching");
                return None;
            }
        };

        let now = self.clock.now();
        let ttl = self.config.ttl_with_jitter(self.freshness.ttl_for(priority));
        let metadata = EntryMetadata {
            api_calls_consumed,
            ..EntryMetadata::new(priority, now)
        };
        let entry = CacheEntry::new(key, value, now, ttl)
            .with_source(provider)
            .with_metadata(metadata);
        let size = entry.calculate_size() as u64;

        if let Err(e) = self.store.put(entry).await {
            warn!(error = %e, "Failed to cache fetched content");
        }
        Some(size)
    }

    fn stale_or_empty<T>(&self, cached: Option<(CacheEntry, T)>) -> ContentResponse<T> {
        let counters = self.store.counters();
        match cached {
            Some((entry, data)) => {
                Counters::bump(&counters.stale_serves);
                debug!(written_at = %entry.written_at, "Serving stale content");
                ContentResponse {
                    data: Some(data),
                    status: FetchStatus::Stale,
                    written_at: Some(entry.written_at),
                    next_check_at: None,
                }
            }
            None => {
                Counters::bump(&counters.empty_results);
                ContentResponse::empty()
            }
        }
    }

    /// Read an entry (expired or not) and decode it as `T`
    ///
    /// A payload that does not decode is treated as corrupt and removed.
    async fn read_typed<T: DeserializeOwned>(&self, key: &str) -> Option<(CacheEntry, T)> {
        let entry = self.store.get_any(key).await?;
        self.decode(entry).await
    }

    async fn decode<T: DeserializeOwned>(&self, entry: CacheEntry) -> Option<(CacheEntry, T)> {
        match serde_json::from_value::<T>(entry.value.clone()) {
            Ok(data) => Some((entry, data)),
            Err(e) => {
                warn!(key = %entry.key, error = %e, "Cached payload has unexpected shape, dropping");
                self.store.remove(&entry.key).await;
                Counters::bump(&self.store.counters().corrupt_records);
                None
            }
        }
    }

    async fn begin_flight(&self, key: &str) -> Option<FlightGuard<'_>> {
        if !self.config.single_flight {
            return None;
        }

        let lock = {
            let mut inflight = self.inflight.lock().unwrap_or_else(|e| e.into_inner());
            // A slot only the map references was left by a waiter cancelled
            // after its leader finished
            inflight.retain(|_, lock| Arc::strong_count(lock) > 1);
            inflight.entry(key.to_string()).or_default().clone()
        };

        Some(FlightGuard {
            inflight: &self.inflight,
            key: key.to_string(),
            guard: Some(lock.lock_owned().await),
        })
    }

    /// Store a value directly, bypassing quota
    pub async fn set<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) -> Result<()> {
        let entry = CacheEntry::new(key, serde_json::to_value(value)?, self.clock.now(), ttl);
        self.store.put(entry).await
    }

    /// Live value for `key`; expired, missing or mistyped entries read as `None`
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let entry = self.store.get(key).await?;
        self.decode(entry).await.map(|(_, data)| data)
    }

    /// Live entry for `key` including its metadata
    pub async fn get_entry(&self, key: &str) -> Option<CacheEntry> {
        self.store.get(key).await
    }

    /// Whether a request for `key` at `priority` would try to refresh
    pub async fn needs_refresh(&self, key: &str, priority: Priority) -> bool {
        let entry = self.store.get_any(key).await;
        self.freshness.should_refresh(entry.as_ref(), priority, self.clock.now())
    }

    pub async fn invalidate(&self, key: &str) -> bool {
        let removed = self.store.remove(key).await;
        if removed {
            Counters::bump(&self.store.counters().invalidations);
            debug!(key = %key, "Invalidated cache entry");
        }
        removed
    }

    /// Remove every key starting with `pattern`
    pub async fn invalidate_prefix(&self, pattern: &str) -> usize {
        let removed = self.store.remove_prefix(pattern).await;
        Counters::add(&self.store.counters().invalidations, removed as u64);
        info!(pattern = %pattern, removed, "Invalidated cache entries by prefix");
        removed
    }

    /// Drop all cached content; quota counters are kept
    pub async fn clear(&self) -> usize {
        self.store.clear().await
    }

    pub async fn keys(&self) -> Vec<CacheKey> {
        self.store.keys().await
    }

    pub async fn get_stats(&self) -> CacheStats {
        self.store.stats().await
    }

    /// Read-only quota check
    pub async fn can_make_api_call(&self, provider: &str) -> bool {
        self.ledger.peek(provider).await
    }

    pub async fn quota_usage(&self, provider: &str) -> QuotaUsage {
        self.ledger.usage(provider).await
    }

    /// Usage for every configured or previously called provider
    pub async fn all_quota_usage(&self) -> Vec<QuotaUsage> {
        let mut usage = Vec::new();
        for provider in self.ledger.providers().await {
            usage.push(self.ledger.usage(&provider).await);
        }
        usage
    }

    pub async fn reset_quota(&self, provider: &str) {
        self.ledger.reset(provider).await;
    }

    /// Remove expired and corrupt entries, then enforce both size budgets
    pub async fn perform_cleanup(&self) -> CleanupReport {
        let mut report = self.eviction.cleanup().await;
        report.evicted_for_size = self.eviction.enforce_budgets().await;
        report
    }

    /// Evict oldest entries from `tier` beyond `max_bytes`
    pub async fn enforce_size_budget(&self, tier: Tier, max_bytes: usize) -> usize {
        self.eviction.enforce_size_budget(tier, max_bytes).await
    }

    /// Spawn periodic cleanup until `shutdown` turns true
    ///
    /// Returns `None` when auto cleanup is disabled in the configuration.
    pub fn start_auto_cleanup(
        governor: Arc<ContentGovernor>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Option<JoinHandle<()>> {
        if !governor.config.enable_auto_cleanup {
            debug!("Auto cleanup disabled");
            return None;
        }

        let period = governor.config.cleanup_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!(interval_secs = period.as_secs(), "Auto cleanup started");

            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            info!("Auto cleanup shutting down");
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        governor.perform_cleanup().await;
                    }
                }
            }
        });

        Some(handle)
    }

    pub fn config(&self) -> &GovernorConfig {
        &self.config
    }

    pub fn freshness(&self) -> &FreshnessPolicy {
        &self.freshness
    }

    pub fn ledger(&self) -> &QuotaLedger {
        &self.ledger
    }

    pub fn store(&self) -> &Arc<TieredStore> {
        &self.store
    }
}

/// Holds a key's single-flight lock; removes the lock once nobody waits on it
///
/// A waiter cancelled between the leader's release and its own wakeup never
/// builds a guard, so its slot outlives it until the next `begin_flight`.
struct FlightGuard<'a> {
    inflight: &'a Mutex<HashMap<CacheKey, Arc<tokio::sync::Mutex<()>>>>,
    key: CacheKey,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();

        let mut inflight = self.inflight.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(lock) = inflight.get(&self.key) {
            if Arc::strong_count(lock) == 1 {
                inflight.remove(&self.key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::quota::{ProviderLimits, QuotaTables};

    fn governor(limits: ProviderLimits) -> (ContentGovernor, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::at_millis(1_000_000));
        let config = GovernorConfig::builder()
            .ttl_jitter(0.0)
            .quota(QuotaTables::empty().with_provider("gnews", limits))
            .build();
        let governor = ContentGovernor::new(config, Arc::new(MemorySessionStore::new()), clock.clone()).unwrap();
        (governor, clock)
    }

    #[tokio::test]
    async fn test_miss_then_hit() {
        let (governor, _clock) = governor(ProviderLimits::new(100, 10, 0));

        let first = governor
            .fetch_content("news_x", Priority::High, "gnews", || async { Ok::<_, String>(vec![1, 2]) })
            .await;
        assert_eq!(first.status, FetchStatus::Miss);
        assert_eq!(first.data, Some(vec![1, 2]));

        let second = governor
            .fetch_content("news_x", Priority::High, "gnews", || async {
                Err::<Vec<i32>, _>("must not be called")
            })
            .await;
        assert_eq!(second.status, FetchStatus::Hit);
        assert_eq!(second.data, Some(vec![1, 2]));
        assert_eq!(second.written_at, first.written_at);
    }

    #[tokio::test]
    async fn test_orchestrated_write_carries_metadata() {
        let (governor, clock) = governor(ProviderLimits::new(100, 10, 0));

        governor
            .fetch_content("k", Priority::High, "gnews", || async { Ok::<_, String>(1) })
            .await;
        clock.advance(Duration::from_secs(3 * 3600));
        governor
            .fetch_content("k", Priority::High, "gnews", || async { Ok::<_, String>(2) })
            .await;

        let entry = governor.store().get_any("k").await.unwrap();
        let metadata = entry.metadata.as_ref().unwrap();
        assert_eq!(entry.source, "gnews");
        assert_eq!(metadata.api_calls_consumed, 2);
        assert_eq!(metadata.priority, Priority::High);
        assert_eq!(entry.ttl(), Duration::from_secs(2 * 3600));
    }

    #[tokio::test]
    async fn test_next_check_follows_priority() {
        let (governor, clock) = governor(ProviderLimits::new(100, 10, 0));
        let start = clock.now();

        let response = governor
            .fetch_content("k", Priority::Low, "gnews", || async { Ok::<_, String>("v".to_string()) })
            .await;
        assert_eq!(response.next_check_at, Some(start + chrono::Duration::hours(12)));
        assert!(response.is_fresh());
    }

    #[tokio::test]
    async fn test_abandoned_flight_slot_is_pruned() {
        let (governor, _clock) = governor(ProviderLimits::new(100, 10, 0));
        governor
            .inflight
            .lock()
            .unwrap()
            .insert("abandoned".to_string(), Arc::new(tokio::sync::Mutex::new(())));

        governor
            .fetch_content("k", Priority::High, "gnews", || async { Ok::<_, String>(1) })
            .await;

        assert!(governor.inflight.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_mistyped_payload_is_dropped() {
        let (governor, _clock) = governor(ProviderLimits::new(100, 10, 0));
        governor.set("k", &"text", Duration::from_secs(60)).await.unwrap();

        let value: Option<u64> = governor.get("k").await;
        assert!(value.is_none());
        assert!(governor.keys().await.is_empty());
        assert_eq!(governor.get_stats().await.corrupt_records, 1);
    }

    #[tokio::test]
    async fn test_single_flight_map_is_cleaned_up() {
        let (governor, _clock) = governor(ProviderLimits::new(100, 10, 0));
        governor
            .fetch_content("k", Priority::Medium, "gnews", || async { Ok::<_, String>(1) })
            .await;
        assert!(governor.inflight.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_auto_cleanup_respects_config_and_shutdown() {
        let (tx, rx) = watch::channel(false);

        let disabled = GovernorConfig::builder().enable_auto_cleanup(false).build();
        let governor = Arc::new(ContentGovernor::in_memory(disabled).unwrap());
        assert!(ContentGovernor::start_auto_cleanup(governor, rx.clone()).is_none());

        let enabled = GovernorConfig::builder()
            .cleanup_interval(Duration::from_millis(10))
            .build();
        let governor = Arc::new(ContentGovernor::in_memory(enabled).unwrap());
        let handle = ContentGovernor::start_auto_cleanup(governor, rx).unwrap();

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
    }

    #[test]
    fn test_status_serializes_lowercase() {
        assert_eq!(serde_json::to_value(FetchStatus::Stale).unwrap(), "stale");
        assert_eq!(FetchStatus::Empty.to_string(), "empty");
    }
}
