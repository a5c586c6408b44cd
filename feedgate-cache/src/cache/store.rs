//! Two-tier storage backend: in-process map in front of a session store
//!
//! The fast tier is authoritative for the life of the process. Every write
//! lands there first and is then mirrored to the persistent tier on a
//! best-effort basis; a full or disabled persistent tier degrades the store
//! to memory-only operation without surfacing an error.

use crate::cache::entry::CacheEntry;
use crate::cache::eviction::{evict_until, expired, plan_eviction, Budget, EvictionCandidate, SessionRemoval};
use crate::cache::session::SessionStore;
use crate::cache::types::{CacheKey, CacheStats, Counters, Tier};
use crate::clock::Clock;
use crate::config::GovernorConfig;
use crate::error::Result;
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Storage backend shared by the eviction engine and the governor
pub struct TieredStore {
    /// Fast tier
    memory: RwLock<MemoryTier>,

    /// Persistent tier
    session: Arc<dyn SessionStore>,

    /// Namespace for cache records in the persistent tier
    prefix: String,

    memory_budget: Budget,
    session_budget: Budget,

    clock: Arc<dyn Clock>,
    counters: Arc<Counters>,
}

#[derive(Default)]
struct MemoryTier {
    entries: HashMap<CacheKey, MemorySlot>,
    size_bytes: usize,
}

struct MemorySlot {
    entry: CacheEntry,
    size_bytes: usize,
}

impl MemoryTier {
    fn insert(&mut self, entry: CacheEntry, size_bytes: usize) {
        let key = entry.key.clone();
        if let Some(old) = self.entries.insert(key, MemorySlot { entry, size_bytes }) {
            self.size_bytes = self.size_bytes.saturating_sub(old.size_bytes);
        }
        self.size_bytes += size_bytes;
    }

    fn remove(&mut self, key: &str) -> Option<CacheEntry> {
        let slot = self.entries.remove(key)?;
        self.size_bytes = self.size_bytes.saturating_sub(slot.size_bytes);
        Some(slot.entry)
    }

    fn candidates(&self) -> Vec<EvictionCandidate> {
        self.entries
            .iter()
            .map(|(key, slot)| EvictionCandidate {
                key: key.clone(),
                written_at: slot.entry.written_at,
                size_bytes: slot.size_bytes,
                corrupt: false,
            })
            .collect()
    }
}

impl TieredStore {
    pub fn new(config: &GovernorConfig, session: Arc<dyn SessionStore>, clock: Arc<dyn Clock>) -> Self {
        info!(
            prefix = %config.cache_prefix,
            memory_max_bytes = config.memory_max_bytes,
            memory_max_entries = config.memory_max_entries,
            persisted_max_bytes = config.persisted_max_bytes,
            "Initializing tiered store"
        );

        Self {
            memory: RwLock::new(MemoryTier::default()),
            session,
            prefix: config.cache_prefix.clone(),
            memory_budget: Budget {
                max_bytes: config.memory_max_bytes,
                max_entries: config.memory_max_entries,
                load_factor: config.target_load_factor,
            },
            session_budget: Budget::bytes(config.persisted_max_bytes, config.target_load_factor),
            clock,
            counters: Arc::new(Counters::default()),
        }
    }

    pub(crate) fn counters(&self) -> &Arc<Counters> {
        &self.counters
    }

    fn session_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    /// Store an entry in the fast tier and mirror it to the persistent tier
    ///
    /// Only fails if the entry cannot be serialized.
    pub async fn put(&self, entry: CacheEntry) -> Result<()> {
        let record = entry.to_record()?;
        let key = entry.key.clone();
        let size = key.len() + record.len();

        {
            let mut memory = self.memory.write().await;
            memory.insert(entry, size);
            self.enforce_memory_budget(&mut memory, Some(&key));
        }
        debug!(key = %key, size_bytes = size, "Stored cache entry");

        self.persist(&key, &record).await;
        Ok(())
    }

    async fn persist(&self, key: &str, record: &str) {
        let session_key = self.session_key(key);

        if let Err(first) = self.session.set_item(&session_key, record) {
            debug!(key = %key, error = %first, "Persistent write refused, evicting and retrying");
            self.relieve_session_pressure(key);

            if let Err(e) = self.session.set_item(&session_key, record) {
                warn!(key = %key, error = %e, "Persistent tier unavailable, entry kept in memory only");
                Counters::bump(&self.counters.persist_failures);
                return;
            }
        }

        // Cheap check first: total usage includes keys owned by others
        if let Ok(total) = self.session.usage_bytes() {
            if total > self.session_budget.max_bytes {
                self.evict_to_budget(Tier::Session, &self.session_budget, Some(key)).await;
            }
        }
    }

    /// Live read: expired entries are removed and reported as a miss
    pub async fn get(&self, key: &str) -> Option<CacheEntry> {
        let entry = self.get_any(key).await?;
        let now = self.clock.now();

        if expired(entry.written_at, entry.ttl_ms, now) {
            debug!(key = %key, "Cache entry expired");
            self.remove(key).await;
            Counters::bump(&self.counters.evictions_ttl);
            return None;
        }

        Some(entry)
    }

    /// Read without applying expiry (stale-serve path)
    ///
    /// Checks the fast tier, then the persistent tier; a persistent hit is
    /// copied back into the fast tier. Corrupt records are removed.
    pub async fn get_any(&self, key: &str) -> Option<CacheEntry> {
        if let Some(slot) = self.memory.read().await.entries.get(key) {
            return Some(slot.entry.clone());
        }

        let session_key = self.session_key(key);
        let record = match self.session.get_item(&session_key) {
            Ok(Some(record)) => record,
            Ok(None) => return None,
            Err(e) => {
                debug!(key = %key, error = %e, "Persistent tier read failed, treating as miss");
                return None;
            }
        };

        match CacheEntry::from_record(key, &record) {
            Ok(entry) => {
                let size = key.len() + record.len();
                let mut memory = self.memory.write().await;
                memory.insert(entry.clone(), size);
                self.enforce_memory_budget(&mut memory, Some(key));
                debug!(key = %key, "Read-through from persistent tier");
                Some(entry)
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Dropping corrupt cache record");
                self.drop_corrupt(key);
                None
            }
        }
    }

    /// Remove a corrupt persistent record and count it
    pub(crate) fn drop_corrupt(&self, key: &str) {
        Counters::bump(&self.counters.corrupt_records);
        if let Err(e) = self.session.remove_item(&self.session_key(key)) {
            warn!(key = %key, error = %e, "Failed to remove corrupt record");
        }
    }

    /// Remove a key from both tiers; returns whether anything was removed
    pub async fn remove(&self, key: &str) -> bool {
        let in_memory = self.memory.write().await.remove(key).is_some();

        let session_key = self.session_key(key);
        let in_session = match self.session.get_item(&session_key) {
            Ok(Some(_)) => match self.session.remove_item(&session_key) {
                Ok(()) => true,
                Err(e) => {
                    warn!(key = %key, error = %e, "Failed to remove persistent record");
                    false
                }
            },
            Ok(None) => false,
            Err(e) => {
                debug!(key = %key, error = %e, "Persistent tier unavailable during remove");
                false
            }
        };

        in_memory || in_session
    }

    /// Remove every key starting with `pattern`; returns the number removed
    pub async fn remove_prefix(&self, pattern: &str) -> usize {
        let mut removed = 0;
        for key in self.keys().await {
            if key.starts_with(pattern) && self.remove(&key).await {
                removed += 1;
            }
        }
        removed
    }

    /// Remove all cache keys from both tiers, leaving unrelated keys untouched
    pub async fn clear(&self) -> usize {
        let keys = self.keys().await;

        {
            let mut memory = self.memory.write().await;
            memory.entries.clear();
            memory.size_bytes = 0;
        }

        if let Ok(session_keys) = self.session_keys() {
            for key in session_keys {
                if let Err(e) = self.session.remove_item(&self.session_key(&key)) {
                    warn!(key = %key, error = %e, "Failed to clear persistent record");
                }
            }
        }

        info!("Cleared {} entries from cache", keys.len());
        keys.len()
    }

    /// Distinct cache keys stored in either tier, sorted
    pub async fn keys(&self) -> Vec<CacheKey> {
        let mut keys: BTreeSet<CacheKey> = self.memory.read().await.entries.keys().cloned().collect();
        if let Ok(session_keys) = self.session_keys() {
            keys.extend(session_keys);
        }
        keys.into_iter().collect()
    }

    /// Cache keys present in the persistent tier (prefix stripped)
    pub(crate) fn session_keys(&self) -> Result<Vec<CacheKey>> {
        Ok(self
            .session
            .keys()?
            .into_iter()
            .filter_map(|k| k.strip_prefix(&self.prefix).map(str::to_string))
            .collect())
    }

    /// Bytes held by `tier`
    pub async fn size_bytes(&self, tier: Tier) -> usize {
        match tier {
            Tier::Memory => self.memory.read().await.size_bytes,
            Tier::Session => self.session_candidates().iter().map(|c| c.size_bytes).sum(),
        }
    }

    /// Number of cache entries held by `tier`
    pub async fn entry_count(&self, tier: Tier) -> usize {
        match tier {
            Tier::Memory => self.memory.read().await.entries.len(),
            Tier::Session => self.session_keys().map(|k| k.len()).unwrap_or(0),
        }
    }

    /// Occupancy fields of a stats snapshot
    pub async fn stats(&self) -> CacheStats {
        let (memory_entries, memory_bytes) = {
            let memory = self.memory.read().await;
            (memory.entries.len(), memory.size_bytes)
        };
        let session = self.session_candidates();

        let mut stats = CacheStats {
            memory_entries,
            memory_bytes,
            persisted_entries: session.len(),
            persisted_bytes: session.iter().map(|c| c.size_bytes).sum(),
            ..Default::default()
        };
        self.counters.fill(&mut stats);
        stats
    }

    pub(crate) async fn memory_candidates(&self) -> Vec<EvictionCandidate> {
        self.memory.read().await.candidates()
    }

    /// Persistent records as eviction candidates; unparseable ones are flagged corrupt
    fn session_candidates(&self) -> Vec<EvictionCandidate> {
        let keys = match self.session_keys() {
            Ok(keys) => keys,
            Err(_) => return Vec::new(),
        };

        keys.into_iter()
            .filter_map(|key| {
                let record = self.session.get_item(&self.session_key(&key)).ok()??;
                let size_bytes = self.prefix.len() + key.len() + record.len();
                let (written_at, corrupt) = match CacheEntry::from_record(&key, &record) {
                    Ok(entry) => (entry.written_at, false),
                    Err(_) => (DateTime::<Utc>::default(), true),
                };
                Some(EvictionCandidate {
                    key,
                    written_at,
                    size_bytes,
                    corrupt,
                })
            })
            .collect()
    }

    /// Remove a fast-tier entry if it is still expired at `now`
    pub(crate) async fn remove_memory_if_expired(&self, key: &str, now: DateTime<Utc>) -> bool {
        let mut memory = self.memory.write().await;
        let is_expired = memory
            .entries
            .get(key)
            .map(|slot| expired(slot.entry.written_at, slot.entry.ttl_ms, now))
            .unwrap_or(false);

        if is_expired {
            memory.remove(key);
        }
        is_expired
    }

    /// Remove a persistent record if it is expired or corrupt at `now`
    pub(crate) fn remove_session_if_stale(&self, key: &str, now: DateTime<Utc>) -> Result<Option<SessionRemoval>> {
        let session_key = self.session_key(key);
        let record = match self.session.get_item(&session_key)? {
            Some(record) => record,
            None => return Ok(None),
        };

        let reason = match CacheEntry::from_record(key, &record) {
            Ok(entry) if expired(entry.written_at, entry.ttl_ms, now) => SessionRemoval::Expired,
            Ok(_) => return Ok(None),
            Err(_) => SessionRemoval::Corrupt,
        };

        self.session.remove_item(&session_key)?;
        if reason == SessionRemoval::Corrupt {
            Counters::bump(&self.counters.corrupt_records);
        }
        Ok(Some(reason))
    }

    pub(crate) fn record_expirations(&self, n: u64) {
        Counters::add(&self.counters.evictions_ttl, n);
    }

    /// Evict oldest entries from `tier` until it fits `budget`'s target load
    pub(crate) async fn evict_to_budget(&self, tier: Tier, budget: &Budget, protect: Option<&str>) -> usize {
        match tier {
            Tier::Memory => {
                let mut memory = self.memory.write().await;
                let victims = plan_eviction(&memory.candidates(), budget, protect);
                for key in &victims {
                    memory.remove(key);
                }
                self.note_evictions(tier, victims.len());
                victims.len()
            }
            Tier::Session => {
                let victims = plan_eviction(&self.session_candidates(), budget, protect);
                let mut evicted = 0;
                for key in &victims {
                    match self.session.remove_item(&self.session_key(key)) {
                        Ok(()) => evicted += 1,
                        Err(e) => warn!(key = %key, error = %e, "Failed to evict persistent record"),
                    }
                }
                self.note_evictions(tier, evicted);
                evicted
            }
        }
    }

    /// Free persistent space after a refused write, even when our own budget
    /// is not exceeded (the store's quota may be smaller than the budget)
    fn relieve_session_pressure(&self, protect: &str) {
        let candidates = self.session_candidates();
        let used: usize = candidates.iter().map(|c| c.size_bytes).sum();
        let target = self
            .session_budget
            .target_bytes()
            .min((used as f64 * self.session_budget.load_factor) as usize);

        let victims = evict_until(&candidates, target, usize::MAX, Some(protect));
        let mut evicted = 0;
        for key in &victims {
            if self.session.remove_item(&self.session_key(key)).is_ok() {
                evicted += 1;
            }
        }
        self.note_evictions(Tier::Session, evicted);
    }

    fn enforce_memory_budget(&self, memory: &mut MemoryTier, protect: Option<&str>) {
        if !self.memory_budget.is_exceeded(memory.size_bytes, memory.entries.len()) {
            return;
        }
        let victims = plan_eviction(&memory.candidates(), &self.memory_budget, protect);
        for key in &victims {
            memory.remove(key);
        }
        self.note_evictions(Tier::Memory, victims.len());
    }

    fn note_evictions(&self, tier: Tier, count: usize) {
        if count > 0 {
            debug!(tier = %tier, count, "Evicted entries for size budget");
            Counters::add(&self.counters.evictions_size, count as u64);
        }
    }
}
