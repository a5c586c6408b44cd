//! # Two-Tier Content Cache
//!
//! Storage and expiry for fetched content.
//!
//! ## Features
//!
//! - **Two tiers**: a bounded in-process map in front of a string key/value
//!   session store (in-memory with a byte quota, or a JSON file)
//! - **Best-effort persistence**: a full or disabled session store degrades
//!   the cache to memory-only operation instead of failing writes
//! - **TTL expiry**: an entry is expired once `now > written_at + ttl`
//! - **Size budgets**: oldest-written entries are evicted until a tier is back
//!   under `budget × target_load_factor`
//! - **Corruption handling**: unreadable records are removed and counted
//!
//! ## Example
//!
//! ```rust
//! use feedgate_cache::cache::{CacheEntry, MemorySessionStore, TieredStore};
//! use feedgate_cache::{GovernorConfig, SystemClock};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn example() -> feedgate_cache::Result<()> {
//! let store = TieredStore::new(
//!     &GovernorConfig::default(),
//!     Arc::new(MemorySessionStore::new()),
//!     Arc::new(SystemClock),
//! );
//!
//! let entry = CacheEntry::new("news_x", serde_json::json!([{"title": "A"}]), chrono::Utc::now(), Duration::from_secs(5));
//! store.put(entry).await?;
//!
//! assert!(store.get("news_x").await.is_some());
//! # Ok(())
//! # }
//! ```

pub mod entry;
pub mod eviction;
pub mod file_store;
pub mod session;
pub mod store;
pub mod types;

pub use entry::{deadline_after, ttl_millis, CacheEntry, EntryMetadata, Priority, StoredEnvelope, MAX_TTL_MS};
pub use eviction::{evict_until, is_expired, plan_eviction, Budget, EvictionCandidate, EvictionEngine};
pub use file_store::FileSessionStore;
pub use session::{MemorySessionStore, SessionStore};
pub use store::TieredStore;
pub use types::{CacheKey, CacheStats, CleanupReport, Tier};
