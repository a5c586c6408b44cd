//! # feedgate-cache
//!
//! Client-side content cache and API-quota governor.
//!
//! Content-heavy applications pull from rate-limited providers (news search,
//! event listings, AI summaries). This crate decides, per request, whether
//! cached content is fresh enough to serve, whether a refresh is allowed under
//! the provider's hourly, daily and cooldown limits, and what to serve when it
//! is not.
//!
//! ## Components
//!
//! - [`cache`]: two-tier storage, entry model, expiry and eviction
//! - [`quota`]: per-provider limit tables and the call ledger
//! - [`freshness`]: priority-aware refresh decisions
//! - [`governor`]: [`ContentGovernor`], which ties them together
//!
//! ## Fetching content
//!
//! ```no_run
//! use feedgate_cache::{ContentGovernor, FetchStatus, GovernorConfig, Priority};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let governor = ContentGovernor::in_memory(GovernorConfig::from_env()?)?;
//!
//!     let response = governor
//!         .fetch_content("news_top", Priority::High, "gnews", || async {
//!             // Call the provider here
//!             Ok::<_, String>(vec!["headline".to_string()])
//!         })
//!         .await;
//!
//!     match response.status {
//!         FetchStatus::Hit | FetchStatus::Miss => println!("fresh: {:?}", response.data),
//!         FetchStatus::Stale => println!("stale: {:?}", response.data),
//!         FetchStatus::Empty => println!("nothing available"),
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Degradation
//!
//! `fetch_content` never returns an error. Exhausted quota or a failing
//! provider results in the last cached value with [`FetchStatus::Stale`], or
//! [`FetchStatus::Empty`] when nothing was ever cached.

pub mod cache;
pub mod clock;
pub mod config;
pub mod error;
pub mod freshness;
pub mod governor;
pub mod quota;

// Re-export commonly used types
pub use cache::{
    CacheEntry, CacheKey, CacheStats, CleanupReport, FileSessionStore, MemorySessionStore, Priority, SessionStore,
    Tier, TieredStore,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{GovernorConfig, GovernorConfigBuilder};
pub use error::{CacheError, Result};
pub use freshness::{FreshnessPolicy, PriorityTtls};
pub use governor::{ContentGovernor, ContentResponse, FetchStatus};
pub use quota::{Environment, ProviderLimits, QuotaLedger, QuotaTables, QuotaUsage};
