//! Quota Ledger: per-provider limits and call counters

pub mod ledger;
pub mod limits;

pub use ledger::{QuotaCounter, QuotaLedger, QuotaUsage, Window, DAY_MS, HOUR_MS};
pub use limits::{Environment, ProviderLimits, QuotaTables, ENVIRONMENT_VAR};
