//! Per-provider call counters with lazily rolled hourly and daily windows
//!
//! Counters are mirrored to the persistent tier under the quota prefix after
//! every change, so a restarted process resumes where the last one stopped.
//! There is no background timer: a window is rolled the next time its counter
//! is read after the window has run out.

use crate::cache::session::SessionStore;
use crate::clock::{millis_to_datetime, Clock};
use crate::config::serde_millis;
use crate::quota::limits::{Environment, ProviderLimits, QuotaTables};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Length of the hourly window in milliseconds
pub const HOUR_MS: i64 = 3_600_000;

/// Length of the daily window in milliseconds
pub const DAY_MS: i64 = 86_400_000;

/// One counting window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Window {
    /// Epoch milliseconds at which the window began
    pub window_start: i64,
    pub count: u32,
}

impl Window {
    fn starting_at(now_ms: i64) -> Self {
        Self {
            window_start: now_ms,
            count: 0,
        }
    }

    /// Reset when `now - window_start > duration`; returns whether it rolled
    fn roll(&mut self, now_ms: i64, duration_ms: i64) -> bool {
        if now_ms - self.window_start > duration_ms {
            *self = Self::starting_at(now_ms);
            true
        } else {
            false
        }
    }
}

/// Persisted call counter for one provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaCounter {
    pub provider: String,
    pub hourly: Window,
    pub daily: Window,

    /// Epoch milliseconds of the most recent attempt
    #[serde(default)]
    pub last_call_at: Option<i64>,

    #[serde(default)]
    pub total_calls: u64,

    #[serde(default)]
    pub total_response_bytes: u64,

    #[serde(default)]
    pub last_status: Option<u16>,
}

impl QuotaCounter {
    pub fn new(provider: impl Into<String>, now_ms: i64) -> Self {
        Self {
            provider: provider.into(),
            hourly: Window::starting_at(now_ms),
            daily: Window::starting_at(now_ms),
            last_call_at: None,
            total_calls: 0,
            total_response_bytes: 0,
            last_status: None,
        }
    }

    /// Roll both windows independently; returns whether either changed
    pub fn roll(&mut self, now_ms: i64) -> bool {
        let hourly = self.hourly.roll(now_ms, HOUR_MS);
        let daily = self.daily.roll(now_ms, DAY_MS);
        hourly || daily
    }

    /// Both windows have headroom and the cooldown has elapsed
    pub fn allows(&self, limits: &ProviderLimits, now_ms: i64) -> bool {
        self.hourly.count < limits.hourly_limit
            && self.daily.count < limits.daily_limit
            && self.cooldown_remaining(limits, now_ms).is_zero()
    }

    pub fn cooldown_remaining(&self, limits: &ProviderLimits, now_ms: i64) -> Duration {
        match self.last_call_at {
            Some(last) => {
                let elapsed = (now_ms - last).max(0) as u64;
                Duration::from_millis(limits.cooldown_ms.saturating_sub(elapsed))
            }
            None => Duration::ZERO,
        }
    }
}

/// Snapshot of a provider's quota position
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaUsage {
    pub provider: String,
    pub environment: Environment,
    pub limits: ProviderLimits,
    pub hourly_count: u32,
    pub daily_count: u32,
    pub hourly_remaining: u32,
    pub daily_remaining: u32,
    #[serde(rename = "cooldownRemainingMs", with = "serde_millis")]
    pub cooldown_remaining: Duration,
    pub total_calls: u64,
    pub total_response_bytes: u64,
    pub last_call_at: Option<DateTime<Utc>>,
    pub last_status: Option<u16>,
}

impl QuotaUsage {
    /// Whether a call would be allowed right now
    pub fn available(&self) -> bool {
        self.hourly_remaining > 0 && self.daily_remaining > 0 && self.cooldown_remaining.is_zero()
    }
}

impl fmt::Display for QuotaUsage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.limits.is_unlimited() {
            return write!(
                f,
                "{} ({}): unlimited, {} calls recorded",
                self.provider, self.environment, self.total_calls
            );
        }

        write!(
            f,
            "{} ({}): hourly {}/{}, daily {}/{}",
            self.provider,
            self.environment,
            self.hourly_count,
            self.limits.hourly_limit,
            self.daily_count,
            self.limits.daily_limit
        )?;
        if !self.cooldown_remaining.is_zero() {
            write!(f, ", cooling down {}s", self.cooldown_remaining.as_secs())?;
        }
        Ok(())
    }
}

/// Gates outbound calls per provider against hourly, daily and cooldown limits
pub struct QuotaLedger {
    tables: QuotaTables,
    environment: Environment,
    session: Arc<dyn SessionStore>,
    clock: Arc<dyn Clock>,
    prefix: String,

    /// Authoritative counters for providers seen by this process
    counters: RwLock<HashMap<String, QuotaCounter>>,
}

impl QuotaLedger {
    pub fn new(
        tables: QuotaTables,
        environment: Environment,
        session: Arc<dyn SessionStore>,
        clock: Arc<dyn Clock>,
        prefix: impl Into<String>,
    ) -> Self {
        let prefix = prefix.into();
        info!(environment = %environment, prefix = %prefix, "Initializing quota ledger");

        Self {
            tables,
            environment,
            session,
            clock,
            prefix,
            counters: RwLock::new(HashMap::new()),
        }
    }

    pub fn environment(&self) -> Environment {
        self.environment
    }

    /// Limits for `provider` in the active environment; unknown → unlimited
    pub fn get_limits(&self, provider: &str) -> ProviderLimits {
        self.tables.limits_for(self.environment, provider)
    }

    /// Decide whether a call may be issued now
    ///
    /// Rolls expired windows and persists the rolled counter. Exhaustion is a
    /// normal `false`, never an error.
    pub async fn can_call(&self, provider: &str) -> bool {
        let limits = self.get_limits(provider);
        let now = self.now_ms();

        let mut counters = self.counters.write().await;
        let counter = counters
            .entry(provider.to_string())
            .or_insert_with(|| self.load_counter(provider, now));

        if counter.roll(now) {
            debug!(provider = %provider, "Quota window rolled");
            self.persist(counter);
        }

        let allowed = counter.allows(&limits, now);
        if !allowed {
            debug!(
                provider = %provider,
                hourly = counter.hourly.count,
                daily = counter.daily.count,
                "Quota exhausted"
            );
        }
        allowed
    }

    /// Same decision as [`can_call`](Self::can_call) without touching state
    pub async fn peek(&self, provider: &str) -> bool {
        let limits = self.get_limits(provider);
        let now = self.now_ms();
        let counter = self.snapshot(provider, now).await;
        counter.allows(&limits, now)
    }

    /// Record an attempted call, whatever its outcome
    pub async fn record_call(&self, provider: &str, response_size_bytes: Option<u64>, status_code: Option<u16>) {
        let now = self.now_ms();

        let mut counters = self.counters.write().await;
        let counter = counters
            .entry(provider.to_string())
            .or_insert_with(|| self.load_counter(provider, now));

        counter.roll(now);
        counter.hourly.count = counter.hourly.count.saturating_add(1);
        counter.daily.count = counter.daily.count.saturating_add(1);
        counter.last_call_at = Some(now);
        counter.total_calls += 1;
        if let Some(bytes) = response_size_bytes {
            counter.total_response_bytes += bytes;
        }
        if status_code.is_some() {
            counter.last_status = status_code;
        }

        debug!(
            provider = %provider,
            hourly = counter.hourly.count,
            daily = counter.daily.count,
            "Recorded API call"
        );
        self.persist(counter);
    }

    /// Rolled view of a provider's counters and remaining headroom
    pub async fn usage(&self, provider: &str) -> QuotaUsage {
        let limits = self.get_limits(provider);
        let now = self.now_ms();
        let counter = self.snapshot(provider, now).await;

        QuotaUsage {
            provider: provider.to_string(),
            environment: self.environment,
            limits,
            hourly_count: counter.hourly.count,
            daily_count: counter.daily.count,
            hourly_remaining: limits.hourly_limit.saturating_sub(counter.hourly.count),
            daily_remaining: limits.daily_limit.saturating_sub(counter.daily.count),
            cooldown_remaining: counter.cooldown_remaining(&limits, now),
            total_calls: counter.total_calls,
            total_response_bytes: counter.total_response_bytes,
            last_call_at: counter.last_call_at.map(millis_to_datetime),
            last_status: counter.last_status,
        }
    }

    /// Current counter for a provider (windows rolled, nothing persisted)
    pub async fn counter(&self, provider: &str) -> QuotaCounter {
        self.snapshot(provider, self.now_ms()).await
    }

    /// Forget all counts for a provider
    pub async fn reset(&self, provider: &str) {
        self.counters.write().await.remove(provider);

        if let Err(e) = self.session.remove_item(&self.counter_key(provider)) {
            warn!(provider = %provider, error = %e, "Failed to remove persisted quota counter");
        }
        info!(provider = %provider, "Quota counters reset");
    }

    /// Providers with configured limits or recorded calls, sorted
    pub async fn providers(&self) -> Vec<String> {
        let mut providers: BTreeSet<String> = self.tables.table(self.environment).keys().cloned().collect();
        providers.extend(self.counters.read().await.keys().cloned());

        if let Ok(keys) = self.session.keys() {
            providers.extend(
                keys.iter()
                    .filter_map(|k| k.strip_prefix(&self.prefix))
                    .map(str::to_string),
            );
        }

        providers.into_iter().collect()
    }

    async fn snapshot(&self, provider: &str, now: i64) -> QuotaCounter {
        let cached = self.counters.read().await.get(provider).cloned();
        let mut counter = cached.unwrap_or_else(|| self.load_counter(provider, now));
        counter.roll(now);
        counter
    }

    fn counter_key(&self, provider: &str) -> String {
        format!("{}{}", self.prefix, provider)
    }

    /// Read a persisted counter; missing or unreadable state starts fresh
    fn load_counter(&self, provider: &str, now: i64) -> QuotaCounter {
        let key = self.counter_key(provider);

        match self.session.get_item(&key) {
            Ok(Some(record)) => match serde_json::from_str::<QuotaCounter>(&record) {
                Ok(counter) => counter,
                Err(e) => {
                    warn!(provider = %provider, error = %e, "Discarding corrupt quota counter");
                    if let Err(e) = self.session.remove_item(&key) {
                        debug!(provider = %provider, error = %e, "Failed to remove corrupt quota counter");
                    }
                    QuotaCounter::new(provider, now)
                }
            },
            Ok(None) => QuotaCounter::new(provider, now),
            Err(e) => {
                debug!(provider = %provider, error = %e, "Quota store unavailable, starting fresh counter");
                QuotaCounter::new(provider, now)
            }
        }
    }

    fn persist(&self, counter: &QuotaCounter) {
        let record = match serde_json::to_string(counter) {
            Ok(record) => record,
            Err(e) => {
                warn!(provider = %counter.provider, error = %e, "Failed to serialize quota counter");
                return;
            }
        };

        if let Err(e) = self.session.set_item(&self.counter_key(&counter.provider), &record) {
            warn!(
                provider = %counter.provider,
                error = %e,
                "Quota store unavailable, counter kept in memory only"
            );
        }
    }

    fn now_ms(&self) -> i64 {
        self.clock.now().timestamp_millis()
    }
}
