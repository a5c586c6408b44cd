//! Cache entry model and its persisted envelope

use crate::cache::types::CacheKey;
use crate::clock::millis_to_datetime;
use crate::error::{CacheError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Largest TTL an entry can carry; longer TTLs are clamped on write and
/// rejected on read
pub const MAX_TTL_MS: u64 = i64::MAX as u64;

/// Whole milliseconds in `duration`, saturating at [`MAX_TTL_MS`]
pub fn ttl_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).map_or(MAX_TTL_MS, |ms| ms.min(MAX_TTL_MS))
}

/// `start + ttl_ms`, or `None` when the instant is past the last representable
/// timestamp (the entry never expires)
pub fn deadline_after(start: DateTime<Utc>, ttl_ms: u64) -> Option<DateTime<Utc>> {
    let ms = i64::try_from(ttl_ms).ok()?;
    start.checked_add_signed(chrono::Duration::milliseconds(ms))
}

/// Refresh priority class of a piece of content
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    #[default]
    Medium,
    Low,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::High => "high",
            Priority::Medium => "medium",
            Priority::Low => "low",
        }
    }

    /// Parse a priority, falling back to `Medium` for anything unrecognized
    pub fn parse_lenient(s: Option<&str>) -> Self {
        s.and_then(|s| s.parse().ok()).unwrap_or_default()
    }
}

impl FromStr for Priority {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "high" => Ok(Priority::High),
            "medium" => Ok(Priority::Medium),
            "low" => Ok(Priority::Low),
            other => Err(CacheError::ConfigError(format!("unknown priority: {}", other))),
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metadata recorded on orchestrated writes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryMetadata {
    /// Outbound calls spent producing this content over its lifetime
    pub api_calls_consumed: u32,

    /// When the content was last refreshed from its provider
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub last_refreshed: DateTime<Utc>,

    /// Provider-reported quality score in [0, 1]
    pub quality: f64,

    /// Priority class the content was written under
    #[serde(default)]
    pub priority: Priority,
}

impl EntryMetadata {
    pub fn new(priority: Priority, last_refreshed: DateTime<Utc>) -> Self {
        Self {
            api_calls_consumed: 0,
            last_refreshed,
            quality: 1.0,
            priority,
        }
    }

    pub fn with_quality(mut self, quality: f64) -> Self {
        self.quality = quality.clamp(0.0, 1.0);
        self
    }
}

/// A cached value with its write time and time-to-live
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    /// The cache key
    pub key: CacheKey,

    /// The cached payload
    pub value: serde_json::Value,

    /// Creation or last refresh time
    pub written_at: DateTime<Utc>,

    /// Time-to-live in milliseconds, always > 0
    pub ttl_ms: u64,

    /// Provenance tag (which subsystem wrote the entry)
    pub source: String,

    /// Optional orchestration metadata
    pub metadata: Option<EntryMetadata>,
}

impl CacheEntry {
    /// Create a new entry; the TTL is clamped to `1..=MAX_TTL_MS` milliseconds
    pub fn new(
        key: impl Into<CacheKey>,
        value: serde_json::Value,
        written_at: DateTime<Utc>,
        ttl: Duration,
    ) -> Self {
        Self {
            key: key.into(),
            value,
            written_at,
            ttl_ms: ttl_millis(ttl).max(1),
            source: "manual".to_string(),
            metadata: None,
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    pub fn with_metadata(mut self, metadata: EntryMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    /// The instant after which the entry is expired; `None` if it lies
    /// beyond the calendar
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        deadline_after(self.written_at, self.ttl_ms)
    }

    /// Age of the entry at `now`; zero if `now` precedes the write
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.written_at)
            .to_std()
            .unwrap_or(Duration::from_secs(0))
    }

    /// Priority recorded at write time, if any
    pub fn priority(&self) -> Option<Priority> {
        self.metadata.as_ref().map(|m| m.priority)
    }

    /// Serialize into the persisted JSON envelope
    pub fn to_record(&self) -> Result<String> {
        let envelope = StoredEnvelope {
            data: self.value.clone(),
            timestamp: self.written_at.timestamp_millis(),
            ttl: self.ttl_ms,
            source: Some(self.source.clone()),
            metadata: self.metadata.clone(),
        };
        Ok(serde_json::to_string(&envelope)?)
    }

    /// Parse a persisted envelope, validating its shape
    pub fn from_record(key: &str, record: &str) -> Result<Self> {
        let envelope: StoredEnvelope =
            serde_json::from_str(record).map_err(|e| CacheError::Deserialization {
                key: key.to_string(),
                reason: e.to_string(),
            })?;

        if envelope.ttl == 0 || envelope.ttl > MAX_TTL_MS {
            return Err(CacheError::Deserialization {
                key: key.to_string(),
                reason: format!("ttl {} outside 1..={}", envelope.ttl, MAX_TTL_MS),
            });
        }

        Ok(Self {
            key: key.to_string(),
            value: envelope.data,
            written_at: millis_to_datetime(envelope.timestamp),
            ttl_ms: envelope.ttl,
            source: envelope.source.unwrap_or_default(),
            metadata: envelope.metadata,
        })
    }

    /// Approximate footprint: key plus serialized envelope
    pub fn calculate_size(&self) -> usize {
        self.key.len() + self.to_record().map(|r| r.len()).unwrap_or(0)
    }
}

/// On-disk/session representation: `{data, timestamp, ttl}` plus optional extras
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredEnvelope {
    pub data: serde_json::Value,
    pub timestamp: i64,
    pub ttl: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<EntryMetadata>,
}
