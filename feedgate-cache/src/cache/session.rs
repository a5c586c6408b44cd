//! Persistent-tier contract and an in-memory, quota-bounded implementation
//!
//! A [`SessionStore`] behaves like browser session storage: a flat string
//! key/value namespace shared with unrelated users, bounded by a byte quota,
//! that may refuse writes or be switched off entirely. Callers namespace their
//! keys with a prefix and must treat every error as recoverable.

use crate::error::{CacheError, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// Flat string key/value store backing the persistent tier
pub trait SessionStore: Send + Sync {
    /// Read a raw value
    fn get_item(&self, key: &str) -> Result<Option<String>>;

    /// Write a raw value, replacing any existing one
    fn set_item(&self, key: &str, value: &str) -> Result<()>;

    /// Delete a value; deleting a missing key is not an error
    fn remove_item(&self, key: &str) -> Result<()>;

    /// Every key currently stored, including keys owned by other users
    fn keys(&self) -> Result<Vec<String>>;

    /// Bytes in use (keys plus values)
    fn usage_bytes(&self) -> Result<usize>;
}

/// Session store held in process memory with a hard byte quota
///
/// Mirrors the failure modes of browser storage: a write that would exceed
/// the quota is refused, and the store can be marked unavailable.
#[derive(Debug)]
pub struct MemorySessionStore {
    items: Mutex<HashMap<String, String>>,
    quota_bytes: usize,
    available: AtomicBool,
}

impl MemorySessionStore {
    /// Default quota, matching the common 5 MB browser session-storage limit
    pub const DEFAULT_QUOTA_BYTES: usize = 5 * 1024 * 1024;

    pub fn new() -> Self {
        Self::with_quota(Self::DEFAULT_QUOTA_BYTES)
    }

    pub fn with_quota(quota_bytes: usize) -> Self {
        Self {
            items: Mutex::new(HashMap::new()),
            quota_bytes,
            available: AtomicBool::new(true),
        }
    }

    /// Simulate storage being disabled (private mode, policy) or restored
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn quota_bytes(&self) -> usize {
        self.quota_bytes
    }

    fn ensure_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(CacheError::StorageUnavailable("session storage is disabled".to_string()))
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, String>>> {
        self.items
            .lock()
            .map_err(|_| CacheError::StorageUnavailable("session storage lock poisoned".to_string()))
    }
}

impl Default for MemorySessionStore {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) fn map_usage(items: &HashMap<String, String>) -> usize {
    items.iter().map(|(k, v)| k.len() + v.len()).sum()
}

impl SessionStore for MemorySessionStore {
    fn get_item(&self, key: &str) -> Result<Option<String>> {
        self.ensure_available()?;
        Ok(self.lock()?.get(key).cloned())
    }

    fn set_item(&self, key: &str, value: &str) -> Result<()> {
        self.ensure_available()?;
        let mut items = self.lock()?;

        let replaced = items.get(key).map(|v| key.len() + v.len()).unwrap_or(0);
        let projected = map_usage(&items) - replaced + key.len() + value.len();
        if projected > self.quota_bytes {
            return Err(CacheError::StorageUnavailable(format!(
                "quota exceeded: {} of {} bytes",
                projected, self.quota_bytes
            )));
        }

        items.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove_item(&self, key: &str) -> Result<()> {
        self.ensure_available()?;
        self.lock()?.remove(key);
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>> {
        self.ensure_available()?;
        Ok(self.lock()?.keys().cloned().collect())
    }

    fn usage_bytes(&self) -> Result<usize> {
        self.ensure_available()?;
        let items = self.lock()?;
        Ok(map_usage(&items))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_get_remove() {
        let store = MemorySessionStore::new();
        store.set_item("a", "1").unwrap();
        assert_eq!(store.get_item("a").unwrap(), Some("1".to_string()));

        store.remove_item("a").unwrap();
        assert_eq!(store.get_item("a").unwrap(), None);

        // Removing again is fine
        store.remove_item("a").unwrap();
    }

    #[test]
    fn test_quota_is_enforced() {
        let store = MemorySessionStore::with_quota(10);
        store.set_item("k", "12345").unwrap();
        assert_eq!(store.usage_bytes().unwrap(), 6);

        let err = store.set_item("k2", "123456789").unwrap_err();
        assert!(matches!(err, CacheError::StorageUnavailable(_)));

        // Replacing an existing value only counts the difference
        store.set_item("k", "123456789").unwrap();
        assert_eq!(store.usage_bytes().unwrap(), 10);
    }

    #[test]
    fn test_unavailable_store_fails_soft() {
        let store = MemorySessionStore::new();
        store.set_item("a", "1").unwrap();
        store.set_available(false);

        assert!(store.get_item("a").is_err());
        assert!(store.set_item("b", "2").is_err());
        assert!(store.keys().is_err());

        store.set_available(true);
        assert_eq!(store.get_item("a").unwrap(), Some("1".to_string()));
    }
}
