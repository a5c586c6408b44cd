//! File-backed session store
//!
//! Keeps the whole namespace as one JSON object on disk so a maintenance
//! process can inspect and clean the same persistent tier across runs.

use crate::cache::session::{map_usage, SessionStore};
use crate::error::{CacheError, Result};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, warn};

/// Session store persisted as a single JSON document
#[derive(Debug)]
pub struct FileSessionStore {
    path: PathBuf,
    quota_bytes: usize,
    items: Mutex<HashMap<String, String>>,
}

impl FileSessionStore {
    /// Open (or lazily create) the store at `path`
    ///
    /// An unreadable or corrupt file is logged and replaced by an empty store
    /// on the next write.
    pub fn open(path: impl Into<PathBuf>, quota_bytes: usize) -> Result<Self> {
        let path = path.into();

        let items = if path.exists() {
            let content = fs::read_to_string(&path)?;
            match serde_json::from_str::<HashMap<String, String>>(&content) {
                Ok(items) => items,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Session file is corrupt, starting empty");
                    HashMap::new()
                }
            }
        } else {
            HashMap::new()
        };

        debug!(path = %path.display(), entries = items.len(), "Opened session file");

        Ok(Self {
            path,
            quota_bytes,
            items: Mutex::new(items),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, String>>> {
        self.items
            .lock()
            .map_err(|_| CacheError::StorageUnavailable("session file lock poisoned".to_string()))
    }

    /// Write the map next to the target and rename it into place
    fn flush(&self, items: &HashMap<String, String>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_string_pretty(items)?)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl SessionStore for FileSessionStore {
    fn get_item(&self, key: &str) -> Result<Option<String>> {
        Ok(self.lock()?.get(key).cloned())
    }

    fn set_item(&self, key: &str, value: &str) -> Result<()> {
        let mut items = self.lock()?;

        let replaced = items.get(key).map(|v| key.len() + v.len()).unwrap_or(0);
        let projected = map_usage(&items) - replaced + key.len() + value.len();
        if projected > self.quota_bytes {
            return Err(CacheError::StorageUnavailable(format!(
                "quota exceeded: {} of {} bytes",
                projected, self.quota_bytes
            )));
        }

        let previous = items.insert(key.to_string(), value.to_string());
        if let Err(e) = self.flush(&items) {
            // Keep memory and disk in agreement
            match previous {
                Some(old) => items.insert(key.to_string(), old),
                None => items.remove(key),
            };
            return Err(e);
        }
        Ok(())
    }

    fn remove_item(&self, key: &str) -> Result<()> {
        let mut items = self.lock()?;
        if items.remove(key).is_some() {
            self.flush(&items)?;
        }
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>> {
        Ok(self.lock()?.keys().cloned().collect())
    }

    fn usage_bytes(&self) -> Result<usize> {
        let items = self.lock()?;
        Ok(map_usage(&items))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_values_survive_reopen() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("session.json");

        {
            let store = FileSessionStore::open(&path, 1024).unwrap();
            store.set_item("feedgate_cache_a", "1").unwrap();
            store.set_item("other_app", "2").unwrap();
        }

        let store = FileSessionStore::open(&path, 1024).unwrap();
        assert_eq!(store.get_item("feedgate_cache_a").unwrap(), Some("1".to_string()));
        assert_eq!(store.keys().unwrap().len(), 2);
    }

    #[test]
    fn test_corrupt_file_starts_empty() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("session.json");
        fs::write(&path, "not json").unwrap();

        let store = FileSessionStore::open(&path, 1024).unwrap();
        assert!(store.keys().unwrap().is_empty());

        store.set_item("a", "1").unwrap();
        let reopened = FileSessionStore::open(&path, 1024).unwrap();
        assert_eq!(reopened.get_item("a").unwrap(), Some("1".to_string()));
    }

    #[test]
    fn test_quota_rejects_without_touching_disk() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("nested").join("session.json");

        let store = FileSessionStore::open(&path, 8).unwrap();
        assert!(store.set_item("key", "too long value").is_err());
        assert!(!path.exists());

        store.set_item("k", "v").unwrap();
        assert!(path.exists());
        assert_eq!(store.usage_bytes().unwrap(), 2);
    }
}
