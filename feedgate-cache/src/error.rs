//! Error types for cache and quota operations
//!
//! Most failures in this crate are recovered locally (a broken persistent tier
//! degrades to memory-only operation, a corrupt record becomes a cache miss).
//! These variants surface where a caller can still act on them: configuration
//! loading, direct store writes, and persistent-tier implementations.

use thiserror::Error;

/// Main error type for feedgate-cache
#[derive(Error, Debug)]
pub enum CacheError {
    /// Persistent tier rejected a read or write (quota exceeded, disabled, I/O)
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    /// A stored record is not valid JSON or fails shape validation
    #[error("Corrupt record for key '{key}': {reason}")]
    Deserialization { key: String, reason: String },

    /// A value could not be serialized for storage
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Filesystem error from a file-backed session store
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error with context
    #[error("Error: {0}")]
    Other(String),
}

/// Result type alias for cache operations
pub type Result<T> = std::result::Result<T, CacheError>;

impl CacheError {
    /// Whether the error came from the persistent tier rather than the caller's data
    pub fn is_storage(&self) -> bool {
        matches!(self, CacheError::StorageUnavailable(_) | CacheError::Io(_))
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(e: serde_json::Error) -> Self {
        CacheError::Serialization(e.to_string())
    }
}

impl From<String> for CacheError {
    fn from(s: String) -> Self {
        CacheError::Other(s)
    }
}

impl From<&str> for CacheError {
    fn from(s: &str) -> Self {
        CacheError::Other(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = CacheError::StorageUnavailable("quota exceeded".to_string());
        assert_eq!(error.to_string(), "Storage unavailable: quota exceeded");

        let corrupt = CacheError::Deserialization {
            key: "news_x".to_string(),
            reason: "expected value".to_string(),
        };
        assert!(corrupt.to_string().contains("news_x"));
    }

    #[test]
    fn test_error_conversion() {
        let error: CacheError = "test error".into();
        assert!(matches!(error, CacheError::Other(_)));

        let error: CacheError = "test error".to_string().into();
        assert!(matches!(error, CacheError::Other(_)));

        let json_err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let error: CacheError = json_err.into();
        assert!(matches!(error, CacheError::Serialization(_)));
    }

    #[test]
    fn test_is_storage() {
        assert!(CacheError::StorageUnavailable("x".into()).is_storage());
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk");
        assert!(CacheError::Io(io).is_storage());
        assert!(!CacheError::ConfigError("x".into()).is_storage());
    }
}
