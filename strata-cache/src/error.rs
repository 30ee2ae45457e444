//! Error types for cache operations.

use thiserror::Error;

/// Result type for cache operations.
pub type CacheResult<T> = Result<T, CacheError>;

/// Errors that can occur during cache operations.
///
/// Most of these never reach callers of [`CacheManager`](crate::CacheManager):
/// remote faults degrade to misses and no-op writes. They surface from the
/// layer and remote-client seams, from configuration loading, and from
/// [`CacheManager::invalidate_pattern`](crate::CacheManager::invalidate_pattern).
#[derive(Error, Debug)]
pub enum CacheError {
    /// Value could not be encoded.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Stored bytes could not be decoded.
    #[error("deserialization error: {0}")]
    Deserialization(String),

    /// Remote store could not be reached.
    #[error("connection error: {0}")]
    Connection(String),

    /// Operation exceeded its deadline.
    #[error("operation timed out after {0}ms")]
    Timeout(u64),

    /// Key rejected by validation.
    #[error("invalid cache key {key:?}: {reason}")]
    InvalidKey {
        /// The offending key.
        key: String,
        /// Why it was rejected.
        reason: String,
    },

    /// Invalidation pattern rejected by validation.
    #[error("invalid key pattern {pattern:?}: {reason}")]
    InvalidPattern {
        /// The offending pattern.
        pattern: String,
        /// Why it was rejected.
        reason: String,
    },

    /// Remote tier is unavailable (circuit open or not connected).
    #[error("remote tier unavailable: {0}")]
    Unavailable(String),

    /// Key not present.
    #[error("key not found: {0}")]
    NotFound(String),

    /// Backend-specific failure.
    #[error("backend error: {0}")]
    Backend(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),
}

impl CacheError {
    /// Create a serialization error.
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization(message.into())
    }

    /// Create a deserialization error.
    pub fn deserialization(message: impl Into<String>) -> Self {
        Self::Deserialization(message.into())
    }

    /// Create a connection error.
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection(message.into())
    }

    /// Create a backend error.
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend(message.into())
    }

    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create an invalid key error.
    pub fn invalid_key(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidKey {
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// Create an invalid pattern error.
    pub fn invalid_pattern(pattern: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidPattern {
            pattern: pattern.into(),
            reason: reason.into(),
        }
    }

    /// Check if this is a connection-level error.
    pub fn is_connection_error(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::Unavailable(_))
    }

    /// Check if this is a timeout error.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_syntax() || err.is_eof() {
            Self::Deserialization(err.to_string())
        } else {
            Self::Serialization(err.to_string())
        }
    }
}

impl From<tokio::time::error::Elapsed> for CacheError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Self::Timeout(0)
    }
}

/// Error types that can express "the requested record does not exist".
///
/// [`remember`](crate::util::remember) uses this to decide whether a failed
/// computation should leave a negative-cache marker, and to rebuild the error
/// when a marker is found on a later call.
pub trait NotFound {
    /// Whether this error means the record is absent from the source of truth.
    fn is_not_found(&self) -> bool;

    /// Build the not-found error returned when a negative marker is hit.
    fn not_found(key: &str) -> Self;
}

impl NotFound for CacheError {
    fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    fn not_found(key: &str) -> Self {
        Self::NotFound(key.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CacheError::invalid_key("a\nb", "control character");
        assert_eq!(
            err.to_string(),
            "invalid cache key \"a\\nb\": control character"
        );
        assert_eq!(
            CacheError::Timeout(250).to_string(),
            "operation timed out after 250ms"
        );
    }

    #[test]
    fn test_error_predicates() {
        assert!(CacheError::connection("refused").is_connection_error());
        assert!(CacheError::Unavailable("open".into()).is_connection_error());
        assert!(!CacheError::config("bad").is_connection_error());
        assert!(CacheError::Timeout(10).is_timeout());
    }

    #[test]
    fn test_not_found_roundtrip() {
        let err = CacheError::not_found("cat:7");
        assert!(err.is_not_found());
        assert!(!CacheError::backend("boom").is_not_found());
    }

    #[test]
    fn test_from_json_error() {
        let err: CacheError = serde_json::from_str::<u32>("\"nope\"").unwrap_err().into();
        assert!(matches!(err, CacheError::Deserialization(_)));
    }
}
