//! Error types for Redis operations.

use strata_cache::CacheError;
use thiserror::Error;

/// Result type for Redis operations.
pub type RedisResult<T> = Result<T, RedisError>;

/// Errors that can occur during Redis operations.
#[derive(Error, Debug)]
pub enum RedisError {
    /// Driver error.
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Connection error.
    #[error("connection error: {0}")]
    Connection(String),

    /// Reply had an unexpected shape.
    #[error("unexpected reply: {0}")]
    Reply(String),
}

impl RedisError {
    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create a connection error.
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection(message.into())
    }

    /// Check if this is a connection error.
    pub fn is_connection_error(&self) -> bool {
        match self {
            Self::Connection(_) => true,
            Self::Redis(e) => e.is_io_error() || e.is_connection_refusal() || e.is_connection_dropped(),
            _ => false,
        }
    }

    /// Check if this is a timeout error.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Redis(e) if e.is_timeout())
    }
}

impl From<RedisError> for CacheError {
    fn from(err: RedisError) -> Self {
        if err.is_timeout() {
            return CacheError::Timeout(0);
        }
        if err.is_connection_error() {
            return CacheError::connection(err.to_string());
        }
        match err {
            RedisError::Config(msg) => CacheError::Config(msg),
            RedisError::Reply(msg) => CacheError::deserialization(msg),
            other => CacheError::backend(other.to_string()),
        }
    }
}
