// Error types for certshard
//
// One structured error enum for the whole crate, using thiserror for
// exhaustive matching at the supervisor level.

use std::io;
use std::time::Duration;
use thiserror::Error;

/// Main error type for certshard operations
#[derive(Debug, Error)]
pub enum IngestError {
    /// Invalid configuration or parameters
    #[error("Invalid configuration: {message}")]
    ConfigError { message: String },

    /// Remote cache operation failed
    #[error("Cache error: {message}")]
    CacheError { message: String },

    /// The remote cache reported an out-of-memory condition. Retrying would
    /// silently lose set membership, so callers must treat this as fatal.
    #[error("Cache out of memory inserting {member} into {key}")]
    CacheOutOfMemory { key: String, member: String },

    /// Storage backend operation failed
    #[error("Backend error: {message}")]
    BackendError { message: String },

    /// A document was not found in the storage backend
    #[error("Not found: {id}")]
    NotFound { id: String },

    /// Per-request deadline exceeded on a backend query; streams retry the
    /// same offset on this kind.
    #[error("Backend deadline exceeded at offset {offset}")]
    DeadlineExceeded { offset: usize },

    /// HTTP response with an unexpected status
    #[error("HTTP error (status {status}): {details}")]
    HttpError { status: u16, details: String },

    /// Parsing error for certificates, leaves, and identifiers
    #[error("Parse error: {message}")]
    ParseError { message: String },

    /// Operation timed out
    #[error("Operation timed out after {duration:?}")]
    Timeout { duration: Duration },

    /// The log worker was asked to shut down
    #[error("Shutdown requested")]
    Shutdown,

    /// Reqwest HTTP client errors
    #[error("HTTP request failed: {0}")]
    RequestError(#[from] reqwest::Error),

    /// Redis client errors
    #[error("Redis error: {0}")]
    RedisError(#[from] redis::RedisError),

    /// URL parsing errors
    #[error("Invalid URL: {0}")]
    UrlParseError(#[from] url::ParseError),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// PEM parsing errors
    #[error("PEM error: {0}")]
    PemError(#[from] pem::PemError),

    /// Generic I/O error
    #[error("I/O error: {source}")]
    IoError {
        #[from]
        source: io::Error,
    },

    /// Generic error with context
    #[error("{0}")]
    Other(String),
}

impl IngestError {
    /// Whether this error must take the whole process down rather than be
    /// retried (see the cache policy contract).
    pub fn is_fatal(&self) -> bool {
        matches!(self, IngestError::CacheOutOfMemory { .. })
    }

    pub fn parse(message: impl Into<String>) -> Self {
        IngestError::ParseError { message: message.into() }
    }

    pub fn backend(message: impl Into<String>) -> Self {
        IngestError::BackendError { message: message.into() }
    }

    pub fn config(message: impl Into<String>) -> Self {
        IngestError::ConfigError { message: message.into() }
    }
}

impl From<tokio::time::error::Elapsed> for IngestError {
    fn from(_err: tokio::time::error::Elapsed) -> Self {
        IngestError::Timeout { duration: Duration::from_secs(0) }
    }
}

impl From<tokio::task::JoinError> for IngestError {
    fn from(err: tokio::task::JoinError) -> Self {
        IngestError::Other(format!("Task join error: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_oom_is_fatal() {
        let err = IngestError::CacheOutOfMemory {
            key: "serials::2026-01-01::abc".to_string(),
            member: "AQID".to_string(),
        };
        assert!(err.is_fatal());
        assert!(err.to_string().contains("serials::2026-01-01::abc"));
    }

    #[test]
    fn test_deadline_exceeded_not_fatal() {
        let err = IngestError::DeadlineExceeded { offset: 4096 };
        assert!(!err.is_fatal());
        assert!(err.to_string().contains("4096"));
    }

    #[test]
    fn test_error_conversion_from_io() {
        let io_err = io::Error::new(io::ErrorKind::ConnectionRefused, "refused");
        let err: IngestError = io_err.into();
        assert!(matches!(err, IngestError::IoError { .. }));
    }
}
