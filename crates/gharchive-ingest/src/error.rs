//! Error types for archive ingestion
//!
//! Crate-level failures (configuration, store construction, drivers) use
//! [`IngestError`]. The per-unit pipeline uses narrower types so the engine
//! can branch on them: [`FetchError`] for one download attempt,
//! [`SourceError`] for the decompressing line reader, [`InsertError`] for the
//! primary store's per-record classification and [`StoreError`] for every
//! other store call.

use thiserror::Error;

/// Result type alias for ingestion operations
pub type Result<T> = std::result::Result<T, IngestError>;

/// Crate-level error type
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid unit: {0}")]
    InvalidUnit(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl IngestError {
    pub fn config(msg: impl Into<String>) -> Self {
        IngestError::Config(msg.into())
    }
}

/// Failure of a single archive download attempt
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("{url} answered with status {status}")]
    Status { url: String, status: u16 },

    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("writing {path} failed: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl FetchError {
    /// Connection failures, throttling and server errors are worth another attempt
    pub fn is_retryable(&self) -> bool {
        match self {
            FetchError::Status { status, .. } => *status == 429 || *status >= 500,
            FetchError::Transport { .. } => true,
            FetchError::Write { .. } => false,
        }
    }
}

/// Failure while reading lines out of a compressed unit
#[derive(Error, Debug)]
pub enum SourceError {
    /// The gzip stream ended early or is corrupt; the cache copy has been purged.
    #[error("compressed archive {path} is truncated or corrupt: {source}")]
    Truncated {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("reading {path} failed: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Outcome classification of a failed primary insert
#[derive(Error, Debug)]
pub enum InsertError {
    #[error("record of {size} bytes exceeds the {limit} byte document limit")]
    TooLarge { size: usize, limit: usize },

    #[error("record rejected by the store: {0}")]
    WriteRejected(String),

    #[error("insert was not acknowledged by the store")]
    Unacknowledged,

    #[error("store failure: {0}")]
    Other(String),
}

impl InsertError {
    /// Whether the raw line should be diverted to the fallback store
    pub fn is_recoverable(&self) -> bool {
        matches!(self, InsertError::TooLarge { .. } | InsertError::WriteRejected(_))
    }
}

/// Backend failure of a store operation other than a primary insert
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("object storage error: {0}")]
    Object(String),

    #[error("store operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("store failure: {0}")]
    Other(String),
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_fetch_error_retryability() {
        let status = |status| FetchError::Status {
            url: "https://example.test/x.json.gz".to_string(),
            status,
        };
        assert!(status(500).is_retryable());
        assert!(status(503).is_retryable());
        assert!(status(429).is_retryable());
        assert!(!status(404).is_retryable());
        assert!(!status(403).is_retryable());
    }

    #[test]
    fn test_insert_error_recoverability() {
        assert!(InsertError::TooLarge { size: 20, limit: 10 }.is_recoverable());
        assert!(InsertError::WriteRejected("22P05".into()).is_recoverable());
        assert!(!InsertError::Unacknowledged.is_recoverable());
        assert!(!InsertError::Other("connection reset".into()).is_recoverable());
    }
}
