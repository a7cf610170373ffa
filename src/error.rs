//! Error types shared across the ingestion pipeline.
//!
//! Defines error enums for the major subsystems:
//! - Configuration loading
//! - Archive fetching and the on-disk cache
//! - The columnar facts store
//! - The upstream REST client
//! - Rulepack loading
//!
//! Subsystems that own a database connection (control plane, consent,
//! queues) report `sqlx` failures through [`StoreError`], which classifies
//! backend SQLSTATE codes so callers can decide whether a retry is useful.

use thiserror::Error;

/// Errors raised while loading process configuration from the environment.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Errors raised by the archive fetcher, cache and line reader.
#[derive(Debug, Error)]
pub enum ArchiveError {
    /// Transport-level failure talking to the archive host.
    #[error("Archive request failed: {0}")]
    Http(String),

    /// The archive host answered with an unexpected status.
    #[error("Archive returned HTTP {status} for {hour}")]
    Status { status: u16, hour: String },

    /// Filesystem failure in the cache directory.
    #[error("Cache IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A cache sidecar could not be parsed.
    #[error("Cache sidecar error: {0}")]
    Sidecar(#[from] serde_json::Error),

    /// The operation was cancelled by its scope.
    #[error("Operation cancelled")]
    Cancelled,
}

/// Errors raised by the columnar facts store.
#[derive(Debug, Error)]
pub enum FactsError {
    /// Transport-level failure talking to the store.
    #[error("Facts store request failed: {0}")]
    Http(String),

    /// The store answered with a non-success status.
    #[error("Facts store returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    /// A response row could not be decoded.
    #[error("Facts store response decode failed: {0}")]
    Decode(#[from] serde_json::Error),

    /// Retries exhausted without a successful write.
    #[error("Facts store insert failed after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: String },

    /// The operation was cancelled by its scope.
    #[error("Operation cancelled")]
    Cancelled,
}

impl FactsError {
    /// Whether a retry with backoff has a chance of succeeding.
    pub fn is_retryable(&self) -> bool {
        match self {
            FactsError::Http(_) => true,
            FactsError::Status { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

/// Errors raised by the upstream REST client.
#[derive(Debug, Error)]
pub enum GithubError {
    /// The resource is permanently gone (404/410/451). Callers tombstone it.
    #[error("Resource gone: HTTP {status} {reason}")]
    Gone { status: u16, reason: String },

    /// Rate limited; `reset_epoch` is the earliest epoch-second to retry at.
    #[error("Rate limited until epoch {reset_epoch}")]
    RateLimited { reset_epoch: i64 },

    /// Missing scope or bad credentials without rate-limit framing.
    #[error("Unauthorized: HTTP {status}")]
    Unauthorized { status: u16 },

    /// Transient upstream failure (5xx or transport error).
    #[error("Transient upstream error: {0}")]
    Transient(String),

    /// Retries exhausted without an answer.
    #[error("Retries exhausted after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: String },

    /// The response body could not be decoded.
    #[error("Response decode failed: {0}")]
    Decode(String),

    /// A status outside every handled class.
    #[error("Unexpected upstream status {status}: {body}")]
    Unexpected { status: u16, body: String },

    /// No usable token is configured.
    #[error("No API tokens configured")]
    NoTokens,

    /// The operation was cancelled by its scope.
    #[error("Operation cancelled")]
    Cancelled,
}

/// Errors raised while loading or compiling a rulepack.
#[derive(Debug, Error)]
pub enum RulepackError {
    /// The YAML bundle could not be parsed.
    #[error("Rulepack parse error: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// A template pattern failed to compile.
    #[error("Invalid template pattern '{pattern}': {message}")]
    InvalidPattern { pattern: String, message: String },

    /// The bundle is structurally invalid.
    #[error("Invalid rulepack: {0}")]
    Invalid(String),

    /// IO error while reading the bundle.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised by relational control-plane operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Connection to the database failed.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Query execution failed.
    #[error("Query failed: {0}")]
    Query(#[from] sqlx::Error),

    /// Record not found.
    #[error("Record not found: {0}")]
    NotFound(String),

    /// A record failed an application-level validation check.
    #[error("Validation failed for {field}: {message}")]
    Validation { field: String, message: String },
}

impl StoreError {
    /// Classifies the underlying backend error, when there is one.
    pub fn db_kind(&self) -> DbErrorKind {
        match self {
            StoreError::Query(e) => classify_db_error(e),
            StoreError::ConnectionFailed(_) => DbErrorKind::ConnectionNotReady,
            _ => DbErrorKind::Other,
        }
    }

    /// Whether a retry with backoff has a chance of succeeding.
    pub fn is_retryable(&self) -> bool {
        self.db_kind().is_retryable()
    }
}

/// Classification of backend database errors, derived from SQLSTATE codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbErrorKind {
    /// Unique constraint violation (23505).
    Unique,
    /// Foreign key violation (23503).
    ForeignKey,
    /// Check constraint violation (23514).
    Check,
    /// Serialization failure (40001).
    Serialization,
    /// Deadlock detected (40P01).
    Deadlock,
    /// Lock not available (55P03).
    LockNotAvailable,
    /// Connection-class failure (08xxx, 57P03).
    ConnectionNotReady,
    /// Anything else.
    Other,
}

impl DbErrorKind {
    /// Serialization failures, deadlocks and lock timeouts resolve on retry;
    /// connection failures usually do once the pool recovers.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            DbErrorKind::Serialization
                | DbErrorKind::Deadlock
                | DbErrorKind::LockNotAvailable
                | DbErrorKind::ConnectionNotReady
        )
    }
}

/// Maps a `sqlx` error onto a [`DbErrorKind`] using the SQLSTATE code.
pub fn classify_db_error(err: &sqlx::Error) -> DbErrorKind {
    let code = match err {
        sqlx::Error::Database(db) => match db.code() {
            Some(code) => code.into_owned(),
            None => return DbErrorKind::Other,
        },
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            return DbErrorKind::ConnectionNotReady;
        }
        _ => return DbErrorKind::Other,
    };

    match code.as_str() {
        "23505" => DbErrorKind::Unique,
        "23503" => DbErrorKind::ForeignKey,
        "23514" => DbErrorKind::Check,
        "40001" => DbErrorKind::Serialization,
        "40P01" => DbErrorKind::Deadlock,
        "55P03" => DbErrorKind::LockNotAvailable,
        "57P03" => DbErrorKind::ConnectionNotReady,
        other if other.starts_with("08") => DbErrorKind::ConnectionNotReady,
        _ => DbErrorKind::Other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_kinds() {
        assert!(DbErrorKind::Serialization.is_retryable());
        assert!(DbErrorKind::Deadlock.is_retryable());
        assert!(DbErrorKind::LockNotAvailable.is_retryable());
        assert!(DbErrorKind::ConnectionNotReady.is_retryable());
        assert!(!DbErrorKind::Unique.is_retryable());
        assert!(!DbErrorKind::Check.is_retryable());
        assert!(!DbErrorKind::Other.is_retryable());
    }

    #[test]
    fn facts_retryability() {
        assert!(FactsError::Http("reset by peer".into()).is_retryable());
        assert!(FactsError::Status {
            status: 503,
            body: "busy".into()
        }
        .is_retryable());
        assert!(!FactsError::Status {
            status: 400,
            body: "bad query".into()
        }
        .is_retryable());
        assert!(!FactsError::Cancelled.is_retryable());
    }

    #[test]
    fn pool_errors_classify_as_connection() {
        assert_eq!(
            classify_db_error(&sqlx::Error::PoolTimedOut),
            DbErrorKind::ConnectionNotReady
        );
    }
}
