//! Error types for the tally metric repository.

use std::path::PathBuf;
use std::time::Duration;

use rusqlite::ErrorCode;
use thiserror::Error;

use crate::metric::{MetricKey, MetricKind};

/// The main error type for all tally operations.
///
/// `NotFound` and `AlreadyExists` are part of the repository contract and are
/// matched on by the update services. Every other variant is propagated to
/// the caller unmodified.
#[derive(Error, Debug)]
pub enum TallyError {
    /// No metric is stored under the requested key.
    #[error("metric {key} not found")]
    NotFound {
        /// The key that was looked up.
        key: MetricKey,
    },

    /// A metric is already stored under the key being created.
    #[error("metric {key} already exists")]
    AlreadyExists {
        /// The conflicting key.
        key: MetricKey,
    },

    /// A metric or request failed validation.
    #[error("invalid metric: {0}")]
    Metric(#[from] MetricError),

    /// Error reading or writing the snapshot file.
    #[error("snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),

    /// Error talking to the relational backend.
    #[error("database error: {0}")]
    Database(#[from] DatabaseError),

    /// Error loading or validating storage configuration.
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
}

impl TallyError {
    /// Returns `true` for the not-found condition.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Returns `true` for the already-exists condition.
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists { .. })
    }

    /// Returns `true` when the error means the database connection itself
    /// failed (could not open, busy, locked, I/O), as opposed to a query or
    /// constraint failure.
    ///
    /// Only these errors are retried by [`crate::retry::RetryPolicy`].
    pub fn is_connection_exception(&self) -> bool {
        match self {
            Self::Database(DatabaseError::Query { source, .. }) => {
                is_connection_failure(source)
            }
            _ => false,
        }
    }
}

/// Classifies a raw SQLite error as a connection failure.
pub(crate) fn is_connection_failure(err: &rusqlite::Error) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(e, _) => matches!(
            e.code,
            ErrorCode::CannotOpen
                | ErrorCode::DatabaseBusy
                | ErrorCode::DatabaseLocked
                | ErrorCode::SystemIoFailure
                | ErrorCode::FileLockingProtocolFailed
        ),
        _ => false,
    }
}

/// Errors produced while validating or merging metric requests.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MetricError {
    /// The metric id is empty.
    #[error("metric id cannot be empty")]
    EmptyId,

    /// The request carries the field belonging to the other kind.
    #[error("{kind} metric '{id}' cannot carry a {field}")]
    MismatchedField {
        /// The metric kind.
        kind: MetricKind,
        /// The metric id.
        id: String,
        /// The field that must be absent (`value` or `delta`).
        field: &'static str,
    },

    /// A write that requires a value or delta did not carry one.
    #[error("{kind} metric '{id}' is missing its {field}")]
    MissingField {
        /// The metric kind.
        kind: MetricKind,
        /// The metric id.
        id: String,
        /// The field that must be present (`value` or `delta`).
        field: &'static str,
    },

    /// Gauge value is NaN or infinite.
    #[error("gauge '{id}' has non-finite value {value}")]
    NonFiniteValue {
        /// The metric id.
        id: String,
        /// The rejected value.
        value: f64,
    },

    /// Accumulating a counter would overflow `i64`.
    #[error("counter '{id}' overflowed adding {delta} to {current}")]
    CounterOverflow {
        /// The metric id.
        id: String,
        /// The currently accumulated delta.
        current: i64,
        /// The delta being added.
        delta: i64,
    },

    /// Unrecognized metric kind name.
    #[error("unknown metric kind '{0}' (expected 'gauge' or 'counter')")]
    UnknownKind(String),

    /// A textual value could not be parsed for the given kind.
    #[error("cannot parse '{raw}' as a {kind} value")]
    InvalidValue {
        /// The metric kind the value was parsed for.
        kind: MetricKind,
        /// The raw text.
        raw: String,
    },
}

/// Errors that can occur reading or writing the snapshot file.
#[derive(Error, Debug)]
pub enum SnapshotError {
    /// Failed to read the snapshot file.
    #[error("failed to read snapshot '{}': {source}", path.display())]
    Read {
        /// The snapshot path.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Failed to write or replace the snapshot file.
    #[error("failed to write snapshot '{}': {source}", path.display())]
    Write {
        /// The snapshot path.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The snapshot file is not a valid metric array.
    #[error("malformed snapshot '{}': {source}", path.display())]
    Parse {
        /// The snapshot path.
        path: PathBuf,
        /// The underlying JSON error.
        #[source]
        source: serde_json::Error,
    },

    /// Failed to serialize records for the snapshot.
    #[error("failed to serialize snapshot: {source}")]
    Serialize {
        /// The underlying JSON error.
        #[source]
        source: serde_json::Error,
    },

    /// The background flusher thread could not be started.
    #[error("failed to start snapshot flusher: {source}")]
    SpawnFlusher {
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

/// Errors from the SQLite backend.
#[derive(Error, Debug)]
pub enum DatabaseError {
    /// A statement or connection attempt failed.
    #[error("{operation}{} failed: {source}", key.as_ref().map(|k| format!(" {k}")).unwrap_or_default())]
    Query {
        /// The repository operation being executed.
        operation: &'static str,
        /// The metric key involved, if any.
        key: Option<MetricKey>,
        /// The underlying SQLite error.
        #[source]
        source: rusqlite::Error,
    },

    /// Schema migration failed when opening the database.
    #[error("migration failed: {source}")]
    Migration {
        /// The underlying SQLite error.
        #[source]
        source: rusqlite::Error,
    },

    /// The connectivity check did not finish within its timeout.
    #[error("ping timed out after {timeout:?}")]
    PingTimeout {
        /// The configured ping timeout.
        timeout: Duration,
    },
}

impl DatabaseError {
    /// Wraps a SQLite error with the operation that produced it.
    pub(crate) fn query(operation: &'static str, source: rusqlite::Error) -> Self {
        Self::Query {
            operation,
            key: None,
            source,
        }
    }

    /// Wraps a SQLite error with the operation and the key involved.
    pub(crate) fn keyed(operation: &'static str, key: &MetricKey, source: rusqlite::Error) -> Self {
        Self::Query {
            operation,
            key: Some(key.clone()),
            source,
        }
    }
}

/// Errors loading or validating storage configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("failed to read config '{}': {source}", path.display())]
    Read {
        /// The config path.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The configuration is not valid JSON for [`crate::config::StorageConfig`].
    #[error("failed to parse config: {source}")]
    Parse {
        /// The underlying JSON error.
        #[source]
        source: serde_json::Error,
    },

    /// A configuration value is out of range.
    #[error("invalid configuration: {reason}")]
    Invalid {
        /// Description of what is invalid.
        reason: String,
    },
}

/// Type alias for `Result<T, TallyError>`.
pub type Result<T> = std::result::Result<T, TallyError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn sqlite_failure(code: std::os::raw::c_int) -> rusqlite::Error {
        rusqlite::Error::SqliteFailure(rusqlite::ffi::Error::new(code), None)
    }

    fn query_error(source: rusqlite::Error) -> TallyError {
        DatabaseError::query("find", source).into()
    }

    #[test]
    fn test_connection_failures_are_classified() {
        for code in [
            rusqlite::ffi::SQLITE_CANTOPEN,
            rusqlite::ffi::SQLITE_BUSY,
            rusqlite::ffi::SQLITE_LOCKED,
            rusqlite::ffi::SQLITE_IOERR,
        ] {
            assert!(query_error(sqlite_failure(code)).is_connection_exception(), "code {code}");
        }
    }

    #[test]
    fn test_logical_failures_are_not_retryable() {
        assert!(!query_error(sqlite_failure(rusqlite::ffi::SQLITE_CONSTRAINT)).is_connection_exception());
        assert!(!query_error(rusqlite::Error::QueryReturnedNoRows).is_connection_exception());
        assert!(!TallyError::NotFound {
            key: MetricKey::new(MetricKind::Gauge, "cpu"),
        }
        .is_connection_exception());
    }

    #[test]
    fn test_query_error_display_includes_key() {
        let key = MetricKey::new(MetricKind::Counter, "hits");
        let err = DatabaseError::keyed("update", &key, rusqlite::Error::QueryReturnedNoRows);
        let text = err.to_string();
        assert!(text.starts_with("update counter/hits failed"), "{text}");
    }
}
