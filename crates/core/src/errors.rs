//! Error types for the shelfsync core library.
//!
//! Each subsystem has its own error type derived with `thiserror`, and a
//! top-level [`CoreError`] enum unifies them all for callers that want a
//! single error type.

use thiserror::Error;

// ---------------------------------------------------------------------------
// Top-level error
// ---------------------------------------------------------------------------

/// Unified error type for the entire core library.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Status(#[from] StatusError),

    #[error(transparent)]
    Interval(#[from] IntervalError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
}

// ---------------------------------------------------------------------------
// Configuration errors
// ---------------------------------------------------------------------------

/// Errors from configuration loading and validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file not found.
    #[error("configuration file not found: {0}")]
    FileNotFound(String),

    /// TOML parse error.
    #[error("configuration parse error: {0}")]
    ParseError(String),

    /// A config value is invalid.
    #[error("invalid configuration value for '{field}': {detail}")]
    InvalidValue { field: String, detail: String },

    /// Generic I/O error reading the config file.
    #[error("configuration I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Database errors
// ---------------------------------------------------------------------------

/// Errors from the SQLite persistence layer.
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Underlying rusqlite error.
    #[error("database error: {0}")]
    SqliteError(#[from] rusqlite::Error),

    /// A migration failed.
    #[error("database migration failed (version {version}): {detail}")]
    MigrationFailed { version: u32, detail: String },

    /// A record was not found.
    #[error("{entity} not found: {id}")]
    NotFound { entity: String, id: String },

    /// Generic I/O error (e.g. file permissions).
    #[error("database I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Catalog errors
// ---------------------------------------------------------------------------

/// Errors surfaced by a [`CatalogStore`](crate::catalog::CatalogStore).
#[derive(Debug, Error)]
pub enum CatalogError {
    /// A uniqueness constraint rejected the write (same ISBN, same
    /// book + media type). The row already exists.
    #[error("catalog conflict: {0}")]
    Conflict(String),

    /// The record failed validation before reaching storage.
    #[error("invalid catalog record: {0}")]
    Invalid(String),

    /// Any other storage failure.
    #[error("catalog storage error: {0}")]
    Storage(#[from] DatabaseError),
}

impl From<rusqlite::Error> for CatalogError {
    fn from(err: rusqlite::Error) -> Self {
        match err {
            rusqlite::Error::SqliteFailure(ref code, ref msg)
                if code.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                CatalogError::Conflict(
                    msg.clone()
                        .unwrap_or_else(|| "constraint violation".to_string()),
                )
            }
            other => CatalogError::Storage(DatabaseError::SqliteError(other)),
        }
    }
}

// ---------------------------------------------------------------------------
// Provider errors
// ---------------------------------------------------------------------------

/// Errors from provider adapters. Any of these ends the current pass.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// The provider lacks the settings it needs to run.
    #[error("provider '{0}' is not configured")]
    NotConfigured(String),

    /// HTTP-level transport error (network, TLS, etc.).
    #[error("provider HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The upstream API returned a non-success status code.
    #[error("provider API error (HTTP {status}): {body}")]
    Api { status: u16, body: String },

    /// Opening or querying a file-based library failed.
    #[error("provider database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// A page-level response could not be decoded.
    #[error("provider response parse error: {0}")]
    Parse(String),

    /// Generic I/O wrapper.
    #[error("provider I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Status registry errors
// ---------------------------------------------------------------------------

/// Errors returned by the [`SyncStatusRegistry`](crate::status::SyncStatusRegistry).
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StatusError {
    /// A pass for this provider is already running.
    #[error("provider '{0}' is already syncing")]
    AlreadySyncing(String),

    /// The registry actor has shut down.
    #[error("sync status registry is not running")]
    RegistryUnavailable,
}

// ---------------------------------------------------------------------------
// Refresh interval errors
// ---------------------------------------------------------------------------

/// Errors from refresh interval validation.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum IntervalError {
    #[error("refresh interval must not be empty")]
    Empty,

    #[error("refresh interval must be a string, got {0}")]
    NotAString(String),

    #[error("invalid refresh interval '{0}': expected \"disabled\" or <number><m|h>, e.g. \"30m\" or \"6h\"")]
    InvalidFormat(String),

    #[error("invalid refresh interval '{0}': magnitude must be a positive integer")]
    NonPositive(String),

    #[error("invalid refresh interval '{value}': unknown unit '{unit}' (use m or h)")]
    UnknownUnit { value: String, unit: String },
}

// ---------------------------------------------------------------------------
// Scheduler errors
// ---------------------------------------------------------------------------

/// Errors from reconfiguring the scheduler.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Interval(#[from] IntervalError),

    /// The new interval was valid but could not be persisted.
    #[error("failed to persist refresh interval: {0}")]
    Storage(#[from] DatabaseError),

    /// The blocking settings write panicked or was cancelled.
    #[error("refresh interval write did not finish: {0}")]
    WriteAborted(String),

    /// The scheduler task has shut down.
    #[error("scheduler is not running")]
    Unavailable,
}

// ---------------------------------------------------------------------------
// Sync engine errors
// ---------------------------------------------------------------------------

/// Errors from the sync engine's trigger and pass entry points.
#[derive(Debug, Error)]
pub enum SyncError {
    /// No provider with this name was registered at startup.
    #[error("unknown provider '{0}'")]
    UnknownProvider(String),

    /// The provider exists but is not configured.
    #[error("provider '{0}' is not configured")]
    NotConfigured(String),

    /// A pass for this provider is already running.
    #[error("provider '{0}' is already syncing")]
    AlreadySyncing(String),

    /// The status registry could not be reached.
    #[error("sync status unavailable: {0}")]
    Status(StatusError),

    /// The pass started but ended early on a provider failure.
    #[error("sync pass for '{provider}' failed: {source}")]
    Provider {
        provider: String,
        #[source]
        source: ProviderError,
    },
}

impl From<StatusError> for SyncError {
    fn from(err: StatusError) -> Self {
        match err {
            StatusError::AlreadySyncing(name) => SyncError::AlreadySyncing(name),
            other => SyncError::Status(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_messages() {
        let err = StatusError::AlreadySyncing("calibre".into());
        assert_eq!(err.to_string(), "provider 'calibre' is already syncing");

        let err = IntervalError::UnknownUnit {
            value: "5s".into(),
            unit: "s".into(),
        };
        assert!(err.to_string().contains("unknown unit 's'"));

        let err = ProviderError::Api {
            status: 502,
            body: "bad gateway".into(),
        };
        assert!(err.to_string().contains("502"));
    }

    #[test]
    fn test_constraint_violation_maps_to_conflict() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE t (v TEXT UNIQUE); INSERT INTO t VALUES ('a');")
            .unwrap();
        let err = conn
            .execute("INSERT INTO t VALUES ('a')", [])
            .unwrap_err();
        let catalog_err: CatalogError = err.into();
        assert!(matches!(catalog_err, CatalogError::Conflict(_)));
    }

    #[test]
    fn test_status_error_into_sync_error() {
        let err: SyncError = StatusError::AlreadySyncing("abs".into()).into();
        assert!(matches!(err, SyncError::AlreadySyncing(ref n) if n == "abs"));

        let err: SyncError = StatusError::RegistryUnavailable.into();
        assert!(matches!(err, SyncError::Status(_)));
    }
}
