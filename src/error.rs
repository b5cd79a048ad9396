//! Error taxonomy for the migration engine.

use std::path::PathBuf;

use thiserror::Error;

/// Errors produced while loading, planning or running migrations.
#[derive(Debug, Error)]
pub enum MigrateError {
    /// Missing or invalid connection settings.
    #[error("configuration error: {0}")]
    Config(String),

    /// The database could not be reached or did not answer a ping.
    #[error("connection error: {0}")]
    Connection(#[source] sqlx::Error),

    /// A migration file name or body could not be parsed.
    #[error("failed to parse migration file {}: {reason}", file.display())]
    Parse { file: PathBuf, reason: String },

    /// An up-body failed. The version has been recorded as failed.
    #[error("migration {version} ({name}) failed: {source}")]
    Execution {
        version: i64,
        name: String,
        #[source]
        source: sqlx::Error,
        /// Versions this run applied before the failure.
        applied: Vec<i64>,
    },

    /// A down-body or the ledger delete failed; the transaction was rolled back.
    #[error("rollback of migration {version} ({name}) failed: {source}")]
    RollbackExecution {
        version: i64,
        name: String,
        #[source]
        source: sqlx::Error,
    },

    #[error("migration {version} ({name}) has no down section and cannot be rolled back")]
    NoRollbackAvailable { version: i64, name: String },

    #[error("migration {version} ({name}) is invalid: {reason}")]
    Validation {
        version: i64,
        name: String,
        reason: String,
    },

    /// The up-body ran but its ledger row could not be written.
    #[error("migration {version} was applied but could not be recorded: {source}")]
    Ledger {
        version: i64,
        #[source]
        source: sqlx::Error,
    },

    #[error(
        "migration {version} ({name}) changed after it was applied (recorded {recorded}, file {current})"
    )]
    ChecksumMismatch {
        version: i64,
        name: String,
        recorded: String,
        current: String,
    },

    /// Another migrator holds the advisory lock.
    #[error("another migration run holds the lock on this database")]
    LockHeld,

    #[error("invalid migration name {0:?}: use letters, digits, '_' or '-'")]
    InvalidName(String),

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl MigrateError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        MigrateError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, MigrateError>;
