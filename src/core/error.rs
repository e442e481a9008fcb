/// Session Error Module
///
/// This module defines the error taxonomy of the database access layer.
/// Backend failures are classified once, at the execution boundary, and
/// every other component passes them through unchanged.
use thiserror::Error;

/// Error type for every operation of a database session.
///
/// The variants split into three groups:
/// - guard errors raised before anything reaches the backend
///   (identifiers, implicit commits, the write ceiling)
/// - classified backend errors (missing table/column, deadlock, timeout, read only)
/// - plumbing errors (configuration, I/O, JSON, hooks)
#[derive(Error, Debug)]
pub enum SessionError {
    /// The backend could not be reached or refused the credentials
    #[error("Connection error: {0}")]
    Connection(String),

    /// A table or column token failed the identifier check
    #[error("Invalid identifier: {0:?}")]
    InvalidIdentifier(String),

    /// A statement that would implicitly commit was issued with writes pending
    #[error("This statement can cause implicit commit ({pending_writes} pending writes): {statement}")]
    ImplicitCommit {
        statement: String,
        pending_writes: u64,
    },

    /// The write ceiling was exceeded; the transaction has already been rolled back
    #[error("Too many changes to database in single action ({limit} allowed). The changes have been reverted.")]
    TooManyWrites { limit: u64 },

    /// The statement referenced a column the table does not have
    #[error("Missing column: {0}")]
    MissingColumn(String),

    /// The statement referenced a table that does not exist
    #[error("Missing table: {0}")]
    MissingTable(String),

    /// The backend detected a lock conflict
    #[error("Query deadlock: {0}")]
    Deadlock(String),

    /// The backend gave up waiting for a lock or the statement was interrupted
    #[error("Query timed out: {0}")]
    Timeout(String),

    /// A write was attempted on a read-only connection or transaction
    #[error("Database is in read only mode: {0}")]
    ReadOnly(String),

    /// Unclassified errors from the SQLite driver
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Malformed filter specifications and other caller mistakes
    #[error("Query error: {0}")]
    Query(String),

    /// Configuration loading and validation errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// A commit hook or post-commit callback failed
    #[error("Hook error: {0}")]
    Hook(String),

    /// File system and I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SessionError {
    /// True for the missing-table and missing-column conditions that
    /// `ignore_missing` turns into an absence signal.
    pub fn is_missing_table_or_column(&self) -> bool {
        matches!(
            self,
            SessionError::MissingColumn(_) | SessionError::MissingTable(_)
        )
    }

    /// True for errors the caller may retry at the application level.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SessionError::Deadlock(_) | SessionError::Timeout(_))
    }
}

/// Type alias for Result to use SessionError as the error type.
pub type Result<T> = std::result::Result<T, SessionError>;
