/// Backend Error Translation
///
/// Maps driver errors onto the session error taxonomy. Each supported
/// backend provides an `ErrorTranslator` backed by static code tables;
/// nothing outside this module inspects backend error text.

use crate::core::SessionError;
use rusqlite::ffi;
use std::os::raw::c_int;

/// Classification of a backend failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    MissingColumn,
    MissingTable,
    Deadlock,
    Timeout,
    ReadOnly,
    Connection,
    Syntax,
    Other,
}

/// Translates driver errors of one backend into `SessionError`s.
pub trait ErrorTranslator: Send + Sync + std::fmt::Debug {
    /// Classifies an error without consuming it.
    fn classify(&self, err: &rusqlite::Error) -> ErrorClass;

    /// Converts a driver error into the matching `SessionError` variant.
    fn translate(&self, err: rusqlite::Error) -> SessionError {
        match self.classify(&err) {
            ErrorClass::MissingColumn => SessionError::MissingColumn(err.to_string()),
            ErrorClass::MissingTable => SessionError::MissingTable(err.to_string()),
            ErrorClass::Deadlock => SessionError::Deadlock(err.to_string()),
            ErrorClass::Timeout => SessionError::Timeout(err.to_string()),
            ErrorClass::ReadOnly => SessionError::ReadOnly(err.to_string()),
            ErrorClass::Connection => SessionError::Connection(err.to_string()),
            ErrorClass::Syntax | ErrorClass::Other => SessionError::Database(err),
        }
    }
}

/// Primary result codes with a fixed meaning.
const SQLITE_CODE_CLASSES: &[(c_int, ErrorClass)] = &[
    (ffi::SQLITE_BUSY, ErrorClass::Timeout),
    (ffi::SQLITE_INTERRUPT, ErrorClass::Timeout),
    (ffi::SQLITE_LOCKED, ErrorClass::Deadlock),
    (ffi::SQLITE_READONLY, ErrorClass::ReadOnly),
    (ffi::SQLITE_CANTOPEN, ErrorClass::Connection),
    (ffi::SQLITE_NOTADB, ErrorClass::Connection),
    (ffi::SQLITE_AUTH, ErrorClass::Connection),
    (ffi::SQLITE_PERM, ErrorClass::Connection),
];

/// SQLite reports schema lookups under the generic SQLITE_ERROR code;
/// the message is the only discriminator it offers.
const SQLITE_ERROR_MESSAGES: &[(&str, ErrorClass)] = &[
    ("no such column", ErrorClass::MissingColumn),
    ("has no column named", ErrorClass::MissingColumn),
    ("no such table", ErrorClass::MissingTable),
    ("syntax error", ErrorClass::Syntax),
];

/// Error translation for the SQLite backend.
#[derive(Debug, Default, Clone, Copy)]
pub struct SqliteErrorTranslator;

impl ErrorTranslator for SqliteErrorTranslator {
    fn classify(&self, err: &rusqlite::Error) -> ErrorClass {
        let rusqlite::Error::SqliteFailure(failure, message) = err else {
            return ErrorClass::Other;
        };
        let primary = failure.extended_code & 0xff;

        if let Some((_, class)) = SQLITE_CODE_CLASSES.iter().find(|(code, _)| *code == primary) {
            return *class;
        }

        if primary == ffi::SQLITE_ERROR {
            let message = message.as_deref().unwrap_or_default();
            if let Some((_, class)) = SQLITE_ERROR_MESSAGES
                .iter()
                .find(|(fragment, _)| message.contains(fragment))
            {
                return *class;
            }
        }

        ErrorClass::Other
    }
}
