/// Connection Management Module
///
/// Owns the physical connection of one session. The handle is opened lazily
/// on the first statement and released on `close` or drop. There is no
/// process-wide connection state: every session owns its manager.

use crate::config::DatabaseConfig;
use crate::core::db::classify::{ErrorTranslator, SqliteErrorTranslator};
use crate::core::db::query::{run_statement, Params, RawResult};
use crate::core::{Result, SessionError};
use rusqlite::{Connection, OpenFlags};
use tracing::{debug, error, info, warn};

/// Connection manager for one session
#[derive(Debug)]
pub struct ConnectionManager {
    config: DatabaseConfig,
    read_only: bool,
    /// Active database connection (None if disconnected)
    connection: Option<Connection>,
    translator: Box<dyn ErrorTranslator>,
}

impl ConnectionManager {
    /// Creates a disconnected manager for the given configuration
    pub fn new(config: DatabaseConfig) -> Self {
        ConnectionManager::with_translator(config, Box::new(SqliteErrorTranslator))
    }

    /// Creates a manager that classifies backend errors with `translator`
    pub fn with_translator(config: DatabaseConfig, translator: Box<dyn ErrorTranslator>) -> Self {
        ConnectionManager {
            config,
            read_only: false,
            connection: None,
            translator,
        }
    }

    /// Opens connections in read-only mode from now on. Takes effect on the next `connect`.
    pub fn set_read_only(&mut self, read_only: bool) {
        self.read_only = read_only;
    }

    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    /// Opens the physical connection.
    ///
    /// Returns `Ok(true)` when a new connection was opened and `Ok(false)`
    /// when one was already open.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::Connection` when the database cannot be opened.
    pub fn connect(&mut self) -> Result<bool> {
        if self.connection.is_some() {
            return Ok(false);
        }

        let flags = if self.read_only {
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_URI | OpenFlags::SQLITE_OPEN_NO_MUTEX
        } else {
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_URI
                | OpenFlags::SQLITE_OPEN_NO_MUTEX
        };

        let conn = Connection::open_with_flags(&self.config.name, flags).map_err(|e| {
            error!(db = %self.config.target(), "failed to open database: {}", e);
            SessionError::Connection(format!("{}: {}", self.config.target(), e))
        })?;
        conn.busy_timeout(self.config.busy_timeout())
            .map_err(|e| SessionError::Connection(e.to_string()))?;

        info!(db = %self.config.target(), read_only = self.read_only, "database connection opened");
        self.connection = Some(conn);
        Ok(true)
    }

    /// Checks if there's an active database connection
    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    /// True when the backend is outside any transaction. A closed manager reports `true`.
    pub fn is_autocommit(&self) -> bool {
        self.connection.as_ref().map_or(true, Connection::is_autocommit)
    }

    /// Sends one statement and blocks until the backend has answered with every row.
    ///
    /// Connects first if no connection is open. Driver errors are classified
    /// here and nowhere else.
    pub fn execute(&mut self, sql: &str, params: &Params) -> Result<RawResult> {
        self.connect()?;
        let conn = self
            .connection
            .as_ref()
            .ok_or_else(|| SessionError::Connection("connection is closed".to_string()))?;

        run_statement(conn, sql, params).map_err(|e| {
            let err = self.translator.translate(e);
            match &err {
                SessionError::Database(inner) => error!("error in query: {} ({})", inner, sql),
                other => debug!("query failed: {}", other),
            }
            err
        })
    }

    /// Releases the connection. Safe to call any number of times.
    pub fn close(&mut self) {
        if let Some(conn) = self.connection.take() {
            if let Err((_, e)) = conn.close() {
                warn!("error while closing database connection: {}", e);
            } else {
                info!(db = %self.config.target(), "database connection closed");
            }
        }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.close();
    }
}
