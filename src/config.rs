use crate::core::{Result, SessionError};
use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Ceiling on write statements between two transaction boundaries.
pub const MAX_WRITES_PER_TRANSACTION: u64 = 200_000;

/// Top-level configuration structure parsed from a TOML file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub database: DatabaseConfig,
    pub transactions: TransactionConfig,
    pub lookup: LookupConfig,
}

/// Connection parameters.
///
/// The SQLite backend only opens `name` (a file path or `:memory:`); host,
/// port and credentials are carried for logging and for other drivers.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: Option<u16>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub name: String,
    pub busy_timeout_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        DatabaseConfig {
            host: "127.0.0.1".to_string(),
            port: None,
            user: None,
            password: None,
            name: ":memory:".to_string(),
            busy_timeout_ms: 5_000,
        }
    }
}

impl DatabaseConfig {
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    /// Connection target for log lines; never includes the password.
    pub fn target(&self) -> String {
        match (&self.user, self.port) {
            (Some(user), Some(port)) => format!("{}@{}:{}/{}", user, self.host, port, self.name),
            (Some(user), None) => format!("{}@{}/{}", user, self.host, self.name),
            (None, Some(port)) => format!("{}:{}/{}", self.host, port, self.name),
            (None, None) => self.name.clone(),
        }
    }
}

/// Transaction accounting.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TransactionConfig {
    pub max_writes: u64,
    pub auto_commit_on_many_writes: bool,
    pub read_only: bool,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        TransactionConfig {
            max_writes: MAX_WRITES_PER_TRANSACTION,
            auto_commit_on_many_writes: false,
            read_only: false,
        }
    }
}

/// Column conventions used by the filter translator.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LookupConfig {
    /// Column matched by named-key and key-list filters
    pub primary_key: String,
    /// Column used for the default "most recently modified first" ordering
    pub modified_column: String,
}

impl Default for LookupConfig {
    fn default() -> Self {
        LookupConfig {
            primary_key: "name".to_string(),
            modified_column: "modified".to_string(),
        }
    }
}

impl SessionConfig {
    /// Configuration for a private in-memory database.
    pub fn in_memory() -> Self {
        SessionConfig::default()
    }

    /// Configuration for a database file at `path`.
    pub fn for_path<P: AsRef<Path>>(path: P) -> Self {
        let mut config = SessionConfig::default();
        config.database.name = path.as_ref().to_string_lossy().into_owned();
        config
    }

    fn validate(&self) -> Result<()> {
        if self.database.name.trim().is_empty() {
            return Err(SessionError::Config("database.name must not be empty".to_string()));
        }
        if self.transactions.max_writes == 0 {
            return Err(SessionError::Config(
                "transactions.max_writes must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Parses and validates configuration from TOML text.
pub fn parse_config(content: &str) -> Result<SessionConfig> {
    let config: SessionConfig =
        toml::from_str(content).map_err(|e| SessionError::Config(e.to_string()))?;
    config.validate()?;
    Ok(config)
}

/// Loads configuration from a TOML file at the given path.
///
/// # Example
///
/// ```no_run
/// let config = sqlsession::config::load_config("sqlsession.toml").expect("Failed to load config");
/// println!("{:?}", config);
/// ```
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<SessionConfig> {
    let content = fs::read_to_string(path)?;
    parse_config(&content)
}
