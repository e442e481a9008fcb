/// # Test Utilities Module
///
/// Fixtures shared by the unit and integration tests: sessions over a
/// seeded `accounts` table, in memory or in a temporary file, plus error
/// assertion helpers.

use crate::config::SessionConfig;
use crate::core::db::query::Value;
use crate::core::Result;
use crate::session::{ExecuteOptions, Session};
use tempfile::TempDir;

pub const ACCOUNTS_SCHEMA: &str = "CREATE TABLE accounts (
    name TEXT PRIMARY KEY,
    owner TEXT,
    balance INTEGER NOT NULL DEFAULT 0,
    status INTEGER NOT NULL DEFAULT 1,
    modified TEXT
)";

/// (name, owner, balance, status, modified). Three rows have a positive
/// balance and status 1; balances sum to 475.
pub const SAMPLE_ACCOUNTS: [(&str, &str, i64, i64, &str); 5] = [
    ("ACC-001", "alice", 100, 1, "2024-01-01 09:00:00"),
    ("ACC-002", "bob", 250, 1, "2024-01-03 09:00:00"),
    ("ACC-003", "carol", 50, 1, "2024-01-02 09:00:00"),
    ("ACC-004", "dave", 0, 1, "2024-01-04 09:00:00"),
    ("ACC-005", "erin", 75, 0, "2024-01-05 09:00:00"),
];

/// Creates and fills the `accounts` table, then commits.
pub fn seed_accounts(session: &mut Session) -> Result<()> {
    session.sql_ddl(ACCOUNTS_SCHEMA)?;
    let rows: Vec<Vec<Value>> = SAMPLE_ACCOUNTS
        .iter()
        .map(|(name, owner, balance, status, modified)| {
            vec![
                Value::from(*name),
                Value::from(*owner),
                Value::from(*balance),
                Value::from(*status),
                Value::from(*modified),
            ]
        })
        .collect();
    session.bulk_insert(
        "accounts",
        &["name", "owner", "balance", "status", "modified"],
        &rows,
        false,
    )?;
    session.commit()
}

/// In-memory session over the seeded `accounts` table.
pub fn memory_session() -> Session {
    session_with(SessionConfig::in_memory())
}

/// In-memory session with a custom write ceiling.
pub fn session_with_ceiling(max_writes: u64, auto_commit: bool) -> Session {
    let mut config = SessionConfig::in_memory();
    config.transactions.max_writes = max_writes;
    config.transactions.auto_commit_on_many_writes = auto_commit;
    session_with(config)
}

fn session_with(config: SessionConfig) -> Session {
    let mut session = Session::open(config).expect("open test session");
    seed_accounts(&mut session).expect("seed accounts");
    session
}

/// A seeded database file that several sessions can open.
pub struct FileFixture {
    pub dir: TempDir,
    pub config: SessionConfig,
}

impl FileFixture {
    pub fn new() -> Result<Self> {
        let dir = TempDir::new()?;
        let config = SessionConfig::for_path(dir.path().join("accounts.db"));
        let mut session = Session::open(config.clone())?;
        seed_accounts(&mut session)?;
        session.close();
        Ok(FileFixture { dir, config })
    }

    /// A fresh session on the fixture file.
    pub fn session(&self) -> Result<Session> {
        Session::open(self.config.clone())
    }

    /// A session opened with read-only connection flags.
    pub fn read_only_session(&self) -> Result<Session> {
        let mut config = self.config.clone();
        config.transactions.read_only = true;
        Session::open(config)
    }
}

/// Balance of one account read through a plain statement.
pub fn balance_of(session: &mut Session, name: &str) -> Option<i64> {
    session
        .sql_list("SELECT balance FROM accounts WHERE name = ?", Value::from(name))
        .expect("balance query")
        .first()
        .and_then(Value::as_i64)
}

/// Rows in `accounts` as seen by `session`.
pub fn account_count(session: &mut Session) -> i64 {
    session
        .sql_list("SELECT COUNT(*) FROM accounts", ())
        .expect("count query")
        .first()
        .and_then(Value::as_i64)
        .unwrap_or(0)
}

/// Inserts one account through `execute`.
pub fn insert_account(session: &mut Session, name: &str, balance: i64) -> Result<()> {
    session.execute(
        "INSERT INTO accounts (name, owner, balance, status, modified) VALUES (?, 'test', ?, 1, '2024-02-01')",
        vec![Value::from(name), Value::from(balance)],
        &ExecuteOptions::default(),
    )?;
    Ok(())
}

/// Error assertion helpers
pub mod error_testing {
    use std::fmt::Display;

    /// Asserts that `result` failed with an error `expected_variant` accepts
    pub fn assert_error_type<T, E>(
        result: &std::result::Result<T, E>,
        expected_variant: fn(&E) -> bool,
        message: &str,
    ) where
        E: Display,
    {
        match result {
            Ok(_) => panic!("Expected error but got Ok: {}", message),
            Err(err) => assert!(expected_variant(err), "{}: got {}", message, err),
        }
    }

    /// Asserts that the error message mentions `fragment` (case-insensitive)
    pub fn assert_error_mentions<T, E: Display>(result: &std::result::Result<T, E>, fragment: &str) {
        match result {
            Ok(_) => panic!("Expected an error mentioning {:?}", fragment),
            Err(e) => {
                let text = e.to_string();
                assert!(
                    text.to_lowercase().contains(&fragment.to_lowercase()),
                    "Expected {:?} in error message {:?}",
                    fragment,
                    text
                );
            }
        }
    }
}
