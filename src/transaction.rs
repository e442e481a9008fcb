/// Transaction Tracking Module
///
/// Counts write statements since the last transaction boundary, enforces the
/// write ceiling, refuses statements that would implicitly commit pending
/// writes, and keeps the stack of open savepoints. The tracker never talks
/// to the backend; the session acts on its verdicts.

use crate::config::TransactionConfig;
use crate::core::db::query::StatementType;
use crate::core::{Result, SessionError};
use tracing::{debug, warn};

/// Represents database transaction states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransactionState {
    /// No transaction open (session not connected yet)
    #[default]
    Autocommit,
    /// Read-write transaction in progress
    Transaction,
    /// Transaction in progress with writes refused by the backend
    ReadOnly,
}

/// What the session must do before running a statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementVerdict {
    /// Run the statement
    Proceed,
    /// The ceiling was crossed with auto-commit enabled: commit the pending
    /// writes, then run the statement in the fresh transaction
    CommitFirst,
    /// The ceiling was crossed: roll everything back and fail
    ExceedsCeiling,
}

/// Write accounting and savepoint stack of one session.
#[derive(Debug, Clone)]
pub struct TransactionTracker {
    writes: u64,
    max_writes: u64,
    auto_commit_on_many_writes: bool,
    state: TransactionState,
    savepoints: Vec<String>,
}

impl Default for TransactionTracker {
    fn default() -> Self {
        TransactionTracker::new(&TransactionConfig::default())
    }
}

impl TransactionTracker {
    pub fn new(config: &TransactionConfig) -> Self {
        TransactionTracker {
            writes: 0,
            max_writes: config.max_writes,
            auto_commit_on_many_writes: config.auto_commit_on_many_writes,
            state: TransactionState::Autocommit,
            savepoints: Vec::new(),
        }
    }

    /// Write statements since the last boundary.
    pub fn writes(&self) -> u64 {
        self.writes
    }

    pub fn max_writes(&self) -> u64 {
        self.max_writes
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    /// Open savepoints, innermost last.
    pub fn savepoints(&self) -> &[String] {
        &self.savepoints
    }

    pub fn set_auto_commit_on_many_writes(&mut self, enabled: bool) {
        self.auto_commit_on_many_writes = enabled;
    }

    /// Inspects a statement before it is sent.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::ImplicitCommit` when the statement would end
    /// the transaction as a side effect while writes are pending. The
    /// tracker is left unchanged in that case.
    pub fn check(&mut self, sql: &str) -> Result<StatementVerdict> {
        let kind = StatementType::from_sql(sql);

        if kind.causes_implicit_commit() && self.writes > 0 {
            warn!(pending_writes = self.writes, "refusing statement that would implicitly commit");
            return Err(SessionError::ImplicitCommit {
                statement: sql.trim().to_string(),
                pending_writes: self.writes,
            });
        }

        if kind.ends_transaction() {
            self.writes = 0;
        }

        if kind.is_write() {
            self.writes += 1;
            if self.writes > self.max_writes {
                return Ok(if self.auto_commit_on_many_writes {
                    debug!(writes = self.writes, "write ceiling crossed, committing");
                    StatementVerdict::CommitFirst
                } else {
                    StatementVerdict::ExceedsCeiling
                });
            }
        }

        Ok(StatementVerdict::Proceed)
    }

    /// Counts a write that runs outside `check`, e.g. the statement that
    /// triggered a ceiling commit.
    pub fn note_write(&mut self) {
        self.writes += 1;
    }

    /// A new transaction has started: counter zero, no savepoints.
    pub fn begin(&mut self, read_only: bool) {
        self.writes = 0;
        self.savepoints.clear();
        self.state = if read_only {
            TransactionState::ReadOnly
        } else {
            TransactionState::Transaction
        };
    }

    /// The connection was closed.
    pub fn reset(&mut self) {
        self.writes = 0;
        self.savepoints.clear();
        self.state = TransactionState::Autocommit;
    }

    pub fn push_savepoint(&mut self, name: &str) {
        self.savepoints.push(name.to_string());
    }

    /// Forgets `name` and every savepoint opened after it. Returns false
    /// when `name` is not on the stack.
    pub fn release_savepoint(&mut self, name: &str) -> bool {
        match self.position(name) {
            Some(idx) => {
                self.savepoints.truncate(idx);
                true
            }
            None => false,
        }
    }

    /// Forgets every savepoint opened after `name`; `name` itself stays open.
    /// The write counter is not touched.
    pub fn rollback_to_savepoint(&mut self, name: &str) -> bool {
        match self.position(name) {
            Some(idx) => {
                self.savepoints.truncate(idx + 1);
                true
            }
            None => false,
        }
    }

    pub fn has_savepoint(&self, name: &str) -> bool {
        self.position(name).is_some()
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.savepoints.iter().rposition(|sp| sp == name)
    }
}

/// A short random savepoint name.
pub fn new_savepoint_name() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("sp_{}", &id[..12])
}
