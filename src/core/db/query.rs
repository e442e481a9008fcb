/// Statement Execution Module
///
/// This module holds the value and parameter types that cross the backend
/// boundary, the raw result set produced by one statement, and the
/// keyword-based statement classification used by the transaction tracker.

use rusqlite::types::{ToSqlOutput, ValueRef};
use rusqlite::{Connection, ToSql};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A single SQL value, either bound as a parameter or read from a row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Null values and empty strings, the entries a key list silently drops.
    pub fn is_null_or_empty(&self) -> bool {
        match self {
            Value::Null => true,
            Value::Text(s) => s.is_empty(),
            _ => false,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Integer(i) => Some(*i as f64),
            Value::Real(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Text rendered as its UTF-8 bytes, everything else unchanged.
    pub fn into_utf8_bytes(self) -> Value {
        match self {
            Value::Text(s) => Value::Blob(s.into_bytes()),
            other => other,
        }
    }
}

impl ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::Borrowed(match self {
            Value::Null => ValueRef::Null,
            Value::Integer(i) => ValueRef::Integer(*i),
            Value::Real(f) => ValueRef::Real(*f),
            Value::Text(s) => ValueRef::Text(s.as_bytes()),
            Value::Blob(b) => ValueRef::Blob(b),
        }))
    }
}

impl From<ValueRef<'_>> for Value {
    fn from(value: ValueRef<'_>) -> Self {
        match value {
            ValueRef::Null => Value::Null,
            ValueRef::Integer(i) => Value::Integer(i),
            ValueRef::Real(f) => Value::Real(f),
            ValueRef::Text(t) => Value::Text(String::from_utf8_lossy(t).into_owned()),
            ValueRef::Blob(b) => Value::Blob(b.to_vec()),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Integer(i64::from(v))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Real(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Integer(i64::from(v))
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Blob(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}

/// Renders the value as a SQL literal. Used for logging only, never for execution.
impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Integer(i) => write!(f, "{}", i),
            Value::Real(r) => write!(f, "{}", r),
            Value::Text(s) => write!(f, "'{}'", s.replace('\'', "''")),
            Value::Blob(b) => {
                write!(f, "X'")?;
                for byte in b {
                    write!(f, "{:02X}", byte)?;
                }
                write!(f, "'")
            }
        }
    }
}

/// Parameters bound to a statement.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Params {
    #[default]
    None,
    /// Bound in order to `?` placeholders
    Positional(Vec<Value>),
    /// Bound by name to `:name` placeholders; a missing `:` prefix is added
    Named(Vec<(String, Value)>),
}

impl Params {
    pub fn is_empty(&self) -> bool {
        match self {
            Params::None => true,
            Params::Positional(values) => values.is_empty(),
            Params::Named(pairs) => pairs.is_empty(),
        }
    }
}

impl From<Vec<Value>> for Params {
    fn from(values: Vec<Value>) -> Self {
        Params::Positional(values)
    }
}

impl From<Value> for Params {
    fn from(value: Value) -> Self {
        Params::Positional(vec![value])
    }
}

impl From<()> for Params {
    fn from(_: ()) -> Self {
        Params::None
    }
}

fn named_key(key: &str) -> String {
    if key.starts_with([':', '@', '$']) {
        key.to_string()
    } else {
        format!(":{}", key)
    }
}

/// Rows and column metadata of one executed statement.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawResult {
    /// Column names from the statement metadata
    pub columns: Vec<String>,
    /// Row values in column order
    pub rows: Vec<Vec<Value>>,
}

impl RawResult {
    /// Whether the statement produced a result set at all (a SELECT does,
    /// an INSERT without RETURNING does not).
    pub fn has_result_set(&self) -> bool {
        !self.columns.is_empty()
    }
}

/// Prepares, binds and fully drains one statement.
///
/// The statement is dropped before returning, so the connection never has
/// more than one cursor open.
pub fn run_statement(conn: &Connection, sql: &str, params: &Params) -> rusqlite::Result<RawResult> {
    let mut stmt = conn.prepare(sql)?;
    let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
    let column_count = columns.len();

    let mut rows = match params {
        Params::None => stmt.query([])?,
        Params::Positional(values) => stmt.query(rusqlite::params_from_iter(values.iter()))?,
        Params::Named(pairs) => {
            let keys: Vec<String> = pairs.iter().map(|(k, _)| named_key(k)).collect();
            let named: Vec<(&str, &dyn ToSql)> = keys
                .iter()
                .zip(pairs.iter())
                .map(|(k, (_, v))| (k.as_str(), v as &dyn ToSql))
                .collect();
            stmt.query(named.as_slice())?
        }
    };

    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let mut values = Vec::with_capacity(column_count);
        for i in 0..column_count {
            values.push(Value::from(row.get_ref(i)?));
        }
        out.push(values);
    }

    Ok(RawResult { columns, rows: out })
}

/// Lazily renders a statement with its parameters inlined, for log lines.
pub struct Mogrified<'a> {
    sql: &'a str,
    params: &'a Params,
}

/// Wraps a statement for display with its values substituted.
pub fn mogrify<'a>(sql: &'a str, params: &'a Params) -> Mogrified<'a> {
    Mogrified { sql, params }
}

impl fmt::Display for Mogrified<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.params {
            Params::None => f.write_str(self.sql),
            Params::Positional(values) => {
                let mut values = values.iter();
                let mut in_quote = false;
                for ch in self.sql.chars() {
                    match ch {
                        '\'' => {
                            in_quote = !in_quote;
                            write!(f, "{}", ch)?;
                        }
                        '?' if !in_quote => match values.next() {
                            Some(v) => write!(f, "{}", v)?,
                            None => write!(f, "?")?,
                        },
                        _ => write!(f, "{}", ch)?,
                    }
                }
                Ok(())
            }
            Params::Named(pairs) => {
                let mut rendered = self.sql.to_string();
                // Longest names first so `:ab` is not clobbered by `:a`.
                let mut sorted: Vec<_> = pairs.iter().collect();
                sorted.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
                for (k, v) in sorted {
                    rendered = rendered.replace(&named_key(k), &v.to_string());
                }
                f.write_str(&rendered)
            }
        }
    }
}

/// SQL statement kinds, as far as transaction accounting cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementType {
    Select,
    Insert,
    Update,
    Delete,
    Create,
    Drop,
    Alter,
    Truncate,
    /// BEGIN or START TRANSACTION
    Begin,
    /// COMMIT or END
    Commit,
    /// Full ROLLBACK
    Rollback,
    /// ROLLBACK TO [SAVEPOINT] name
    RollbackTo,
    Savepoint,
    Release,
    Other,
}

impl StatementType {
    /// Determines the statement type from the leading keywords of a SQL string.
    pub fn from_sql(sql: &str) -> Self {
        let mut words = sql
            .trim_start()
            .split(|c: char| c.is_whitespace() || c == ';' || c == '(')
            .filter(|w| !w.is_empty())
            .map(str::to_ascii_lowercase);
        let first = words.next().unwrap_or_default();

        match first.as_str() {
            "select" | "with" | "values" => StatementType::Select,
            "insert" | "replace" => StatementType::Insert,
            "update" => StatementType::Update,
            "delete" => StatementType::Delete,
            "create" => StatementType::Create,
            "drop" => StatementType::Drop,
            "alter" => StatementType::Alter,
            "truncate" => StatementType::Truncate,
            "begin" | "start" => StatementType::Begin,
            "commit" | "end" => StatementType::Commit,
            "rollback" => {
                let mut next = words.next();
                if matches!(next.as_deref(), Some("transaction") | Some("work")) {
                    next = words.next();
                }
                match next.as_deref() {
                    Some("to") => StatementType::RollbackTo,
                    _ => StatementType::Rollback,
                }
            }
            "savepoint" => StatementType::Savepoint,
            "release" => StatementType::Release,
            _ => StatementType::Other,
        }
    }

    /// Statements counted against the write ceiling.
    pub fn is_write(self) -> bool {
        matches!(
            self,
            StatementType::Insert | StatementType::Update | StatementType::Delete
        )
    }

    /// Statements that end an open transaction as a side effect on some backends.
    pub fn causes_implicit_commit(self) -> bool {
        matches!(
            self,
            StatementType::Begin
                | StatementType::Alter
                | StatementType::Drop
                | StatementType::Create
                | StatementType::Truncate
        )
    }

    /// Statements after which cached table metadata is stale.
    pub fn changes_schema(self) -> bool {
        matches!(
            self,
            StatementType::Create | StatementType::Drop | StatementType::Alter
        )
    }

    /// Statements that close the current transaction boundary.
    pub fn ends_transaction(self) -> bool {
        matches!(self, StatementType::Commit | StatementType::Rollback)
    }
}

/// Savepoint named by a `SAVEPOINT`, `RELEASE` or `ROLLBACK TO` statement.
/// All three end with the name.
pub fn savepoint_name(sql: &str) -> Option<String> {
    let last = sql
        .split(|c: char| c.is_whitespace() || c == ';')
        .filter(|w| !w.is_empty())
        .last()?;
    let name = last.trim_matches(|c: char| matches!(c, '"' | '`' | '\'' | '[' | ']'));
    let keyword = matches!(
        name.to_ascii_lowercase().as_str(),
        "savepoint" | "release" | "rollback" | "to" | "transaction" | ""
    );
    (!keyword).then(|| name.to_string())
}
