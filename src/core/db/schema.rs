/// Schema Introspection Module
///
/// Table and column metadata, read through the session's own connection,
/// plus a per-session cache that schema-changing statements invalidate.

use crate::core::db::connection::ConnectionManager;
use crate::core::db::query::{Params, Value};
use crate::core::Result;
use crate::filters::quote_identifier;
use std::collections::HashMap;

/// Represents a database column with its metadata
#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    /// Column name
    pub name: String,
    /// Declared type name (e.g., "INTEGER", "TEXT", "REAL", "BLOB")
    pub type_name: String,
    /// Whether the column rejects NULL values
    pub notnull: bool,
    /// Whether this column is part of the primary key
    pub pk: bool,
    /// Default value expression (if any)
    pub dflt_value: Option<String>,
}

impl Column {
    /// Creates a Column from a PRAGMA table_info result row
    /// (cid, name, type, notnull, dflt_value, pk)
    fn from_pragma_row(row: &[Value]) -> Option<Self> {
        let text = |v: &Value| v.as_str().map(str::to_string);
        Some(Column {
            name: text(row.get(1)?)?,
            type_name: text(row.get(2)?).unwrap_or_default(),
            notnull: row.get(3)?.as_i64().unwrap_or(0) != 0,
            dflt_value: text(row.get(4)?),
            pk: row.get(5)?.as_i64().unwrap_or(0) != 0,
        })
    }
}

/// Names of all user tables, sorted
pub fn get_tables(conn: &mut ConnectionManager) -> Result<Vec<String>> {
    let result = conn.execute(
        "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
        &Params::None,
    )?;
    Ok(result
        .rows
        .into_iter()
        .filter_map(|row| row.into_iter().next())
        .filter_map(|v| match v {
            Value::Text(name) => Some(name),
            _ => None,
        })
        .collect())
}

/// Column metadata of `table`; empty when the table does not exist
pub fn get_table_columns(conn: &mut ConnectionManager, table: &str) -> Result<Vec<Column>> {
    let sql = format!("PRAGMA table_info({})", quote_identifier(table)?);
    let result = conn.execute(&sql, &Params::None)?;
    Ok(result
        .rows
        .iter()
        .filter_map(|row| Column::from_pragma_row(row))
        .collect())
}

/// Per-session cache of table and column metadata.
#[derive(Debug, Default)]
pub struct SchemaCache {
    tables: Option<Vec<String>>,
    columns: HashMap<String, Vec<Column>>,
}

impl SchemaCache {
    pub fn tables(&self) -> Option<&[String]> {
        self.tables.as_deref()
    }

    pub fn set_tables(&mut self, tables: Vec<String>) {
        self.tables = Some(tables);
    }

    pub fn columns(&self, table: &str) -> Option<&[Column]> {
        self.columns.get(table).map(Vec::as_slice)
    }

    pub fn set_columns(&mut self, table: &str, columns: Vec<Column>) {
        self.columns.insert(table.to_string(), columns);
    }

    /// Drops everything; called after CREATE/DROP/ALTER statements.
    pub fn clear(&mut self) {
        self.tables = None;
        self.columns.clear();
    }
}
