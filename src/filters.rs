//! Filter translation: table + filters + field/order/limit
//! options into one parameterized SELECT.
//!
//! Values only ever travel as bound parameters. The tokens that are
//! interpolated into the SQL text are table and column names (which must
//! pass [`validate_identifier`] and are always double-quoted), operator
//! keywords from a fixed table, and field expressions matching a narrow
//! function-call grammar.

use crate::config::LookupConfig;
use crate::core::db::query::{Params, Value};
use crate::core::{Result, SessionError};
use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;
use std::str::FromStr;

/// Longest identifier accepted by the translator.
pub const MAX_IDENTIFIER_LENGTH: usize = 64;

const ALWAYS_FALSE: &str = "1 = 0";
const ALWAYS_TRUE: &str = "1 = 1";

static IDENTIFIER_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_ ]*$").expect("identifier pattern compiles"));

/// `sum(balance)`, `count(*)`, `count(distinct name)`, `coalesce(a, 0) as total`
static FUNCTION_FIELD_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)^[a-z_][a-z0-9_]*\(\s*(\*|(distinct\s+)?[a-z0-9_.]+(\s*,\s*[a-z0-9_.]+)*)?\s*\)(\s+as\s+[a-z_][a-z0-9_]*)?$",
    )
    .expect("function field pattern compiles")
});

static ALIAS_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^\s*(.+?)\s+as\s+(.+?)\s*$").expect("alias pattern compiles"));

/// Checks that `name` is safe to interpolate as a table or column token.
pub fn validate_identifier(name: &str) -> Result<&str> {
    if name.len() <= MAX_IDENTIFIER_LENGTH && IDENTIFIER_PATTERN.is_match(name) {
        Ok(name)
    } else {
        Err(SessionError::InvalidIdentifier(name.to_string()))
    }
}

/// Validates and double-quotes an identifier.
pub fn quote_identifier(name: &str) -> Result<String> {
    Ok(format!("\"{}\"", validate_identifier(name)?))
}

/// Filter operators. The set is closed; anything else is rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operator {
    Eq,
    Ne,
    Gt,
    Lt,
    Ge,
    Le,
    Like,
    NotLike,
    In,
    NotIn,
    /// Two-element operand, inclusive range
    Between,
    /// Operand `"set"` (IS NOT NULL) or `"not set"` (IS NULL)
    Is,
}

impl Operator {
    fn sql(self) -> &'static str {
        match self {
            Operator::Eq => "=",
            Operator::Ne => "!=",
            Operator::Gt => ">",
            Operator::Lt => "<",
            Operator::Ge => ">=",
            Operator::Le => "<=",
            Operator::Like => "LIKE",
            Operator::NotLike => "NOT LIKE",
            Operator::In => "IN",
            Operator::NotIn => "NOT IN",
            Operator::Between => "BETWEEN",
            Operator::Is => "IS",
        }
    }
}

impl FromStr for Operator {
    type Err = SessionError;

    fn from_str(s: &str) -> Result<Self> {
        let normalized = s.split_whitespace().collect::<Vec<_>>().join(" ").to_ascii_lowercase();
        Ok(match normalized.as_str() {
            "=" => Operator::Eq,
            "!=" | "<>" => Operator::Ne,
            ">" => Operator::Gt,
            "<" => Operator::Lt,
            ">=" | "=>" => Operator::Ge,
            "<=" | "=<" => Operator::Le,
            "like" => Operator::Like,
            "not like" => Operator::NotLike,
            "in" => Operator::In,
            "not in" => Operator::NotIn,
            "between" => Operator::Between,
            "is" => Operator::Is,
            _ => return Err(SessionError::Query(format!("unsupported filter operator {:?}", s))),
        })
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.sql())
    }
}

/// Right-hand side of a predicate.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Value(Value),
    List(Vec<Value>),
}

/// One `column <operator> operand` condition.
#[derive(Debug, Clone, PartialEq)]
pub struct Predicate {
    pub op: Operator,
    pub operand: Operand,
}

impl Predicate {
    /// Builds a predicate, normalizing set operands: a comma-separated string
    /// or a single scalar becomes a list, and NULL becomes the empty list.
    pub fn new(op: Operator, operand: Operand) -> Self {
        let operand = match (op, operand) {
            (Operator::In | Operator::NotIn, Operand::Value(Value::Text(s))) => Operand::List(
                s.split(',')
                    .map(str::trim)
                    .filter(|part| !part.is_empty())
                    .map(Value::from)
                    .collect(),
            ),
            (Operator::In | Operator::NotIn, Operand::Value(Value::Null)) => Operand::List(Vec::new()),
            (Operator::In | Operator::NotIn, Operand::Value(v)) => Operand::List(vec![v]),
            (_, operand) => operand,
        };
        Predicate { op, operand }
    }

    /// Parses the operator token, e.g. `Predicate::parse("not in", ...)`.
    pub fn parse(op: &str, operand: Operand) -> Result<Self> {
        Ok(Predicate::new(op.parse()?, operand))
    }

    pub fn eq(value: impl Into<Value>) -> Self {
        Predicate::new(Operator::Eq, Operand::Value(value.into()))
    }

    pub fn op(op: Operator, value: impl Into<Value>) -> Self {
        Predicate::new(op, Operand::Value(value.into()))
    }

    pub fn is_in<V: Into<Value>>(values: impl IntoIterator<Item = V>) -> Self {
        Predicate::new(Operator::In, Operand::List(values.into_iter().map(Into::into).collect()))
    }

    pub fn not_in<V: Into<Value>>(values: impl IntoIterator<Item = V>) -> Self {
        Predicate::new(Operator::NotIn, Operand::List(values.into_iter().map(Into::into).collect()))
    }

    fn render(&self, column: &str, params: &mut Vec<Value>) -> Result<String> {
        let col = quote_identifier(column)?;
        match (self.op, &self.operand) {
            (Operator::Eq, Operand::Value(Value::Null)) => Ok(format!("{} IS NULL", col)),
            (Operator::Ne, Operand::Value(Value::Null)) => Ok(format!("{} IS NOT NULL", col)),
            (Operator::In | Operator::NotIn, Operand::List(values)) => {
                if values.is_empty() {
                    // Never emit `IN ()`
                    let constant = if self.op == Operator::In { ALWAYS_FALSE } else { ALWAYS_TRUE };
                    return Ok(constant.to_string());
                }
                params.extend(values.iter().cloned());
                Ok(format!("{} {} ({})", col, self.op, placeholders(values.len())))
            }
            (Operator::Between, Operand::List(bounds)) if bounds.len() == 2 => {
                params.extend(bounds.iter().cloned());
                Ok(format!("{} BETWEEN ? AND ?", col))
            }
            (Operator::Is, Operand::Value(Value::Text(flag))) => match flag.trim().to_ascii_lowercase().as_str() {
                "set" => Ok(format!("{} IS NOT NULL", col)),
                "not set" => Ok(format!("{} IS NULL", col)),
                _ => Err(SessionError::Query(format!(
                    "operator IS expects \"set\" or \"not set\", got {:?}",
                    flag
                ))),
            },
            (
                Operator::Eq
                | Operator::Ne
                | Operator::Gt
                | Operator::Lt
                | Operator::Ge
                | Operator::Le
                | Operator::Like
                | Operator::NotLike,
                Operand::Value(value),
            ) => {
                params.push(value.clone());
                Ok(format!("{} {} ?", col, self.op))
            }
            (op, operand) => Err(SessionError::Query(format!(
                "operand {:?} does not fit operator {} on column {:?}",
                operand, op, column
            ))),
        }
    }
}

macro_rules! equality_predicate_from {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for Predicate {
                fn from(value: $ty) -> Self {
                    Predicate::eq(value)
                }
            }
        )*
    };
}

equality_predicate_from!(Value, i64, i32, f64, bool, &str, String);

/// Which rows a lookup matches.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Filters {
    /// Every row
    #[default]
    All,
    /// A single primary-key value (a "named document")
    NamedKey(String),
    /// A batch of primary-key values; null and empty entries are dropped
    KeyList(Vec<Value>),
    /// Conjunction of per-column predicates, in caller order
    PredicateMap(Vec<(String, Predicate)>),
}

impl Filters {
    /// Starts a predicate map with one condition.
    pub fn by(column: impl Into<String>, predicate: impl Into<Predicate>) -> Self {
        Filters::PredicateMap(vec![(column.into(), predicate.into())])
    }

    /// Adds a condition; turns any other shape into a predicate map first.
    pub fn and(self, column: impl Into<String>, predicate: impl Into<Predicate>) -> Self {
        let mut entries = match self {
            Filters::PredicateMap(entries) => entries,
            _ => Vec::new(),
        };
        entries.push((column.into(), predicate.into()));
        Filters::PredicateMap(entries)
    }

    pub fn keys<V: Into<Value>>(keys: impl IntoIterator<Item = V>) -> Self {
        Filters::KeyList(keys.into_iter().map(Into::into).collect())
    }

    /// The key of a named-document lookup, the only shape the point-lookup cache accepts.
    pub fn named_key(&self) -> Option<&str> {
        match self {
            Filters::NamedKey(key) => Some(key),
            _ => None,
        }
    }

    /// Reads the loosely typed filter shapes callers send as JSON:
    /// a string or number is a named key, an array of scalars is a key list,
    /// an array of `[column, operator, operand]` triples is a list of
    /// conditions, and an object maps columns to a literal or an
    /// `[operator, operand]` pair.
    pub fn from_json(value: &serde_json::Value) -> Result<Self> {
        use serde_json::Value as Json;
        match value {
            Json::Null => Ok(Filters::All),
            Json::String(s) => Ok(Filters::NamedKey(s.clone())),
            Json::Number(n) => Ok(Filters::NamedKey(n.to_string())),
            Json::Bool(_) => Err(SessionError::Query("a boolean is not a filter".to_string())),
            Json::Array(items) if !items.is_empty() && items.iter().all(Json::is_array) => {
                Ok(Filters::PredicateMap(
                    items.iter().map(condition_from_json).collect::<Result<_>>()?,
                ))
            }
            Json::Array(items) => Ok(Filters::KeyList(
                items.iter().map(json_to_value).collect::<Result<_>>()?,
            )),
            Json::Object(map) => Ok(Filters::PredicateMap(
                map.iter()
                    .map(|(column, v)| Ok((column.clone(), predicate_from_json(v)?)))
                    .collect::<Result<_>>()?,
            )),
        }
    }
}

impl From<&str> for Filters {
    fn from(key: &str) -> Self {
        Filters::NamedKey(key.to_string())
    }
}

impl From<String> for Filters {
    fn from(key: String) -> Self {
        Filters::NamedKey(key)
    }
}

impl From<Vec<Value>> for Filters {
    fn from(keys: Vec<Value>) -> Self {
        Filters::KeyList(keys)
    }
}

fn json_to_value(value: &serde_json::Value) -> Result<Value> {
    use serde_json::Value as Json;
    match value {
        Json::Null => Ok(Value::Null),
        Json::Bool(b) => Ok(Value::from(*b)),
        Json::Number(n) => Ok(n
            .as_i64()
            .map(Value::Integer)
            .or_else(|| n.as_f64().map(Value::Real))
            .unwrap_or(Value::Null)),
        Json::String(s) => Ok(Value::Text(s.clone())),
        other => Err(SessionError::Query(format!("nested value {} is not a SQL value", other))),
    }
}

fn condition_from_json(value: &serde_json::Value) -> Result<(String, Predicate)> {
    match value.as_array().map(Vec::as_slice) {
        Some([column, op, operand]) => {
            let column = column
                .as_str()
                .ok_or_else(|| SessionError::Query(format!("column must be a string, got {}", column)))?;
            let pair = serde_json::Value::Array(vec![op.clone(), operand.clone()]);
            Ok((column.to_string(), predicate_from_json(&pair)?))
        }
        _ => Err(SessionError::Query(format!(
            "a condition must be [column, operator, operand], got {}",
            value
        ))),
    }
}

fn predicate_from_json(value: &serde_json::Value) -> Result<Predicate> {
    use serde_json::Value as Json;
    match value {
        Json::Array(pair) if pair.len() == 2 => {
            let op = pair[0]
                .as_str()
                .ok_or_else(|| SessionError::Query(format!("operator must be a string, got {}", pair[0])))?;
            let operand = match &pair[1] {
                Json::Array(items) => Operand::List(items.iter().map(json_to_value).collect::<Result<_>>()?),
                other => Operand::Value(json_to_value(other)?),
            };
            Predicate::parse(op, operand)
        }
        Json::Array(_) => Err(SessionError::Query(
            "a column filter list must be [operator, operand]".to_string(),
        )),
        other => Ok(Predicate::eq(json_to_value(other)?)),
    }
}

/// Columns to select.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Fields {
    /// `*`; results come back as mappings of every column
    #[default]
    All,
    /// Columns, `column as alias`, or aggregate expressions, in caller order
    List(Vec<String>),
}

impl Fields {
    pub fn one(field: impl Into<String>) -> Self {
        Fields::List(vec![field.into()])
    }

    pub fn is_all(&self) -> bool {
        matches!(self, Fields::All)
    }

    pub fn len(&self) -> usize {
        match self {
            Fields::All => 0,
            Fields::List(fields) => fields.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stable text form used in cache keys.
    pub fn cache_key(&self) -> String {
        match self {
            Fields::All => "*".to_string(),
            Fields::List(fields) => fields.join(","),
        }
    }
}

impl From<&str> for Fields {
    fn from(raw: &str) -> Self {
        if raw.trim() == "*" {
            return Fields::All;
        }
        Fields::List(split_top_level(raw))
    }
}

impl From<Vec<String>> for Fields {
    fn from(fields: Vec<String>) -> Self {
        if fields.len() == 1 && fields[0].trim() == "*" {
            Fields::All
        } else {
            Fields::List(fields)
        }
    }
}

impl From<Vec<&str>> for Fields {
    fn from(fields: Vec<&str>) -> Self {
        Fields::from(fields.into_iter().map(str::to_string).collect::<Vec<_>>())
    }
}

impl<const N: usize> From<[&str; N]> for Fields {
    fn from(fields: [&str; N]) -> Self {
        Fields::from(fields.to_vec())
    }
}

/// Splits on commas that are not inside parentheses.
fn split_top_level(raw: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut current = String::new();
    for ch in raw.chars() {
        match ch {
            '(' => {
                depth += 1;
                current.push(ch);
            }
            ')' => {
                depth = depth.saturating_sub(1);
                current.push(ch);
            }
            ',' if depth == 0 => parts.push(std::mem::take(&mut current)),
            _ => current.push(ch),
        }
    }
    parts.push(current);
    parts
        .into_iter()
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .collect()
}

fn render_field(field: &str) -> Result<String> {
    let field = field.trim();
    if field.contains('(') {
        return if FUNCTION_FIELD_PATTERN.is_match(field) {
            Ok(field.to_string())
        } else {
            Err(SessionError::InvalidIdentifier(field.to_string()))
        };
    }
    if let Some(caps) = ALIAS_PATTERN.captures(field) {
        return Ok(format!(
            "{} AS {}",
            quote_identifier(&caps[1])?,
            quote_identifier(&caps[2])?
        ));
    }
    quote_identifier(field)
}

/// Result ordering.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum OrderBy {
    #[default]
    Unordered,
    /// Most recently modified first
    Default,
    /// `"column [asc|desc], ..."`; a column without a direction sorts descending
    Columns(String),
}

impl From<&str> for OrderBy {
    fn from(raw: &str) -> Self {
        OrderBy::Columns(raw.to_string())
    }
}

fn render_order_by(raw: &str) -> Result<String> {
    let mut terms = Vec::new();
    for term in raw.split(',').map(str::trim).filter(|t| !t.is_empty()) {
        let mut words = term.split_whitespace();
        let column = words.next().unwrap_or_default();
        let direction = match words.next().map(str::to_ascii_lowercase).as_deref() {
            Some("asc") => "ASC",
            Some("desc") | None => "DESC",
            Some(other) => {
                return Err(SessionError::Query(format!("unknown sort direction {:?}", other)));
            }
        };
        if words.next().is_some() {
            return Err(SessionError::InvalidIdentifier(term.to_string()));
        }
        terms.push(format!("{} {}", quote_identifier(column)?, direction));
    }
    Ok(terms.join(", "))
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

/// Clause options of a lookup.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryOptions {
    pub order_by: OrderBy,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
    pub distinct: bool,
    pub group_by: Option<String>,
}

/// An immutable statement ready to run exactly once.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryDescriptor {
    sql: String,
    params: Vec<Value>,
    run: bool,
}

impl QueryDescriptor {
    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn params(&self) -> &[Value] {
        &self.params
    }

    /// False when the result is known to be empty and the backend need not be asked.
    pub fn should_run(&self) -> bool {
        self.run
    }

    pub fn into_parts(self) -> (String, Params, bool) {
        (self.sql, Params::Positional(self.params), self.run)
    }
}

/// Translates filter specifications into SELECT statements.
#[derive(Debug, Clone)]
pub struct QueryBuilder {
    primary_key: String,
    modified_column: String,
}

impl Default for QueryBuilder {
    fn default() -> Self {
        QueryBuilder::new(&LookupConfig::default())
    }
}

impl QueryBuilder {
    pub fn new(config: &LookupConfig) -> Self {
        QueryBuilder {
            primary_key: config.primary_key.clone(),
            modified_column: config.modified_column.clone(),
        }
    }

    pub fn primary_key(&self) -> &str {
        &self.primary_key
    }

    pub fn build(
        &self,
        table: &str,
        filters: &Filters,
        fields: &Fields,
        options: &QueryOptions,
    ) -> Result<QueryDescriptor> {
        let table_sql = quote_identifier(table)?;
        let mut params = Vec::new();
        let mut conditions = Vec::new();
        let mut run = true;

        match filters {
            Filters::All => {}
            Filters::NamedKey(key) => {
                conditions.push(format!("{} = ?", quote_identifier(&self.primary_key)?));
                params.push(Value::Text(key.clone()));
            }
            Filters::KeyList(keys) => {
                let keys: Vec<&Value> = keys.iter().filter(|k| !k.is_null_or_empty()).collect();
                if keys.is_empty() {
                    run = false;
                    conditions.push(ALWAYS_FALSE.to_string());
                } else {
                    conditions.push(format!(
                        "{} IN ({})",
                        quote_identifier(&self.primary_key)?,
                        placeholders(keys.len())
                    ));
                    params.extend(keys.into_iter().cloned());
                }
            }
            Filters::PredicateMap(entries) => {
                for (column, predicate) in entries {
                    conditions.push(predicate.render(column, &mut params)?);
                }
            }
        }

        let mut sql = String::from("SELECT ");
        if options.distinct {
            sql.push_str("DISTINCT ");
        }
        match fields {
            Fields::All => sql.push('*'),
            Fields::List(list) if list.is_empty() => sql.push_str(&quote_identifier(&self.primary_key)?),
            Fields::List(list) => {
                let rendered = list.iter().map(|f| render_field(f)).collect::<Result<Vec<_>>>()?;
                sql.push_str(&rendered.join(", "));
            }
        }
        sql.push_str(" FROM ");
        sql.push_str(&table_sql);

        if !conditions.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&conditions.join(" AND "));
        }

        if let Some(group_by) = &options.group_by {
            let columns = split_top_level(group_by)
                .iter()
                .map(|c| quote_identifier(c))
                .collect::<Result<Vec<_>>>()?;
            sql.push_str(" GROUP BY ");
            sql.push_str(&columns.join(", "));
        }

        match &options.order_by {
            OrderBy::Unordered => {}
            OrderBy::Default => {
                sql.push_str(&format!(" ORDER BY {} DESC", quote_identifier(&self.modified_column)?));
            }
            OrderBy::Columns(spec) => {
                let rendered = render_order_by(spec)?;
                if !rendered.is_empty() {
                    sql.push_str(" ORDER BY ");
                    sql.push_str(&rendered);
                }
            }
        }

        match (options.limit, options.offset) {
            (Some(limit), Some(offset)) => sql.push_str(&format!(" LIMIT {} OFFSET {}", limit, offset)),
            (Some(limit), None) => sql.push_str(&format!(" LIMIT {}", limit)),
            // SQLite only accepts OFFSET after a LIMIT
            (None, Some(offset)) => sql.push_str(&format!(" LIMIT -1 OFFSET {}", offset)),
            (None, None) => {}
        }

        Ok(QueryDescriptor { sql, params, run })
    }
}
