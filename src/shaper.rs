/// Result Shaping Module
///
/// Turns the raw rows of one statement into the form the caller asked for:
/// mappings, sequences, a flat column, or a single value.

use crate::core::db::query::{RawResult, Value};
use serde::ser::{SerializeMap, SerializeSeq};
use serde::{Serialize, Serializer};

/// One row as an ordered column -> value mapping.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Record {
    fields: Vec<(String, Value)>,
}

impl Record {
    pub fn new() -> Self {
        Record::default()
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.fields.iter().find(|(k, _)| k == column).map(|(_, v)| v)
    }

    /// Sets `column`, replacing an existing value in place.
    pub fn insert(&mut self, column: impl Into<String>, value: impl Into<Value>) {
        let column = column.into();
        let value = value.into();
        match self.fields.iter_mut().find(|(k, _)| *k == column) {
            Some(slot) => slot.1 = value,
            None => self.fields.push((column, value)),
        }
    }

    /// Same as `insert`, chained.
    pub fn with(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(column, value);
        self
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|(k, _)| k.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn into_pairs(self) -> Vec<(String, Value)> {
        self.fields
    }

    /// Overwrites or appends every field of `other`.
    pub fn merge(&mut self, other: &Record) {
        for (k, v) in &other.fields {
            self.insert(k.clone(), v.clone());
        }
    }
}

impl FromIterator<(String, Value)> for Record {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        let mut record = Record::new();
        for (k, v) in iter {
            record.insert(k, v);
        }
        record
    }
}

impl Serialize for Record {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.fields.len()))?;
        for (k, v) in &self.fields {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

/// Shaped result of one statement.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryOutput {
    /// The statement produced no result set, or the lookup was short-circuited
    Empty,
    Records(Vec<Record>),
    Rows(Vec<Vec<Value>>),
    /// First column of every row
    Column(Vec<Value>),
}

impl QueryOutput {
    pub fn len(&self) -> usize {
        match self {
            QueryOutput::Empty => 0,
            QueryOutput::Records(records) => records.len(),
            QueryOutput::Rows(rows) => rows.len(),
            QueryOutput::Column(values) => values.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn records(&self) -> &[Record] {
        match self {
            QueryOutput::Records(records) => records,
            _ => &[],
        }
    }

    pub fn into_records(self) -> Vec<Record> {
        match self {
            QueryOutput::Records(records) => records,
            _ => Vec::new(),
        }
    }

    pub fn into_rows(self) -> Vec<Vec<Value>> {
        match self {
            QueryOutput::Empty => Vec::new(),
            QueryOutput::Records(records) => records
                .into_iter()
                .map(|r| r.into_pairs().into_iter().map(|(_, v)| v).collect())
                .collect(),
            QueryOutput::Rows(rows) => rows,
            QueryOutput::Column(values) => values.into_iter().map(|v| vec![v]).collect(),
        }
    }

    pub fn into_column(self) -> Vec<Value> {
        match self {
            QueryOutput::Column(values) => values,
            other => other
                .into_rows()
                .into_iter()
                .filter_map(|row| row.into_iter().next())
                .collect(),
        }
    }
}

impl Serialize for QueryOutput {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            QueryOutput::Empty => serializer.serialize_seq(Some(0))?.end(),
            QueryOutput::Records(records) => records.serialize(serializer),
            QueryOutput::Rows(rows) => rows.serialize(serializer),
            QueryOutput::Column(values) => values.serialize(serializer),
        }
    }
}

/// How raw rows are reshaped.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ShapeOptions {
    pub as_dict: bool,
    pub as_list: bool,
    /// Sequences with text values returned as UTF-8 bytes
    pub as_utf8: bool,
    pub pluck: bool,
    /// Fields merged into every mapping
    pub update: Option<Record>,
}

/// Reshapes a raw result. `pluck` wins over `as_list`, which wins over
/// `as_dict`, which wins over the plain sequence forms.
pub fn shape(raw: RawResult, options: &ShapeOptions) -> QueryOutput {
    if !raw.has_result_set() {
        return QueryOutput::Empty;
    }
    let RawResult { columns, rows } = raw;

    if options.pluck {
        return QueryOutput::Column(rows.into_iter().filter_map(|row| row.into_iter().next()).collect());
    }

    if options.as_dict && !options.as_list {
        return QueryOutput::Records(
            rows.into_iter()
                .map(|row| {
                    let mut record: Record = columns
                        .iter()
                        .cloned()
                        .zip(row.into_iter().map(|v| if options.as_utf8 { v.into_utf8_bytes() } else { v }))
                        .collect();
                    if let Some(update) = &options.update {
                        record.merge(update);
                    }
                    record
                })
                .collect(),
        );
    }

    if options.as_utf8 {
        return QueryOutput::Rows(
            rows.into_iter()
                .map(|row| row.into_iter().map(Value::into_utf8_bytes).collect())
                .collect(),
        );
    }

    QueryOutput::Rows(rows)
}

/// A single-row lookup result.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum LookupValue {
    Record(Record),
    Row(Vec<Value>),
    Scalar(Value),
}

impl LookupValue {
    pub fn as_scalar(&self) -> Option<&Value> {
        match self {
            LookupValue::Scalar(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_record(&self) -> Option<&Record> {
        match self {
            LookupValue::Record(r) => Some(r),
            _ => None,
        }
    }

    pub fn into_record(self) -> Option<Record> {
        match self {
            LookupValue::Record(r) => Some(r),
            _ => None,
        }
    }

    pub fn into_scalar(self) -> Option<Value> {
        match self {
            LookupValue::Scalar(v) => Some(v),
            _ => None,
        }
    }
}

/// First row of `output`; `None` when there is none.
///
/// A one-column row comes back as a bare scalar unless `as_dict` asks for a
/// container.
pub fn single(output: QueryOutput, as_dict: bool) -> Option<LookupValue> {
    match output {
        QueryOutput::Empty => None,
        QueryOutput::Records(records) => records.into_iter().next().map(LookupValue::Record),
        QueryOutput::Column(values) => values.into_iter().next().map(LookupValue::Scalar),
        QueryOutput::Rows(rows) => rows.into_iter().next().map(|mut row| {
            if row.len() == 1 && !as_dict {
                LookupValue::Scalar(row.remove(0))
            } else {
                LookupValue::Row(row)
            }
        }),
    }
}
