/// Point-Lookup Cache
///
/// Session-local read-through cache for lookups of a single named record.
/// Entries live until the session clears them; there is no eviction.

use crate::shaper::QueryOutput;
use std::collections::HashMap;

/// Key of one cached lookup: table, named key, field list and the shape
/// the stored result was built with.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub table: String,
    pub key: String,
    pub fields: String,
    pub shape: String,
}

impl CacheKey {
    pub fn new(table: &str, key: &str, fields: &str, shape: &str) -> Self {
        CacheKey {
            table: table.to_string(),
            key: key.to_string(),
            fields: fields.to_string(),
            shape: shape.to_string(),
        }
    }
}

#[derive(Debug, Default)]
pub struct PointLookupCache {
    entries: HashMap<CacheKey, QueryOutput>,
    hits: u64,
    misses: u64,
}

impl PointLookupCache {
    /// Returns a copy of the stored result and counts the hit or miss.
    pub fn get(&mut self, key: &CacheKey) -> Option<QueryOutput> {
        match self.entries.get(key) {
            Some(output) => {
                self.hits += 1;
                Some(output.clone())
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    pub fn insert(&mut self, key: CacheKey, output: QueryOutput) {
        self.entries.insert(key, output);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// (hits, misses) since the cache was created.
    pub fn stats(&self) -> (u64, u64) {
        (self.hits, self.misses)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
