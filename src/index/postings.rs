//! In-memory postings: `(name, value)` to roaring bitmap of series IDs
//!
//! # Layout
//!
//! ```text
//! ""    -> { ""    -> {0, 1, 2, 3, 4} }   all-postings bucket
//! "n"   -> { "1"   -> {0, 1, 2},
//!            "2"   -> {3},
//!            "2.5" -> {4} }
//! "i"   -> { "a"   -> {1},
//!            "b"   -> {2} }
//! ```
//!
//! The whole map sits behind one `parking_lot::RwLock`: `add` takes the write
//! lock once per series, lookups share the read lock and hand back cloned
//! bitmaps so concurrent writers never touch a caller's result.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use roaring::RoaringTreemap;

use super::{IndexReader, ALL_POSTINGS_NAME, ALL_POSTINGS_VALUE, SENTINEL_ID};
use crate::error::Result;
use crate::types::{Labels, SeriesId};

/// In-memory inverted index
#[derive(Debug, Default)]
pub struct MemPostings {
    /// name -> value -> series IDs
    postings: RwLock<HashMap<String, HashMap<String, RoaringTreemap>>>,

    /// Lookup counters
    stats: PostingsStats,
}

/// Postings lookup counters
#[derive(Debug, Default)]
pub struct PostingsStats {
    /// Lookups that found at least one series
    pub hits: AtomicU64,

    /// Lookups answered with the sentinel only
    pub misses: AtomicU64,
}

fn sentinel() -> RoaringTreemap {
    let mut bitmap = RoaringTreemap::new();
    bitmap.insert(SENTINEL_ID);
    bitmap
}

impl MemPostings {
    /// Create an empty index
    pub fn new() -> Self {
        Self::default()
    }

    /// Register series `id` under every label of `labels` and under all-postings
    pub fn add(&self, id: SeriesId, labels: &Labels) {
        debug_assert_ne!(id, SENTINEL_ID);
        let mut postings = self.postings.write();
        for label in labels.iter() {
            postings
                .entry(label.name.clone())
                .or_default()
                .entry(label.value.clone())
                .or_default()
                .insert(id);
        }
        postings
            .entry(ALL_POSTINGS_NAME.to_string())
            .or_default()
            .entry(ALL_POSTINGS_VALUE.to_string())
            .or_default()
            .insert(id);
    }

    /// Copy of the postings of `(name, value)`
    ///
    /// An unknown pair yields a bitmap holding only [`SENTINEL_ID`].
    pub fn get(&self, name: &str, value: &str) -> RoaringTreemap {
        self.get_any(name, &[value])
    }

    /// Union of the postings of `name` for each of `values`
    pub fn get_any(&self, name: &str, values: &[&str]) -> RoaringTreemap {
        let mut result = RoaringTreemap::new();
        {
            let postings = self.postings.read();
            if let Some(by_value) = postings.get(name) {
                for value in values {
                    if let Some(ids) = by_value.get(*value) {
                        result |= ids;
                    }
                }
            }
        }

        if result.is_empty() {
            self.stats.misses.fetch_add(1, Ordering::Relaxed);
            return sentinel();
        }
        self.stats.hits.fetch_add(1, Ordering::Relaxed);
        result
    }

    /// Copy of the all-postings bucket
    pub fn all(&self) -> RoaringTreemap {
        self.get(ALL_POSTINGS_NAME, ALL_POSTINGS_VALUE)
    }

    /// Number of registered series
    pub fn num_series(&self) -> u64 {
        self.postings
            .read()
            .get(ALL_POSTINGS_NAME)
            .and_then(|by_value| by_value.get(ALL_POSTINGS_VALUE))
            .map_or(0, |ids| ids.len())
    }

    /// Sorted label names, excluding the all-postings key
    pub fn label_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .postings
            .read()
            .keys()
            .filter(|name| name.as_str() != ALL_POSTINGS_NAME)
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Sorted values of label `name`
    pub fn label_values(&self, name: &str) -> Vec<String> {
        if name == ALL_POSTINGS_NAME {
            return Vec::new();
        }
        let mut values: Vec<String> = self
            .postings
            .read()
            .get(name)
            .map(|by_value| by_value.keys().cloned().collect())
            .unwrap_or_default();
        values.sort();
        values
    }

    /// Lookup counters as `(hits, misses)`
    pub fn stats(&self) -> (u64, u64) {
        (
            self.stats.hits.load(Ordering::Relaxed),
            self.stats.misses.load(Ordering::Relaxed),
        )
    }
}

impl IndexReader for MemPostings {
    fn postings(&self, name: &str, values: &[&str]) -> Result<RoaringTreemap> {
        Ok(self.get_any(name, values))
    }

    fn label_values(&self, name: &str) -> Result<Vec<String>> {
        Ok(MemPostings::label_values(self, name))
    }

    fn label_names(&self) -> Result<Vec<String>> {
        Ok(MemPostings::label_names(self))
    }
}
