//! Core data types used throughout the profile store
//!
//! # Key Types
//!
//! - **`SeriesId`**: Monotonically assigned identifier of a series
//! - **`Label`** / **`Labels`**: The sorted label set that identifies a series
//! - **`TimeRange`**: Inclusive time window for queries
//! - **`ValueType`** / **`ProfileMeta`**: Per-profile schema and timing metadata
//!
//! # Example
//!
//! ```rust
//! use kuba_profstore::types::{Labels, TimeRange};
//!
//! let labels = Labels::from_pairs(&[("job", "api"), ("instance", "host-1")]);
//! assert_eq!(labels.get("job"), Some("api"));
//! assert_eq!(labels.to_string(), r#"{instance="host-1", job="api"}"#);
//!
//! let range = TimeRange::new(1000, 2000).unwrap();
//! assert!(range.contains(1500));
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique identifier for a series
///
/// IDs are handed out by the head in strictly increasing order starting at 0.
/// `u64::MAX` is reserved as the postings sentinel and is never assigned.
pub type SeriesId = u64;

/// A single label name/value pair
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Label {
    /// Label name
    pub name: String,
    /// Label value
    pub value: String,
}

impl Label {
    /// Create a new label
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// A label set, sorted by name
///
/// Labels with an empty value are dropped on construction: a label set to
/// the empty string is indistinguishable from an absent label. When a name
/// appears more than once the first occurrence wins.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Labels(Vec<Label>);

impl Labels {
    /// Build a label set from arbitrary labels
    pub fn new(labels: impl IntoIterator<Item = Label>) -> Self {
        let mut labels: Vec<Label> = labels
            .into_iter()
            .filter(|l| !l.value.is_empty())
            .collect();
        // stable sort keeps the first occurrence ahead of later duplicates
        labels.sort_by(|a, b| a.name.cmp(&b.name));
        labels.dedup_by(|later, earlier| later.name == earlier.name);
        Self(labels)
    }

    /// Build a label set from `(name, value)` pairs
    pub fn from_pairs(pairs: &[(&str, &str)]) -> Self {
        Self::new(pairs.iter().map(|(n, v)| Label::new(*n, *v)))
    }

    /// Value of the label called `name`
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .binary_search_by(|l| l.name.as_str().cmp(name))
            .ok()
            .map(|i| self.0[i].value.as_str())
    }

    /// Iterate labels in name order
    pub fn iter(&self) -> impl Iterator<Item = &Label> {
        self.0.iter()
    }

    /// Number of labels
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Check if the label set is empty
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Labels {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, label) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}={:?}", label.name, label.value)?;
        }
        write!(f, "}}")
    }
}

/// Time range for queries (inclusive on both ends)
///
/// # Example
///
/// ```rust
/// use kuba_profstore::types::TimeRange;
///
/// let range = TimeRange::new(1000, 2000).unwrap();
/// assert!(range.contains(1000));
/// assert!(range.contains(2000));
/// assert!(!range.contains(2001));
/// assert!(TimeRange::new(2000, 1000).is_err());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    /// Start timestamp in milliseconds (inclusive)
    pub start: i64,

    /// End timestamp in milliseconds (inclusive)
    pub end: i64,
}

impl TimeRange {
    /// Create a new time range, rejecting `start > end`
    pub fn new(start: i64, end: i64) -> Result<Self, crate::error::Error> {
        if start > end {
            return Err(crate::error::Error::Configuration(format!(
                "Invalid time range: start {} > end {}",
                start, end
            )));
        }
        Ok(Self { start, end })
    }

    /// Check if a timestamp falls within this range (inclusive)
    pub fn contains(&self, timestamp: i64) -> bool {
        timestamp >= self.start && timestamp <= self.end
    }

    /// Check if `[min, max]` intersects this range
    pub fn overlaps(&self, min: i64, max: i64) -> bool {
        min <= self.end && max >= self.start
    }
}

impl Default for TimeRange {
    fn default() -> Self {
        Self {
            start: i64::MIN,
            end: i64::MAX,
        }
    }
}

/// Kind and unit of a sample or period value (e.g. `cpu`/`nanoseconds`)
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ValueType {
    /// Value kind
    pub kind: String,
    /// Value unit
    pub unit: String,
}

impl ValueType {
    /// Create a new value type
    pub fn new(kind: impl Into<String>, unit: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            unit: unit.into(),
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.unit)
    }
}

/// Metadata of one profile: schema plus the timestamp/duration/period row
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileMeta {
    /// Type of the sampling period
    pub period_type: ValueType,
    /// Type of the sample values
    pub sample_type: ValueType,
    /// Profile timestamp in milliseconds
    pub timestamp: i64,
    /// Profiling duration in nanoseconds
    pub duration: i64,
    /// Sampling period
    pub period: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_labels_sorted_and_deduplicated() {
        let labels = Labels::new(vec![
            Label::new("z", "1"),
            Label::new("a", "2"),
            Label::new("z", "3"),
            Label::new("empty", ""),
        ]);

        let names: Vec<&str> = labels.iter().map(|l| l.name.as_str()).collect();
        assert_eq!(names, vec!["a", "z"]);
        assert_eq!(labels.get("z"), Some("1"));
        assert_eq!(labels.get("empty"), None);
    }

    #[test]
    fn test_labels_equal_regardless_of_input_order() {
        let a = Labels::from_pairs(&[("n", "1"), ("i", "a")]);
        let b = Labels::from_pairs(&[("i", "a"), ("n", "1")]);
        assert_eq!(a, b);
    }

    #[test]
    fn test_time_range_overlaps() {
        let range = TimeRange::new(100, 200).unwrap();
        assert!(range.overlaps(50, 100));
        assert!(range.overlaps(200, 300));
        assert!(!range.overlaps(201, 300));
        assert!(!range.overlaps(0, 99));
    }
}
