//! Inverted index over series labels
//!
//! Every `(label name, label value)` pair maps to a compressed bitmap of the
//! IDs of the series carrying it. Label matchers are resolved into a single
//! candidate bitmap using only these lookups, never a scan over series.
//!
//! # Components
//!
//! - [`postings::MemPostings`]: the in-memory index (roaring bitmaps behind one lock)
//! - [`matcher::Matcher`]: equal / not-equal / regex / not-regex label predicate
//! - [`resolver`]: boolean algebra turning a matcher conjunction into postings
//!
//! # Example
//!
//! ```rust
//! use kuba_profstore::index::{postings_for_matchers, Matcher, MemPostings};
//! use kuba_profstore::types::Labels;
//!
//! let index = MemPostings::new();
//! index.add(0, &Labels::from_pairs(&[("job", "api")]));
//! index.add(1, &Labels::from_pairs(&[("job", "db")]));
//!
//! let ids = postings_for_matchers(&index, &[Matcher::regex("job", "api|web").unwrap()]).unwrap();
//! assert_eq!(ids.iter().collect::<Vec<_>>(), vec![0]);
//! ```

pub mod matcher;
pub mod postings;
pub mod resolver;

use roaring::RoaringTreemap;

use crate::error::Result;
use crate::types::SeriesId;

pub use matcher::{MatchType, Matcher};
pub use postings::MemPostings;
pub use resolver::{
    find_set_matches, label_names_with_matchers, label_values_with_matchers,
    postings_for_matchers,
};

/// Reserved ID marking "looked up, found nothing"; never a real series
pub const SENTINEL_ID: SeriesId = u64::MAX;

/// Label name of the bucket holding every registered series
pub const ALL_POSTINGS_NAME: &str = "";

/// Label value of the bucket holding every registered series
pub const ALL_POSTINGS_VALUE: &str = "";

/// Read access to an inverted index
///
/// Returned bitmaps are independent copies; callers may mutate them freely.
pub trait IndexReader {
    /// Union of the postings of `name` for each of `values`
    ///
    /// A lookup that finds nothing returns a bitmap holding only
    /// [`SENTINEL_ID`].
    fn postings(&self, name: &str, values: &[&str]) -> Result<RoaringTreemap>;

    /// Sorted values of label `name`
    fn label_values(&self, name: &str) -> Result<Vec<String>>;

    /// Sorted label names
    fn label_names(&self) -> Result<Vec<String>>;

    /// Postings of every registered series
    fn all_postings(&self) -> Result<RoaringTreemap> {
        self.postings(ALL_POSTINGS_NAME, &[ALL_POSTINGS_VALUE])
    }
}
