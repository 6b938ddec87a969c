//! In-memory profile storage
//!
//! # Architecture
//!
//! ```text
//! Head
//!  ├─ MemPostings               (name, value) -> series IDs
//!  └─ MemSeries (one per label set)
//!      └─ chunk sets of up to `samples_per_chunk` rows
//!          ├─ timestamps   Delta
//!          ├─ durations    RLE
//!          ├─ periods      RLE
//!          └─ per tree node: flat / cumulative   XOR
//! ```
//!
//! # Key Components
//!
//! - **MemSeries**: columnar storage for one series, one row per profile
//! - **Head**: series registry, postings index and head time range
//! - **HeadQuerier**: matcher-based selection over a time range

/// Head of the store: series registry, appenders and queriers
pub mod head;
/// Columnar storage for a single series
pub mod series;

pub use head::{Head, HeadAppender, HeadQuerier, HeadStats, SeriesHandle, SeriesSet};
pub use series::{MemSeries, MemSeriesIterator};
