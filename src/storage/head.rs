//! The head: every active series plus the postings index over their labels
//!
//! # Write Path
//!
//! ```text
//! appender(labels) ─► get_or_create ─► HeadAppender::append(profile)
//!                     (read probe,        │
//!                      write re-probe,    └─► MemSeries::append_with (per-series lock)
//!                      id + map + index)        └─► widen head min/max time
//! ```
//!
//! # Read Path
//!
//! ```text
//! querier(mint, maxt).select(matchers)
//!   └─► postings_for_matchers ─► ascending IDs ─► SeriesHandle::iterator()
//! ```
//!
//! # Example
//!
//! ```rust
//! use kuba_profstore::config::HeadConfig;
//! use kuba_profstore::index::Matcher;
//! use kuba_profstore::profile::{Profile, ProfileTreeBuilder, SampleLabels};
//! use kuba_profstore::storage::Head;
//! use kuba_profstore::types::{Labels, ProfileMeta};
//! use prometheus::Registry;
//!
//! let head = Head::new(HeadConfig::default(), &Registry::new()).unwrap();
//!
//! let mut tree = ProfileTreeBuilder::new();
//! tree.add_sample(&[2, 1], 10, SampleLabels::default());
//! let profile = Profile {
//!     meta: ProfileMeta { timestamp: 1000, ..Default::default() },
//!     tree: tree.build(),
//! };
//! head.appender(Labels::from_pairs(&[("job", "api")]))
//!     .append(&profile)
//!     .unwrap();
//!
//! let querier = head.querier(0, 2000).unwrap();
//! let mut set = querier.select(&[Matcher::equal("job", "api")]).unwrap();
//! let series = set.next().unwrap();
//! let rows: Vec<_> = series.iterator().collect();
//! assert_eq!(rows[0].tree.total(), 10);
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use prometheus::Registry;
use tracing::{debug, warn};

use super::series::{MemSeries, MemSeriesIterator};
use crate::compression::ChunkPool;
use crate::config::HeadConfig;
use crate::error::{Error, IndexError, Result, StorageError};
use crate::index::{
    label_names_with_matchers, label_values_with_matchers, postings_for_matchers, MatchType,
    Matcher, MemPostings,
};
use crate::metrics::HeadMetrics;
use crate::profile::Profile;
use crate::types::{Labels, SeriesId, TimeRange};

#[derive(Debug, Default)]
struct SeriesMap {
    by_labels: HashMap<Labels, Arc<MemSeries>>,
    by_id: HashMap<SeriesId, Arc<MemSeries>>,
}

/// In-memory store of all active series
#[derive(Debug)]
pub struct Head {
    config: HeadConfig,
    pool: Arc<ChunkPool>,
    metrics: Arc<HeadMetrics>,

    /// Lowest stored timestamp; `i64::MAX` until the first append
    min_time: AtomicI64,

    /// Highest stored timestamp; `i64::MIN` until the first append
    max_time: AtomicI64,

    next_id: AtomicU64,
    series: RwLock<SeriesMap>,
    postings: MemPostings,
}

/// Point-in-time head statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeadStats {
    /// Number of series
    pub num_series: usize,
    /// Lowest stored timestamp (`i64::MAX` while empty)
    pub min_time: i64,
    /// Highest stored timestamp (`i64::MIN` while empty)
    pub max_time: i64,
}

impl Head {
    /// Create a head whose metrics are registered into `registry`
    pub fn new(config: HeadConfig, registry: &Registry) -> Result<Self> {
        let pool = Arc::new(ChunkPool::new(config.chunk_pool_capacity));
        let metrics = Arc::new(HeadMetrics::register(registry)?);
        Self::with_parts(config, pool, metrics)
    }

    /// Create a head from an explicit chunk pool and metrics handle
    pub fn with_parts(
        config: HeadConfig,
        pool: Arc<ChunkPool>,
        metrics: Arc<HeadMetrics>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            pool,
            metrics,
            min_time: AtomicI64::new(i64::MAX),
            max_time: AtomicI64::new(i64::MIN),
            next_id: AtomicU64::new(0),
            series: RwLock::new(SeriesMap::default()),
            postings: MemPostings::new(),
        })
    }

    /// Head configuration
    pub fn config(&self) -> &HeadConfig {
        &self.config
    }

    /// Chunk pool shared by all series
    pub fn pool(&self) -> &Arc<ChunkPool> {
        &self.pool
    }

    /// Metrics handle
    pub fn metrics(&self) -> &Arc<HeadMetrics> {
        &self.metrics
    }

    /// Series for `labels`, created on first use
    ///
    /// Returns the series and whether it was created by this call.
    pub fn get_or_create(&self, labels: Labels) -> (Arc<MemSeries>, bool) {
        if let Some(series) = self.series.read().by_labels.get(&labels) {
            return (Arc::clone(series), false);
        }

        let mut map = self.series.write();
        // another writer may have won the race for the write lock
        if let Some(series) = map.by_labels.get(&labels) {
            return (Arc::clone(series), false);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let series = Arc::new(MemSeries::new(
            id,
            labels.clone(),
            Arc::clone(&self.pool),
            self.config.samples_per_chunk,
        ));
        map.by_id.insert(id, Arc::clone(&series));
        map.by_labels.insert(labels, Arc::clone(&series));
        // still under the series lock: an ID visible in postings is always in the map
        self.postings.add(id, series.labels());
        let total = map.by_id.len();
        drop(map);

        self.metrics.record_series_created(total);
        debug!(series_id = id, labels = %series.labels(), "created series");
        (series, true)
    }

    /// Appender for the series identified by `labels`
    pub fn appender(&self, labels: Labels) -> HeadAppender<'_> {
        let (series, _) = self.get_or_create(labels);
        HeadAppender { head: self, series }
    }

    /// Series by ID
    pub fn series(&self, id: SeriesId) -> Result<Arc<MemSeries>> {
        self.series
            .read()
            .by_id
            .get(&id)
            .cloned()
            .ok_or_else(|| StorageError::SeriesNotFound(id).into())
    }

    /// Series by label set
    pub fn series_by_labels(&self, labels: &Labels) -> Result<Arc<MemSeries>> {
        self.series
            .read()
            .by_labels
            .get(labels)
            .cloned()
            .ok_or_else(|| IndexError::NotFound(format!("series {}", labels)).into())
    }

    /// Number of series
    pub fn num_series(&self) -> usize {
        self.series.read().by_id.len()
    }

    /// Lowest stored timestamp (`i64::MAX` while empty)
    pub fn min_time(&self) -> i64 {
        self.min_time.load(Ordering::Acquire)
    }

    /// Highest stored timestamp (`i64::MIN` while empty)
    pub fn max_time(&self) -> i64 {
        self.max_time.load(Ordering::Acquire)
    }

    /// Stored time range, `None` while nothing has been appended
    pub fn time_range(&self) -> Option<TimeRange> {
        TimeRange::new(self.min_time(), self.max_time()).ok()
    }

    /// Get a snapshot of head statistics
    pub fn stats(&self) -> HeadStats {
        HeadStats {
            num_series: self.num_series(),
            min_time: self.min_time(),
            max_time: self.max_time(),
        }
    }

    /// Sorted label names across all series
    pub fn label_names(&self) -> Vec<String> {
        self.postings.label_names()
    }

    /// Sorted values of label `name` across all series
    pub fn label_values(&self, name: &str) -> Vec<String> {
        self.postings.label_values(name)
    }

    /// Querier over `[mint, maxt]`
    pub fn querier(&self, mint: i64, maxt: i64) -> Result<HeadQuerier<'_>> {
        Ok(HeadQuerier {
            head: self,
            range: TimeRange::new(mint, maxt)?,
        })
    }

    fn observe_timestamp(&self, timestamp: i64) {
        if widen(&self.min_time, timestamp, |new, cur| new < cur) == i64::MAX {
            debug!(timestamp, "initialised head time range");
        }
        widen(&self.max_time, timestamp, |new, cur| new > cur);
    }

    fn check_matchers(&self, matchers: &[Matcher]) -> Result<()> {
        let limit = self.config.max_regex_len;
        for m in matchers {
            let is_regex = matches!(m.match_type(), MatchType::Regex | MatchType::NotRegex);
            if is_regex && m.value().len() > limit {
                return Err(IndexError::InvalidMatcher(format!(
                    "Regex pattern too long: {} chars (max: {})",
                    m.value().len(),
                    limit
                ))
                .into());
            }
        }
        Ok(())
    }
}

/// CAS `bound` towards `value` while `wider(value, current)`; returns the prior value
fn widen(bound: &AtomicI64, value: i64, wider: impl Fn(i64, i64) -> bool) -> i64 {
    let mut current = bound.load(Ordering::Acquire);
    while wider(value, current) {
        match bound.compare_exchange_weak(current, value, Ordering::AcqRel, Ordering::Acquire) {
            Ok(prev) => return prev,
            Err(actual) => current = actual,
        }
    }
    current
}

/// Appends profiles to one series of a [`Head`]
#[derive(Debug)]
pub struct HeadAppender<'a> {
    head: &'a Head,
    series: Arc<MemSeries>,
}

impl HeadAppender<'_> {
    /// Series this appender writes to
    pub fn series(&self) -> &Arc<MemSeries> {
        &self.series
    }

    /// Append one profile
    ///
    /// Rejected appends leave the series and the head's time range unchanged.
    pub fn append(&self, profile: &Profile) -> Result<()> {
        let metrics = &self.head.metrics;
        let timestamp = profile.meta.timestamp;

        // bounds widen before the series lock is released
        let appended = self
            .series
            .append_with(profile, |ts| self.head.observe_timestamp(ts));
        if let Err(err) = appended {
            match &err {
                Error::Storage(StorageError::OutOfOrderSample { max_time, .. }) => {
                    metrics.record_out_of_order();
                    warn!(
                        series_id = self.series.id(),
                        timestamp,
                        max_time,
                        "rejected out of order profile"
                    );
                }
                Error::Storage(StorageError::SchemaMismatch { field, .. }) => {
                    metrics.record_schema_mismatch();
                    warn!(series_id = self.series.id(), field, "rejected profile schema change");
                }
                _ => {}
            }
            return Err(err);
        }

        metrics.record_append(self.head.min_time(), self.head.max_time());
        Ok(())
    }
}

/// Time-bounded read access to a [`Head`]
#[derive(Debug, Clone, Copy)]
pub struct HeadQuerier<'a> {
    head: &'a Head,
    range: TimeRange,
}

impl HeadQuerier<'_> {
    /// Queried time range
    pub fn range(&self) -> TimeRange {
        self.range
    }

    /// Series matching all `matchers` with samples in range, in ascending ID order
    pub fn select(&self, matchers: &[Matcher]) -> Result<SeriesSet> {
        self.head.check_matchers(matchers)?;

        let start = Instant::now();
        let postings = postings_for_matchers(&self.head.postings, matchers)?;
        self.head
            .metrics
            .observe_select(start.elapsed().as_secs_f64());

        let map = self.head.series.read();
        let handles = postings
            .iter()
            .filter_map(|id| map.by_id.get(&id))
            .filter(|series| {
                series
                    .time_bounds()
                    .is_some_and(|(min, max)| self.range.overlaps(min, max))
            })
            .map(|series| SeriesHandle {
                series: Arc::clone(series),
                range: self.range,
            })
            .collect();

        Ok(SeriesSet { handles })
    }

    /// Sorted values of `name` on series selected by `matchers`
    pub fn label_values(&self, name: &str, matchers: &[Matcher]) -> Result<Vec<String>> {
        self.head.check_matchers(matchers)?;
        label_values_with_matchers(&self.head.postings, name, matchers)
    }

    /// Sorted label names on series selected by `matchers`
    pub fn label_names(&self, matchers: &[Matcher]) -> Result<Vec<String>> {
        self.head.check_matchers(matchers)?;
        label_names_with_matchers(&self.head.postings, matchers)
    }
}

/// Result of [`HeadQuerier::select`]
#[derive(Debug, Default)]
pub struct SeriesSet {
    handles: VecDeque<SeriesHandle>,
}

impl SeriesSet {
    /// Number of series left
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// Check if no series are left
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}

impl Iterator for SeriesSet {
    type Item = SeriesHandle;

    fn next(&mut self) -> Option<SeriesHandle> {
        self.handles.pop_front()
    }
}

/// One selected series
#[derive(Debug, Clone)]
pub struct SeriesHandle {
    series: Arc<MemSeries>,
    range: TimeRange,
}

impl SeriesHandle {
    /// Series ID
    pub fn id(&self) -> SeriesId {
        self.series.id()
    }

    /// Series labels
    pub fn labels(&self) -> &Labels {
        self.series.labels()
    }

    /// Profiles of the series within the querier's range
    pub fn iterator(&self) -> MemSeriesIterator {
        self.series.iterator(self.range)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::{ProfileTreeBuilder, SampleLabels};
    use crate::types::ProfileMeta;
    use std::thread;

    fn head() -> Head {
        Head::new(HeadConfig::default(), &Registry::new()).unwrap()
    }

    fn profile(timestamp: i64, value: i64) -> Profile {
        let mut b = ProfileTreeBuilder::new();
        b.add_sample(&[2, 1], value, SampleLabels::default());
        Profile {
            meta: ProfileMeta {
                timestamp,
                ..Default::default()
            },
            tree: b.build(),
        }
    }

    fn ids(set: SeriesSet) -> Vec<SeriesId> {
        set.map(|h| h.id()).collect()
    }

    #[test]
    fn test_get_or_create_is_idempotent() {
        let head = head();
        let (a, created_a) = head.get_or_create(Labels::from_pairs(&[("job", "api")]));
        let (b, created_b) = head.get_or_create(Labels::from_pairs(&[("job", "api")]));
        let (c, _) = head.get_or_create(Labels::from_pairs(&[("job", "db")]));

        assert!(created_a);
        assert!(!created_b);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!((a.id(), c.id()), (0, 1));
        assert_eq!(head.num_series(), 2);
        assert_eq!(head.label_values("job"), vec!["api", "db"]);
    }

    #[test]
    fn test_time_range_initialised_then_widened() {
        let head = head();
        assert_eq!(head.time_range(), None);

        head.appender(Labels::from_pairs(&[("a", "1")]))
            .append(&profile(500, 1))
            .unwrap();
        assert_eq!(head.time_range(), Some(TimeRange::new(500, 500).unwrap()));

        head.appender(Labels::from_pairs(&[("a", "2")]))
            .append(&profile(100, 1))
            .unwrap();
        head.appender(Labels::from_pairs(&[("a", "1")]))
            .append(&profile(900, 1))
            .unwrap();

        let stats = head.stats();
        assert_eq!((stats.min_time, stats.max_time), (100, 900));
        assert_eq!(stats.num_series, 2);
    }

    #[test]
    fn test_rejected_append_is_counted() {
        let head = head();
        let app = head.appender(Labels::from_pairs(&[("a", "1")]));
        app.append(&profile(10, 1)).unwrap();
        assert!(app.append(&profile(10, 2)).is_err());

        assert_eq!(app.series().num_samples(), 1);
        assert_eq!(head.metrics().out_of_order_samples.get(), 1);
        assert_eq!(head.metrics().samples_appended.get(), 1);
        assert_eq!((head.min_time(), head.max_time()), (10, 10));
    }

    #[test]
    fn test_select_filters_by_time_range() {
        let head = head();
        head.appender(Labels::from_pairs(&[("job", "a")]))
            .append(&profile(100, 1))
            .unwrap();
        head.appender(Labels::from_pairs(&[("job", "b")]))
            .append(&profile(300, 1))
            .unwrap();
        // created but never written
        head.get_or_create(Labels::from_pairs(&[("job", "c")]));

        let all = Matcher::not_equal("job", "");
        assert_eq!(ids(head.querier(0, 1000).unwrap().select(&[all.clone()]).unwrap()), vec![0, 1]);
        assert_eq!(ids(head.querier(200, 1000).unwrap().select(&[all.clone()]).unwrap()), vec![1]);
        assert!(head.querier(400, 1000).unwrap().select(&[all]).unwrap().is_empty());
        assert!(head.querier(10, 0).is_err());
    }

    #[test]
    fn test_matcher_length_limit_from_config() {
        let config = HeadConfig {
            max_regex_len: 3,
            ..HeadConfig::default()
        };
        let head = Head::new(config, &Registry::new()).unwrap();
        let querier = head.querier(0, 1).unwrap();

        assert!(querier.select(&[Matcher::regex("a", "b|cd").unwrap()]).is_err());
        assert!(querier.select(&[Matcher::equal("a", "long value")]).is_ok());
    }

    #[test]
    fn test_lookup_misses() {
        let head = head();
        assert!(matches!(
            head.series(42),
            Err(Error::Storage(StorageError::SeriesNotFound(42)))
        ));
        assert!(matches!(
            head.series_by_labels(&Labels::from_pairs(&[("x", "y")])),
            Err(Error::Index(IndexError::NotFound(_)))
        ));
    }

    #[test]
    fn test_concurrent_get_or_create_yields_one_series() {
        let head = Arc::new(head());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let head = Arc::clone(&head);
                thread::spawn(move || {
                    (0..50)
                        .map(|i| {
                            let value = i.to_string();
                            head.get_or_create(Labels::from_pairs(&[("i", value.as_str())]))
                                .0
                                .id()
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let results: Vec<Vec<SeriesId>> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        for r in &results[1..] {
            assert_eq!(r, &results[0]);
        }
        assert_eq!(head.num_series(), 50);
        assert_eq!(head.metrics().series_created.get(), 50);
    }
}
