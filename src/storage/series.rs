//! Columnar, chunk-encoded storage of one series
//!
//! A series stores every appended profile as one row spread over several
//! columns, each column living in its own chunk:
//!
//! ```text
//! row:            0     1     2     3
//! timestamps:   1000  1010  1020  1030      Delta
//! durations:      10    10    10    10      RLE
//! periods:       100   100   100   100      RLE
//! [main] flat:     3     0     4     1      XOR
//! [main] cum:     10     8     9     1      XOR
//! [main,gc] cum:   2                        XOR (shorter: reads as 0)
//! ```
//!
//! Value chunks are created lazily the first time their [`NodeKey`] carries a
//! non-zero value and are written with `append_at(row + 1, v)`, so row *i* of
//! every column always describes the same profile.
//!
//! Every `samples_per_chunk` rows the series cuts a new chunk set for all of
//! its columns and compacts the previous one. Chunk sets record their
//! timestamp bounds so readers skip sets outside the queried range.
//!
//! # Concurrency
//!
//! All columns sit behind one `parking_lot::RwLock`. Appends take the write
//! lock; iterator construction copies the bytes of the overlapping chunks
//! under the read lock and then decodes without holding any lock.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;
use tracing::{trace, warn};

use crate::compression::{new_iterator, Chunk, ChunkIterator, ChunkPool, Encoding};
use crate::error::{Error, Result, StorageError};
use crate::profile::{InstantProfile, NodeKey, NodeValues, Profile, ProfileTreeBuilder};
use crate::types::{Labels, ProfileMeta, SeriesId, TimeRange, ValueType};

/// Chunks covering a contiguous run of rows
#[derive(Debug)]
struct ChunkSet {
    rows: usize,
    min_time: i64,
    max_time: i64,
    timestamps: Box<dyn Chunk>,
    durations: Box<dyn Chunk>,
    periods: Box<dyn Chunk>,
    flat: HashMap<NodeKey, Box<dyn Chunk>>,
    cumulative: HashMap<NodeKey, Box<dyn Chunk>>,
}

impl ChunkSet {
    fn new(pool: &ChunkPool) -> Self {
        Self {
            rows: 0,
            min_time: i64::MAX,
            max_time: i64::MIN,
            timestamps: pool.get(Encoding::Delta),
            durations: pool.get(Encoding::Rle),
            periods: pool.get(Encoding::Rle),
            flat: HashMap::new(),
            cumulative: HashMap::new(),
        }
    }

    fn chunks_mut(&mut self) -> impl Iterator<Item = &mut Box<dyn Chunk>> {
        [&mut self.timestamps, &mut self.durations, &mut self.periods]
            .into_iter()
            .chain(self.flat.values_mut())
            .chain(self.cumulative.values_mut())
    }

    fn release(self, pool: &ChunkPool) {
        pool.put(self.timestamps);
        pool.put(self.durations);
        pool.put(self.periods);
        for chunk in self.flat.into_values().chain(self.cumulative.into_values()) {
            pool.put(chunk);
        }
    }

    fn snapshot(&self) -> SetSnapshot {
        let copy = |chunks: &HashMap<NodeKey, Box<dyn Chunk>>| -> Vec<(NodeKey, Bytes)> {
            chunks
                .iter()
                .map(|(key, chunk)| (key.clone(), Bytes::copy_from_slice(chunk.bytes())))
                .collect()
        };
        SetSnapshot {
            timestamps: Bytes::copy_from_slice(self.timestamps.bytes()),
            durations: Bytes::copy_from_slice(self.durations.bytes()),
            periods: Bytes::copy_from_slice(self.periods.bytes()),
            flat: copy(&self.flat),
            cumulative: copy(&self.cumulative),
        }
    }
}

#[derive(Debug, Default)]
struct SeriesColumns {
    period_type: Option<ValueType>,
    sample_type: Option<ValueType>,
    num_samples: usize,
    min_time: i64,
    max_time: i64,
    sets: Vec<ChunkSet>,
}

/// One uniquely labeled, append-only stream of profiles
#[derive(Debug)]
pub struct MemSeries {
    id: SeriesId,
    labels: Labels,
    pool: Arc<ChunkPool>,
    samples_per_chunk: usize,
    columns: RwLock<SeriesColumns>,
}

impl MemSeries {
    /// Create an empty series drawing chunks from `pool`
    pub fn new(
        id: SeriesId,
        labels: Labels,
        pool: Arc<ChunkPool>,
        samples_per_chunk: u16,
    ) -> Self {
        Self {
            id,
            labels,
            pool,
            samples_per_chunk: samples_per_chunk.max(1) as usize,
            columns: RwLock::new(SeriesColumns::default()),
        }
    }

    /// Series ID
    pub fn id(&self) -> SeriesId {
        self.id
    }

    /// Label set identifying the series
    pub fn labels(&self) -> &Labels {
        &self.labels
    }

    /// Number of stored profiles
    pub fn num_samples(&self) -> usize {
        self.columns.read().num_samples
    }

    /// `(min, max)` timestamp stored, `None` while empty
    pub fn time_bounds(&self) -> Option<(i64, i64)> {
        let columns = self.columns.read();
        (columns.num_samples > 0).then_some((columns.min_time, columns.max_time))
    }

    /// Number of chunk sets cut so far
    pub fn num_chunk_sets(&self) -> usize {
        self.columns.read().sets.len()
    }

    /// Append one profile as a new row
    ///
    /// # Errors
    ///
    /// - `SchemaMismatch` if the period or sample type differs from the
    ///   series' first profile
    /// - `OutOfOrderSample` if the timestamp is not past the series' max time
    ///
    /// Both are detected before anything is written.
    pub fn append(&self, profile: &Profile) -> Result<()> {
        self.append_with(profile, |_| {})
    }

    /// Like [`MemSeries::append`], calling `on_commit` with the timestamp
    /// while the row is still invisible to readers
    pub fn append_with<F>(&self, profile: &Profile, on_commit: F) -> Result<()>
    where
        F: FnOnce(i64),
    {
        let meta = &profile.meta;
        let mut columns = self.columns.write();

        check_schema("period_type", &columns.period_type, &meta.period_type)?;
        check_schema("sample_type", &columns.sample_type, &meta.sample_type)?;
        if columns.num_samples > 0 && meta.timestamp <= columns.max_time {
            return Err(StorageError::OutOfOrderSample {
                series: self.id,
                timestamp: meta.timestamp,
                max_time: columns.max_time,
            }
            .into());
        }

        let values = profile.tree.node_values();

        let full = columns
            .sets
            .last()
            .map_or(true, |set| set.rows >= self.samples_per_chunk);
        if full {
            if let Some(prev) = columns.sets.last_mut() {
                for chunk in prev.chunks_mut() {
                    chunk.compact();
                }
            }
            columns.sets.push(ChunkSet::new(&self.pool));
            trace!(
                series_id = self.id,
                chunk_sets = columns.sets.len(),
                "cut chunk set"
            );
        }

        let pool = &self.pool;
        let last = columns.sets.len() - 1;
        let set = &mut columns.sets[last];
        let row = set.rows;

        set.timestamps.appender()?.append(meta.timestamp)?;
        set.durations.appender()?.append(meta.duration)?;
        set.periods.appender()?.append(meta.period)?;

        for (key, v) in values {
            if v.flat != 0 {
                set.flat
                    .entry(key.clone())
                    .or_insert_with(|| pool.get(Encoding::Xor))
                    .append_at(row + 1, v.flat)?;
            }
            if v.cumulative != 0 {
                set.cumulative
                    .entry(key)
                    .or_insert_with(|| pool.get(Encoding::Xor))
                    .append_at(row + 1, v.cumulative)?;
            }
        }

        set.rows += 1;
        set.min_time = set.min_time.min(meta.timestamp);
        set.max_time = set.max_time.max(meta.timestamp);

        if columns.num_samples == 0 {
            columns.min_time = meta.timestamp;
            columns.period_type = Some(meta.period_type.clone());
            columns.sample_type = Some(meta.sample_type.clone());
        }
        columns.max_time = meta.timestamp;
        columns.num_samples += 1;
        on_commit(meta.timestamp);
        Ok(())
    }

    /// Iterate the profiles whose timestamp lies in `range`
    ///
    /// Chunk bytes are copied under the read lock; appends made after this
    /// call are not visible to the iterator.
    pub fn iterator(&self, range: TimeRange) -> MemSeriesIterator {
        let columns = self.columns.read();
        let sets: VecDeque<SetSnapshot> = columns
            .sets
            .iter()
            .filter(|set| set.rows > 0 && range.overlaps(set.min_time, set.max_time))
            .map(ChunkSet::snapshot)
            .collect();

        MemSeriesIterator {
            series_id: self.id,
            range,
            period_type: columns.period_type.clone().unwrap_or_default(),
            sample_type: columns.sample_type.clone().unwrap_or_default(),
            sets,
            current: None,
            err: None,
        }
    }
}

impl Drop for MemSeries {
    fn drop(&mut self) {
        let columns = self.columns.get_mut();
        for set in columns.sets.drain(..) {
            set.release(&self.pool);
        }
    }
}

fn check_schema(
    field: &'static str,
    stored: &Option<ValueType>,
    actual: &ValueType,
) -> Result<()> {
    match stored {
        Some(expected) if expected != actual => Err(StorageError::SchemaMismatch {
            field,
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
        .into()),
        _ => Ok(()),
    }
}

/// Chunk bytes of one set, copied out of the series
#[derive(Debug)]
struct SetSnapshot {
    timestamps: Bytes,
    durations: Bytes,
    periods: Bytes,
    flat: Vec<(NodeKey, Bytes)>,
    cumulative: Vec<(NodeKey, Bytes)>,
}

type ColumnIterator = Box<dyn ChunkIterator + Send>;

/// Decoders over an opened set, positioned at the same row
struct OpenSet {
    timestamps: ColumnIterator,
    durations: ColumnIterator,
    periods: ColumnIterator,
    flat: Vec<(NodeKey, ColumnIterator)>,
    cumulative: Vec<(NodeKey, ColumnIterator)>,
}

/// Iterator over the profiles of one series within a time range
///
/// Decode failures end iteration; check [`MemSeriesIterator::err`] once
/// `next` has returned `None`.
pub struct MemSeriesIterator {
    series_id: SeriesId,
    range: TimeRange,
    period_type: ValueType,
    sample_type: ValueType,
    sets: VecDeque<SetSnapshot>,
    current: Option<OpenSet>,
    err: Option<Error>,
}

impl MemSeriesIterator {
    /// Error that stopped iteration, if any
    pub fn err(&self) -> Option<&Error> {
        self.err.as_ref()
    }

    fn fail(&mut self, err: Error) {
        warn!(series_id = self.series_id, error = %err, "series iteration failed");
        self.err = Some(err);
        self.current = None;
        self.sets.clear();
    }

    /// Position decoders on the first row at or after the range start
    fn open(&self, snap: SetSnapshot) -> Result<Option<OpenSet>> {
        let mut probe = new_iterator(Encoding::Delta, snap.timestamps.clone());
        let start = probe.by_ref().position(|ts| ts >= self.range.start);
        if let Some(err) = probe.err() {
            return Err(err.clone().into());
        }
        let Some(start) = start else {
            return Ok(None);
        };

        let open_column = |encoding: Encoding, data: Bytes| {
            let mut it = new_iterator(encoding, data);
            // a value column shorter than `start` reads as zero
            it.seek(start);
            it
        };
        let open_values = |columns: Vec<(NodeKey, Bytes)>| -> Vec<(NodeKey, ColumnIterator)> {
            columns
                .into_iter()
                .map(|(key, data)| (key, open_column(Encoding::Xor, data)))
                .collect()
        };

        Ok(Some(OpenSet {
            timestamps: open_column(Encoding::Delta, snap.timestamps),
            durations: open_column(Encoding::Rle, snap.durations),
            periods: open_column(Encoding::Rle, snap.periods),
            flat: open_values(snap.flat),
            cumulative: open_values(snap.cumulative),
        }))
    }

    fn read_row(set: &mut OpenSet) -> Result<Option<Row>> {
        let Some(timestamp) = set.timestamps.next() else {
            if let Some(err) = set.timestamps.err() {
                return Err(err.clone().into());
            }
            return Ok(None);
        };
        let duration = next_value(&mut set.durations)?;
        let period = next_value(&mut set.periods)?;

        let mut values: BTreeMap<NodeKey, NodeValues> = BTreeMap::new();
        for (key, it) in set.flat.iter_mut() {
            let v = next_value(it)?;
            if v != 0 {
                values.entry(key.clone()).or_default().flat = v;
            }
        }
        for (key, it) in set.cumulative.iter_mut() {
            let v = next_value(it)?;
            if v != 0 {
                values.entry(key.clone()).or_default().cumulative = v;
            }
        }

        Ok(Some(Row {
            timestamp,
            duration,
            period,
            values,
        }))
    }
}

/// One decoded row of a chunk set
struct Row {
    timestamp: i64,
    duration: i64,
    period: i64,
    values: BTreeMap<NodeKey, NodeValues>,
}

/// Next sample of a column, zero once the column is exhausted
fn next_value(it: &mut ColumnIterator) -> Result<i64> {
    match it.next() {
        Some(v) => Ok(v),
        None => match it.err() {
            Some(err) => Err(err.clone().into()),
            None => Ok(0),
        },
    }
}

impl Iterator for MemSeriesIterator {
    type Item = InstantProfile;

    fn next(&mut self) -> Option<InstantProfile> {
        loop {
            if self.err.is_some() {
                return None;
            }

            if self.current.is_none() {
                let snap = self.sets.pop_front()?;
                match self.open(snap) {
                    Ok(open) => self.current = open,
                    Err(err) => {
                        self.fail(err);
                        return None;
                    }
                }
                continue;
            }

            let row = match self.current.as_mut().map(Self::read_row) {
                Some(Ok(row)) => row,
                Some(Err(err)) => {
                    self.fail(err);
                    return None;
                }
                None => continue,
            };

            let Some(row) = row else {
                self.current = None;
                continue;
            };
            if row.timestamp > self.range.end {
                // timestamps only grow: nothing later can match
                self.current = None;
                self.sets.clear();
                return None;
            }

            let mut builder = ProfileTreeBuilder::new();
            for (key, v) in &row.values {
                builder.insert(key, *v);
            }
            return Some(InstantProfile {
                meta: ProfileMeta {
                    period_type: self.period_type.clone(),
                    sample_type: self.sample_type.clone(),
                    timestamp: row.timestamp,
                    duration: row.duration,
                    period: row.period,
                },
                tree: builder.build(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ChunkError;
    use crate::profile::SampleLabels;

    fn meta(timestamp: i64) -> ProfileMeta {
        ProfileMeta {
            period_type: ValueType::new("cpu", "nanoseconds"),
            sample_type: ValueType::new("samples", "count"),
            timestamp,
            duration: 10_000_000_000,
            period: 10_000_000,
        }
    }

    fn profile(timestamp: i64, stacks: &[(Vec<u64>, i64)]) -> Profile {
        let mut b = ProfileTreeBuilder::new();
        for (stack, value) in stacks {
            b.add_sample(stack, *value, SampleLabels::default());
        }
        Profile {
            meta: meta(timestamp),
            tree: b.build(),
        }
    }

    fn series(samples_per_chunk: u16) -> MemSeries {
        MemSeries::new(
            7,
            Labels::from_pairs(&[("job", "api")]),
            Arc::new(ChunkPool::new(64)),
            samples_per_chunk,
        )
    }

    #[test]
    fn test_append_and_read_back() {
        let s = series(120);
        let p1 = profile(1000, &[(vec![2, 1], 3), (vec![1], 1)]);
        let p2 = profile(2000, &[(vec![3, 1], 5)]);
        s.append(&p1).unwrap();
        s.append(&p2).unwrap();

        let rows: Vec<InstantProfile> = s.iterator(TimeRange::default()).collect();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0], p1);
        assert_eq!(rows[1], p2);
        assert_eq!(s.time_bounds(), Some((1000, 2000)));
    }

    #[test]
    fn test_commit_callback_runs_before_row_is_readable() {
        let s = series(120);
        let mut committed = Vec::new();
        s.append_with(&profile(1000, &[(vec![1], 1)]), |ts| {
            // the write lock is still held
            assert!(s.columns.try_read().is_none());
            committed.push(ts);
        })
        .unwrap();
        assert_eq!(committed, vec![1000]);

        let rejected = s.append_with(&profile(900, &[(vec![1], 1)]), |ts| committed.push(ts));
        assert!(rejected.is_err());
        assert_eq!(committed, vec![1000]);
    }

    #[test]
    fn test_out_of_order_leaves_series_unchanged() {
        let s = series(120);
        s.append(&profile(1000, &[(vec![1], 1)])).unwrap();

        for ts in [1000, 999] {
            let err = s.append(&profile(ts, &[(vec![1], 2)])).unwrap_err();
            assert!(matches!(
                err,
                Error::Storage(StorageError::OutOfOrderSample {
                    series: 7,
                    max_time: 1000,
                    ..
                })
            ));
        }
        assert_eq!(s.num_samples(), 1);
        assert_eq!(s.iterator(TimeRange::default()).count(), 1);
    }

    #[test]
    fn test_schema_mismatch_rejected() {
        let s = series(120);
        s.append(&profile(1000, &[(vec![1], 1)])).unwrap();

        let mut other = profile(2000, &[(vec![1], 1)]);
        other.meta.sample_type = ValueType::new("alloc_space", "bytes");
        let err = s.append(&other).unwrap_err();
        assert!(matches!(
            err,
            Error::Storage(StorageError::SchemaMismatch {
                field: "sample_type",
                ..
            })
        ));
        assert_eq!(s.num_samples(), 1);
    }

    #[test]
    fn test_sparse_keys_stay_row_aligned() {
        let s = series(120);
        s.append(&profile(1, &[(vec![1], 1)])).unwrap();
        s.append(&profile(2, &[(vec![2], 4)])).unwrap();
        s.append(&profile(3, &[(vec![1], 1)])).unwrap();
        s.append(&profile(4, &[])).unwrap();

        let rows: Vec<InstantProfile> = s.iterator(TimeRange::default()).collect();
        let totals: Vec<i64> = rows.iter().map(|r| r.tree.total()).collect();
        assert_eq!(totals, vec![1, 4, 1, 0]);
        assert_eq!(rows[1].tree.children(rows[1].tree.root())[0].location_id, 2);
        assert!(rows[3].tree.is_empty());
    }

    #[test]
    fn test_chunk_cutting_and_range_queries() {
        let s = series(4);
        for i in 0..10 {
            s.append(&profile(i * 10, &[(vec![1 + (i as u64 % 3)], i + 1)])).unwrap();
        }
        assert_eq!(s.num_chunk_sets(), 3);

        let all: Vec<i64> = s
            .iterator(TimeRange::default())
            .map(|p| p.meta.timestamp)
            .collect();
        assert_eq!(all, (0..10).map(|i| i * 10).collect::<Vec<_>>());

        // spans the boundary between the first and second set
        let range = TimeRange::new(25, 55).unwrap();
        let rows: Vec<InstantProfile> = s.iterator(range).collect();
        let ts: Vec<i64> = rows.iter().map(|p| p.meta.timestamp).collect();
        assert_eq!(ts, vec![30, 40, 50]);
        assert_eq!(rows[0].tree.total(), 4);

        assert_eq!(s.iterator(TimeRange::new(91, 200).unwrap()).count(), 0);
    }

    #[test]
    fn test_iterator_is_a_snapshot() {
        let s = series(120);
        s.append(&profile(1, &[(vec![1], 1)])).unwrap();
        let it = s.iterator(TimeRange::default());
        s.append(&profile(2, &[(vec![1], 1)])).unwrap();
        assert_eq!(it.count(), 1);
    }

    #[test]
    fn test_decode_error_surfaces() {
        let mut it = MemSeriesIterator {
            series_id: 1,
            range: TimeRange::default(),
            period_type: ValueType::default(),
            sample_type: ValueType::default(),
            sets: VecDeque::from([SetSnapshot {
                // claims two samples, holds none
                timestamps: Bytes::from_static(&[0, 2]),
                durations: Bytes::from_static(&[0, 0, 0, 0]),
                periods: Bytes::from_static(&[0, 0, 0, 0]),
                flat: Vec::new(),
                cumulative: Vec::new(),
            }]),
            current: None,
            err: None,
        };
        assert!(it.next().is_none());
        assert!(matches!(it.err(), Some(Error::Chunk(ChunkError::Decode(_)))));
    }

    #[test]
    fn test_drop_returns_chunks_to_pool() {
        let pool = Arc::new(ChunkPool::new(64));
        {
            let s = MemSeries::new(1, Labels::default(), Arc::clone(&pool), 120);
            s.append(&profile(1, &[(vec![1], 1)])).unwrap();
        }
        assert_eq!(pool.idle(Encoding::Delta), 1);
        assert_eq!(pool.idle(Encoding::Rle), 2);
        // root cumulative, [1] flat and cumulative
        assert_eq!(pool.idle(Encoding::Xor), 3);
    }
}
