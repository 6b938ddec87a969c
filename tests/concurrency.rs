//! Concurrent writers and readers on one shared head
//!
//! Each writer owns one series (the single-writer contract); readers select
//! and iterate while the writers are still appending.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use kuba_profstore::config::HeadConfig;
use kuba_profstore::index::Matcher;
use kuba_profstore::profile::{Profile, ProfileTreeBuilder, SampleLabels};
use kuba_profstore::storage::Head;
use kuba_profstore::types::{Labels, ProfileMeta};
use prometheus::Registry;

const WRITERS: usize = 4;
const PROFILES_PER_WRITER: i64 = 300;

fn profile(timestamp: i64, value: i64) -> Profile {
    let mut b = ProfileTreeBuilder::new();
    b.add_sample(&[2, 1], value, SampleLabels::default());
    if value % 5 == 0 {
        b.add_sample(&[3, 1], 1, SampleLabels::default());
    }
    Profile {
        meta: ProfileMeta {
            timestamp,
            duration: 10,
            period: 1,
            ..Default::default()
        },
        tree: b.build(),
    }
}

fn new_head() -> Arc<Head> {
    let config = HeadConfig {
        samples_per_chunk: 32,
        ..HeadConfig::default()
    };
    Arc::new(Head::new(config, &Registry::new()).unwrap())
}

#[test]
fn test_concurrent_writers_and_readers() {
    let head = new_head();
    let done = Arc::new(AtomicBool::new(false));

    let writers: Vec<_> = (0..WRITERS)
        .map(|w| {
            let head = Arc::clone(&head);
            thread::spawn(move || {
                let worker = w.to_string();
                let app = head.appender(Labels::from_pairs(&[
                    ("job", "load"),
                    ("worker", worker.as_str()),
                ]));
                for i in 0..PROFILES_PER_WRITER {
                    app.append(&profile(i * 10, i + 1)).unwrap();
                }
            })
        })
        .collect();

    let readers: Vec<_> = (0..2)
        .map(|_| {
            let head = Arc::clone(&head);
            let done = Arc::clone(&done);
            thread::spawn(move || {
                let mut passes = 0;
                while !done.load(Ordering::Acquire) || passes == 0 {
                    let querier = head.querier(0, i64::MAX).unwrap();
                    for series in querier.select(&[Matcher::equal("job", "load")]).unwrap() {
                        let mut it = series.iterator();
                        let mut expected_ts = 0;
                        for p in it.by_ref() {
                            // a snapshot is always a gap-free prefix of what was written
                            assert_eq!(p.meta.timestamp, expected_ts);
                            let value = expected_ts / 10 + 1;
                            let extra = i64::from(value % 5 == 0);
                            assert_eq!(p.tree.total(), value + extra);
                            expected_ts += 10;
                        }
                        assert!(it.err().is_none());
                    }
                    passes += 1;
                }
            })
        })
        .collect();

    for w in writers {
        w.join().unwrap();
    }
    done.store(true, Ordering::Release);
    for r in readers {
        r.join().unwrap();
    }

    assert_eq!(head.num_series(), WRITERS);
    assert_eq!(
        (head.min_time(), head.max_time()),
        (0, (PROFILES_PER_WRITER - 1) * 10)
    );
    for series in head
        .querier(0, i64::MAX)
        .unwrap()
        .select(&[Matcher::regex("worker", ".+").unwrap()])
        .unwrap()
    {
        assert_eq!(series.iterator().count(), PROFILES_PER_WRITER as usize);
    }
    assert_eq!(
        head.metrics().samples_appended.get(),
        WRITERS as u64 * PROFILES_PER_WRITER as u64
    );
}

#[test]
fn test_visible_rows_lie_within_head_bounds() {
    let head = new_head();
    let done = Arc::new(AtomicBool::new(false));

    let writer = {
        let head = Arc::clone(&head);
        let done = Arc::clone(&done);
        thread::spawn(move || {
            let app = head.appender(Labels::from_pairs(&[("job", "bounds")]));
            for i in 0..PROFILES_PER_WRITER * 4 {
                app.append(&profile(1_000 + i * 10, i + 1)).unwrap();
            }
            done.store(true, Ordering::Release);
        })
    };

    let reader = {
        let head = Arc::clone(&head);
        let done = Arc::clone(&done);
        thread::spawn(move || {
            while !done.load(Ordering::Acquire) {
                let querier = head.querier(i64::MIN, i64::MAX).unwrap();
                for series in querier.select(&[Matcher::equal("job", "bounds")]).unwrap() {
                    let rows: Vec<i64> = series.iterator().map(|p| p.meta.timestamp).collect();
                    // bounds are read after the rows, so they can only have grown
                    let (min, max) = (head.min_time(), head.max_time());
                    for ts in rows {
                        assert!(min <= ts && ts <= max, "{ts} outside {min}..={max}");
                    }
                }
            }
        })
    };

    writer.join().unwrap();
    reader.join().unwrap();
    assert_eq!(
        (head.min_time(), head.max_time()),
        (1_000, 1_000 + (PROFILES_PER_WRITER * 4 - 1) * 10)
    );
}

#[test]
fn test_racing_series_creation_assigns_unique_ids() {
    let head = new_head();
    let barrier = Arc::new(Barrier::new(8));

    let handles: Vec<_> = (0..8)
        .map(|t| {
            let head = Arc::clone(&head);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                // half the label sets are shared by every thread, half are private
                (0..64)
                    .map(|i| {
                        let owner = if i % 2 == 0 { "shared".to_string() } else { t.to_string() };
                        let index = i.to_string();
                        let (series, _) = head.get_or_create(Labels::from_pairs(&[
                            ("owner", owner.as_str()),
                            ("i", index.as_str()),
                        ]));
                        (series.labels().clone(), series.id())
                    })
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    let mut seen = std::collections::HashMap::new();
    for h in handles {
        for (labels, id) in h.join().unwrap() {
            // one label set never maps to two IDs
            assert_eq!(*seen.entry(labels).or_insert(id), id);
        }
    }

    let expected = 32 + 8 * 32;
    assert_eq!(seen.len(), expected);
    assert_eq!(head.num_series(), expected);
    let ids: HashSet<u64> = seen.values().copied().collect();
    assert_eq!(ids.len(), expected);
    assert!(ids.iter().all(|&id| id < expected as u64));

    // postings and the series map agree
    let all = head
        .querier(i64::MIN, i64::MAX)
        .unwrap()
        .label_values("owner", &[])
        .unwrap();
    assert_eq!(all.len(), 9);
}
