use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use kuba_profstore::compression::{new_chunk, Chunk, Encoding};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const SIZES: [usize; 3] = [120, 1_000, 10_000];

/// Column shape each codec is used for
fn column(encoding: Encoding, count: usize) -> Vec<i64> {
    let mut rng = StdRng::seed_from_u64(42);
    match encoding {
        // scrape timestamps with a little jitter
        Encoding::Delta => (0..count as i64)
            .map(|i| 1_700_000_000_000 + i * 10_000 + rng.random_range(-5..5))
            .collect(),
        // mostly constant durations
        Encoding::Rle => (0..count)
            .map(|_| if rng.random_bool(0.02) { 9_999 } else { 10_000 })
            .collect(),
        // node values: sparse small counters
        Encoding::Xor => (0..count)
            .map(|_| if rng.random_bool(0.3) { rng.random_range(1..500) } else { 0 })
            .collect(),
    }
}

fn encode(encoding: Encoding, values: &[i64]) -> Box<dyn Chunk> {
    let mut chunk = new_chunk(encoding);
    {
        let mut app = chunk.appender().unwrap();
        for &v in values {
            app.append(v).unwrap();
        }
    }
    chunk
}

fn bench_append(c: &mut Criterion) {
    let mut group = c.benchmark_group("chunk_append");

    for encoding in [Encoding::Xor, Encoding::Delta, Encoding::Rle] {
        for size in SIZES {
            let values = column(encoding, size);
            group.throughput(Throughput::Elements(size as u64));
            group.bench_with_input(
                BenchmarkId::new(encoding.to_string(), size),
                &values,
                |b, values| b.iter(|| black_box(encode(encoding, values))),
            );
        }
    }

    group.finish();
}

fn bench_iterate(c: &mut Criterion) {
    let mut group = c.benchmark_group("chunk_iterate");

    for encoding in [Encoding::Xor, Encoding::Delta, Encoding::Rle] {
        for size in SIZES {
            let chunk = encode(encoding, &column(encoding, size));
            group.throughput(Throughput::Elements(size as u64));
            group.bench_with_input(
                BenchmarkId::new(encoding.to_string(), size),
                &chunk,
                |b, chunk| b.iter(|| black_box(chunk.iterator().sum::<i64>())),
            );
        }
    }

    group.finish();
}

fn bench_resume_appender(c: &mut Criterion) {
    let mut group = c.benchmark_group("chunk_resume_appender");

    for encoding in [Encoding::Xor, Encoding::Delta, Encoding::Rle] {
        let mut chunk = encode(encoding, &column(encoding, 1_000));
        group.bench_function(encoding.to_string(), |b| {
            b.iter(|| black_box(chunk.appender().unwrap().num_samples()))
        });
    }

    group.finish();
}

criterion_group!(benches, bench_append, bench_iterate, bench_resume_appender);
criterion_main!(benches);
