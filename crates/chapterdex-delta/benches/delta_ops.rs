use std::time::Duration;

use chapterdex_delta::bits::move_bits_within;
use chapterdex_delta::DeltaIndex;
use chapterdex_types::{RECORD_NAME_SIZE, RecordName};
use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};

const LIST_COUNT: u32 = 1024;
const MEAN_DELTA: u32 = 4096;
const PAYLOAD_BITS: u32 = 10;
const FULL_RECORD_AXIS: [usize; 3] = [1_000, 10_000, 50_000];
const SMOKE_RECORD_AXIS: [usize; 2] = [1_000, 10_000];
const MOVE_SIZES: [u64; 3] = [57, 600, 16_384];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BenchMode {
    Smoke,
    Full,
}

impl BenchMode {
    fn detect() -> Self {
        let smoke_env = std::env::var("CHAPTERDEX_BENCH_SMOKE")
            .ok()
            .is_some_and(|value| value != "0");
        if smoke_env || std::env::var("CI").is_ok() {
            Self::Smoke
        } else {
            Self::Full
        }
    }

    const fn record_axis(self) -> &'static [usize] {
        match self {
            Self::Smoke => &SMOKE_RECORD_AXIS,
            Self::Full => &FULL_RECORD_AXIS,
        }
    }
}

fn criterion_config() -> Criterion {
    let criterion = Criterion::default().configure_from_args();
    match BenchMode::detect() {
        BenchMode::Smoke => criterion
            .sample_size(10)
            .warm_up_time(Duration::from_millis(100))
            .measurement_time(Duration::from_millis(250)),
        BenchMode::Full => criterion
            .sample_size(20)
            .warm_up_time(Duration::from_millis(400))
            .measurement_time(Duration::from_secs(2)),
    }
}

fn random_keys(count: usize, seed: u64) -> Vec<(u32, u32)> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..count)
        .map(|_| (rng.gen_range(0..LIST_COUNT), rng.gen_range(0..1u32 << 24)))
        .collect()
}

fn build_index(keys: &[(u32, u32)]) -> DeltaIndex {
    let memory = keys.len() * 4 + (1 << 20);
    let mut index = DeltaIndex::new(1, LIST_COUNT, MEAN_DELTA, PAYLOAD_BITS, memory)
        .unwrap_or_else(|err| panic!("index: {err}"));
    let name = RecordName::new([0; RECORD_NAME_SIZE]);
    for &(list, key) in keys {
        let Ok(mut entry) = index.get_entry(list, key, &name) else {
            continue;
        };
        if !entry.at_end && entry.key == key {
            continue;
        }
        let _ = index.put_entry(&mut entry, key, key & 0x3FF, None);
    }
    index
}

fn bench_put_and_get(c: &mut Criterion) {
    let mode = BenchMode::detect();
    let mut group = c.benchmark_group("delta_index/put_get");
    for &count in mode.record_axis() {
        let keys = random_keys(count, 7);
        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::new("put", count), &keys, |b, keys| {
            b.iter(|| black_box(build_index(keys)));
        });

        let mut index = build_index(&keys);
        let name = RecordName::new([0; RECORD_NAME_SIZE]);
        group.bench_with_input(BenchmarkId::new("get", count), &keys, |b, keys| {
            b.iter(|| {
                for &(list, key) in keys {
                    if let Ok(entry) = index.get_entry(list, key, &name) {
                        black_box(index.entry_value(&entry));
                    }
                }
            });
        });
    }
    group.finish();
}

fn bench_move_bits(c: &mut Criterion) {
    let mut group = c.benchmark_group("delta_index/move_bits");
    let mut memory = vec![0u8; 8 * 1024];
    StdRng::seed_from_u64(3).fill_bytes(&mut memory);
    for size in MOVE_SIZES {
        group.throughput(Throughput::Bytes(size / 8));
        group.bench_with_input(BenchmarkId::new("down", size), &size, |b, &size| {
            b.iter(|| move_bits_within(black_box(&mut memory), 4_099, 13, size));
        });
        group.bench_with_input(BenchmarkId::new("up", size), &size, |b, &size| {
            b.iter(|| move_bits_within(black_box(&mut memory), 13, 4_099, size));
        });
    }
    group.finish();
}

criterion_group!(
    name = benches;
    config = criterion_config();
    targets = bench_put_and_get, bench_move_bits
);
criterion_main!(benches);
