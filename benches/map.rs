use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use scurry::IntMap;
use std::sync::Arc;

const ITER: i32 = 32 * 1024;

fn insert_i32(c: &mut Criterion) {
    let mut group = c.benchmark_group("insert_i32");
    group.throughput(Throughput::Elements(ITER as u64));

    group.bench_function(BenchmarkId::from_parameter("guard_once"), |b| {
        b.iter(|| {
            let map = IntMap::with_capacity(ITER as usize);
            let guard = map.guard();
            for i in 0..ITER {
                map.insert(i, i + 7, &guard);
            }
            black_box(&map);
        });
    });

    group.bench_function(BenchmarkId::from_parameter("guard_every_it"), |b| {
        b.iter(|| {
            let map = IntMap::with_capacity(ITER as usize);
            for i in 0..ITER {
                map.insert(i, i + 7, &map.guard());
            }
            black_box(&map);
        });
    });

    group.finish();
}

fn get_i32(c: &mut Criterion) {
    let mut group = c.benchmark_group("get_i32");
    group.throughput(Throughput::Elements(ITER as u64));

    let map = IntMap::with_capacity(ITER as usize);
    {
        let guard = map.guard();
        for i in 0..ITER {
            map.insert(i, i + 7, &guard);
        }
    }

    group.bench_function(BenchmarkId::from_parameter("guard_once"), |b| {
        b.iter(|| {
            let guard = map.guard();
            for i in 0..ITER {
                black_box(map.get(i, &guard));
            }
        });
    });

    group.finish();
}

fn insert_i32_threaded(c: &mut Criterion) {
    let mut group = c.benchmark_group("insert_i32_threaded");
    group.throughput(Throughput::Elements(ITER as u64));
    let max = num_cpus::get();

    for threads in [1, 2, max.max(2)] {
        group.bench_with_input(
            BenchmarkId::from_parameter(threads),
            &threads,
            |b, &threads| {
                b.iter(|| {
                    let map = Arc::new(IntMap::with_capacity(ITER as usize));
                    let inc = ITER / threads as i32;
                    std::thread::scope(|s| {
                        for t in 0..threads as i32 {
                            let map = Arc::clone(&map);
                            s.spawn(move || {
                                let guard = map.guard();
                                let start = t * inc;
                                for i in start..(start + inc) {
                                    map.insert(i, i + 7, &guard);
                                }
                            });
                        }
                    });
                    black_box(&map);
                });
            },
        );
    }

    group.finish();
}

criterion_group!(benches, insert_i32, get_i32, insert_i32_threaded);
criterion_main!(benches);
