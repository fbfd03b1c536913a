//! Basic benchmarks for the `chunk_pool` crate.
#![allow(
    missing_docs,
    reason = "No need for API documentation in benchmark code"
)]

use std::hint::black_box;
use std::iter;
use std::time::{Duration, Instant};

use chunk_pool::ChunkPool;
use criterion::{Criterion, criterion_group, criterion_main};
use new_zealand::nz;

criterion_group!(benches, entrypoint);
criterion_main!(benches);

type TestElement = [u64; 4];

/// Number of live elements used by benchmarks that need a populated pool.
const POPULATED_COUNT: usize = 10_000;

fn entrypoint(c: &mut Criterion) {
    let mut group = c.benchmark_group("chunk_basic");

    group.bench_function("build_empty", |b| {
        b.iter_custom(|iters| {
            let start = Instant::now();

            for _ in 0..iters {
                drop(black_box(
                    ChunkPool::builder()
                        .element_size_of::<TestElement>()
                        .build(),
                ));
            }

            start.elapsed()
        });
    });

    group.bench_function("allocate_one", |b| {
        b.iter_custom(|iters| {
            let mut pools = iter::repeat_with(|| {
                ChunkPool::builder()
                    .element_size_of::<TestElement>()
                    .build()
            })
            .take(usize::try_from(iters).unwrap())
            .collect::<Vec<_>>();

            let start = Instant::now();

            for pool in &mut pools {
                _ = black_box(pool.allocate());
            }

            start.elapsed()
        });
    });

    group.bench_function("allocate_free_reuse", |b| {
        b.iter_custom(|iters| {
            let mut pool = ChunkPool::builder()
                .element_size_of::<TestElement>()
                .build();

            // Keeps the pool from shrinking on every free.
            let _anchor = pool.allocate();

            let start = Instant::now();

            for _ in 0..iters {
                let element = black_box(pool.allocate());

                // SAFETY: The element came from this pool and is freed exactly once.
                unsafe {
                    pool.free(element);
                }
            }

            start.elapsed()
        });
    });

    group.bench_function("allocate_across_chunks", |b| {
        b.iter_custom(|iters| {
            let mut pool = ChunkPool::builder()
                .element_size_of::<TestElement>()
                .elements_per_chunk(nz!(64))
                .build();

            let start = Instant::now();

            for _ in 0..iters {
                _ = black_box(pool.allocate());
            }

            start.elapsed()
        });
    });

    group.bench_function("drain_and_shrink", |b| {
        b.iter_custom(|iters| {
            let mut pool = ChunkPool::builder()
                .element_size_of::<TestElement>()
                .elements_per_chunk(nz!(64))
                .build();

            let mut total = Duration::ZERO;

            for _ in 0..iters {
                let elements = iter::repeat_with(|| pool.allocate())
                    .take(1000)
                    .collect::<Vec<_>>();

                let start = Instant::now();

                for element in elements {
                    // SAFETY: The element came from this pool and is freed exactly once.
                    unsafe {
                        pool.free(element);
                    }
                }

                total += start.elapsed();
            }

            total
        });
    });

    group.bench_function("iterate_populated", |b| {
        b.iter_custom(|iters| {
            let mut pool = ChunkPool::builder()
                .element_size_of::<TestElement>()
                .allow_iteration()
                .build();

            let elements = iter::repeat_with(|| pool.allocate())
                .take(POPULATED_COUNT)
                .collect::<Vec<_>>();

            // Free every third element so iteration has to skip free slots.
            for element in elements.iter().step_by(3) {
                // SAFETY: Each element came from this pool and is freed exactly once.
                unsafe {
                    pool.free(*element);
                }
            }

            let start = Instant::now();

            for _ in 0..iters {
                _ = black_box(pool.iter().count());
            }

            start.elapsed()
        });
    });

    group.bench_function("to_array_populated", |b| {
        b.iter_custom(|iters| {
            let mut pool = ChunkPool::builder()
                .element_size_of::<TestElement>()
                .allow_iteration()
                .build();

            for _ in 0..POPULATED_COUNT {
                _ = pool.allocate_zeroed();
            }

            let start = Instant::now();

            for _ in 0..iters {
                drop(black_box(pool.to_array()));
            }

            start.elapsed()
        });
    });

    group.finish();
}
