// Bump allocator throughput under contention.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use emberhttp::memory::bump::{BumpPrivate, BumpShared};
use std::sync::Arc;
use std::thread;

fn bench_private_alloc(c: &mut Criterion) {
    c.bench_function("bump_private_alloc_64b", |b| {
        let bump = BumpPrivate::create(16 * 1024 * 1024).unwrap();
        b.iter(|| {
            if bump.alloc(64, 8).is_none() {
                bump.reset();
            }
            black_box(());
        });
    });
}

fn bench_shared_alloc_contended(c: &mut Criterion) {
    let mut group = c.benchmark_group("bump_shared_alloc_contended");
    for threads in [1usize, 2, 4, 8] {
        group.bench_with_input(BenchmarkId::from_parameter(threads), &threads, |b, &threads| {
            b.iter(|| {
                let bump = Arc::new(BumpShared::create(16 * 1024 * 1024).unwrap());
                let handles: Vec<_> = (0..threads)
                    .map(|_| {
                        let bump = bump.clone();
                        thread::spawn(move || {
                            for _ in 0..1000 {
                                black_box(bump.alloc(64, 8));
                            }
                        })
                    })
                    .collect();
                for h in handles {
                    h.join().unwrap();
                }
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_private_alloc, bench_shared_alloc_contended);
criterion_main!(benches);
