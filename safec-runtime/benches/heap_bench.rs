//! Heap and check benchmarks using criterion.
//!
//! Run with: cargo bench --bench heap_bench

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use safec_runtime::os::PAGE_SIZE;
use safec_runtime::{bounds_check_with_size, ExplicitRoots, Heap, MemoryConfig, MemoryRange};

fn bench_config() -> MemoryConfig {
    MemoryConfig {
        segment_size: 1 << 28,
        gc_threshold: usize::MAX,
        gc_enabled: false,
    }
}

fn isolated_heap() -> Heap {
    Heap::with_roots(bench_config(), Box::new(ExplicitRoots::new())).unwrap()
}

/// Benchmark allocate/free pairs across size classes
fn bench_allocate_free(c: &mut Criterion) {
    let mut group = c.benchmark_group("allocate_free");

    for size in [16usize, 64, 256, 1024, 2 * PAGE_SIZE] {
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            let mut heap = isolated_heap();
            b.iter(|| {
                let ptr = heap.allocate(black_box(size)).unwrap();
                heap.free(ptr.as_ptr() as usize).unwrap();
            });
        });
    }

    group.finish();
}

/// Benchmark header lookup through the check entry points
fn bench_checks(c: &mut Criterion) {
    let mut group = c.benchmark_group("checks");
    let mut heap = isolated_heap();
    // Fill a page so the forward walk has work to do.
    let objs: Vec<usize> = (0..100)
        .map(|_| heap.allocate(24).unwrap().as_ptr() as usize)
        .collect();
    let last = *objs.last().unwrap();
    let target = objs[0];
    heap.set_type(last, 0b110).unwrap();
    unsafe { *((last + 8) as *mut usize) = target };

    group.bench_function("bounds_check_with_size", |b| {
        b.iter(|| bounds_check_with_size(black_box(last), black_box(last + 8), 24, 8))
    });
    group.bench_function("bounds_check", |b| {
        b.iter(|| heap.bounds_check(black_box(last), black_box(last + 8), 8))
    });
    group.bench_function("escape_check", |b| {
        b.iter(|| heap.escape_check(black_box(last), black_box(last + 16)))
    });
    group.bench_function("write_barrier", |b| {
        b.iter(|| heap.write_barrier(black_box(last), black_box(last + 8), 8))
    });
    group.bench_function("big_object_lookup", |b| {
        let big = heap.allocate(16 * PAGE_SIZE).unwrap().as_ptr() as usize;
        b.iter(|| heap.object_bounds(black_box(big + 15 * PAGE_SIZE)))
    });

    group.finish();
}

/// Benchmark a full collection over a rooted linked list
fn bench_collect(c: &mut Criterion) {
    let mut group = c.benchmark_group("collect");

    for len in [100usize, 1_000, 10_000] {
        group.bench_with_input(BenchmarkId::new("linked_list", len), &len, |b, &len| {
            let mut root = Box::new(0usize);
            let start = &*root as *const usize as usize;
            // SAFETY: `root` outlives the heap.
            let roots = unsafe { ExplicitRoots::new().with_range(MemoryRange::new(start, start + 8)) };
            let mut heap = Heap::with_roots(bench_config(), Box::new(roots)).unwrap();
            let mut prev = 0usize;
            for _ in 0..len {
                let node = heap.allocate(16).unwrap().as_ptr() as usize;
                unsafe { *(node as *mut usize) = prev };
                prev = node;
            }
            *root = prev;
            b.iter(|| heap.collect().unwrap());
            drop(heap);
            drop(root);
        });
    }

    group.finish();
}

criterion_group!(benches, bench_allocate_free, bench_checks, bench_collect);
criterion_main!(benches);
