use criterion::{criterion_group, criterion_main, Criterion};
use lazy_static::lazy_static;
use std::hint::black_box;
use std::sync::Arc;

use tidemark::binding::mock::{allocate_cell, register_mock_cell, MockRuntime};
use tidemark::heap::{GcRequest, Heap, HeapConfig};
use tidemark::space::CellKind;

lazy_static! {
    static ref HEAP: (Arc<Heap<MockRuntime>>, CellKind) = {
        let heap = Heap::new(HeapConfig::default());
        let kind = register_mock_cell(&heap);
        heap.notify_is_safe_to_collect();
        heap.acquire_access();
        (heap, kind)
    };
}

fn bench_allocation(c: &mut Criterion) {
    let (heap, kind) = &*HEAP;
    c.bench_function("allocate 32b cell", |b| {
        b.iter(|| allocate_cell(heap, *kind, black_box(1)))
    });
}

fn bench_write_barrier_fast_path(c: &mut Criterion) {
    let (heap, kind) = &*HEAP;
    let parent = allocate_cell(heap, *kind, 1);
    heap.protect(parent);
    heap.collect_sync(GcRequest::full());
    // The first barrier re-greys the parent; every further call is the
    // single-load-and-compare fast path.
    heap.write_barrier(parent);
    c.bench_function("write barrier fast path", |b| {
        b.iter(|| heap.write_barrier(black_box(parent)))
    });
    heap.unprotect(parent);
}

criterion_group!(benches, bench_allocation, bench_write_barrier_fast_path);
criterion_main!(benches);
