//! Concurrent-correctness scenarios: the mutator keeps running and mutating
//! the object graph while collections are in flight.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use tidemark::binding::mock::{allocate_cell, get_slot, register_mock_cell, set_slot, MockRuntime};
use tidemark::heap::{CollectorPhase, GcRequest, Heap, HeapConfig};
use tidemark::space::CellKind;

fn new_heap() -> (Arc<Heap<MockRuntime>>, CellKind) {
    let heap = Heap::new(HeapConfig::default());
    let kind = register_mock_cell(&heap);
    heap.notify_is_safe_to_collect();
    (heap, kind)
}

/// No missed roots: a mutator permutes the edges under a pinned root while
/// full collections run; every child must survive every cycle.
#[test]
fn concurrent_mutation_loses_no_reachable_cells() {
    const CHILDREN: usize = 64;
    let (heap, kind) = new_heap();

    heap.acquire_access();
    let root = allocate_cell(&heap, kind, CHILDREN);
    heap.protect(root);
    for index in 0..CHILDREN {
        let child = allocate_cell(&heap, kind, 1);
        set_slot(&heap, root, index, Some(child));
    }
    heap.release_access();

    let stop = Arc::new(AtomicBool::new(false));
    let mutator_heap = heap.clone();
    let mutator_stop = stop.clone();
    let mutator = std::thread::spawn(move || {
        let mut rng = ChaCha8Rng::seed_from_u64(0x7ea_5ca1e);
        mutator_heap.acquire_access();
        while !mutator_stop.load(Ordering::SeqCst) {
            // Swap two slots: a permutation, so the reachable set is
            // invariant while edges churn under the collector.
            let i = rng.random_range(0..CHILDREN);
            let j = rng.random_range(0..CHILDREN);
            let a = get_slot(root, i);
            let b = get_slot(root, j);
            set_slot(&mutator_heap, root, i, b);
            set_slot(&mutator_heap, root, j, a);
            mutator_heap.stop_if_necessary();
        }
        mutator_heap.release_access();
    });

    for _ in 0..10 {
        heap.collect_sync(GcRequest::full());
        assert_eq!(
            heap.object_count(),
            CHILDREN + 1,
            "a reachable cell was lost during concurrent marking"
        );
    }

    stop.store(true, Ordering::SeqCst);
    mutator.join().unwrap();

    heap.acquire_access();
    for index in 0..CHILDREN {
        assert!(get_slot(root, index).is_some());
    }
    heap.unprotect(root);
    heap.release_access();
}

/// Scenario C: one thread allocating continuously, another requesting
/// collections in a loop.  No crash, and the heap converges instead of
/// growing without bound.
#[test]
fn allocation_churn_converges_under_async_collections() {
    let (heap, kind) = new_heap();

    let requester_heap = heap.clone();
    let stop = Arc::new(AtomicBool::new(false));
    let requester_stop = stop.clone();
    let requester = std::thread::spawn(move || {
        while !requester_stop.load(Ordering::SeqCst) {
            requester_heap.collect_async(GcRequest::default());
            std::thread::sleep(Duration::from_micros(200));
        }
    });

    heap.acquire_access();
    let keeper = allocate_cell(&heap, kind, 1);
    heap.protect(keeper);
    for _ in 0..50_000 {
        // Dropped immediately: every one of these is garbage.
        allocate_cell(&heap, kind, 1);
    }
    heap.release_access();

    stop.store(true, Ordering::SeqCst);
    requester.join().unwrap();

    // Two full cycles flush floating garbage from remembered sets and cells
    // allocated black during marking.
    heap.collect_sync(GcRequest::full());
    heap.collect_sync(GcRequest::full());
    assert_eq!(heap.object_count(), 1);
    assert!(heap.size() < 1 << 20, "heap failed to converge");
    assert_eq!(heap.current_phase(), CollectorPhase::NotRunning);
}

/// Seeded randomized interleaving: arbitrary graph churn against the
/// concurrent collector, checked against a stop-the-world recount.
#[test]
fn randomized_graph_churn_matches_recount() {
    const SLOTS: usize = 32;
    let (heap, kind) = new_heap();

    heap.acquire_access();
    let root = allocate_cell(&heap, kind, SLOTS);
    heap.protect(root);

    let mut rng = ChaCha8Rng::seed_from_u64(0xdead_beef);
    for round in 0..20_000usize {
        let slot = rng.random_range(0..SLOTS);
        match rng.random_range(0..4u32) {
            // Replace: the old target (if any) becomes garbage.
            0 | 1 => {
                let fresh = allocate_cell(&heap, kind, 1);
                set_slot(&heap, root, slot, Some(fresh));
            }
            // Drop an edge.
            2 => set_slot(&heap, root, slot, None),
            // Duplicate another slot's target.
            _ => {
                let other = get_slot(root, rng.random_range(0..SLOTS));
                set_slot(&heap, root, slot, other);
            }
        }
        if round % 4096 == 0 {
            heap.collect_async(GcRequest::default());
        }
        heap.stop_if_necessary();
    }
    heap.release_access();

    heap.collect_sync(GcRequest::full());
    heap.collect_sync(GcRequest::full());

    // Recount reachable cells by hand: the root plus the distinct targets of
    // its slots.
    let mut reachable: Vec<_> = (0..SLOTS).filter_map(|i| get_slot(root, i)).collect();
    reachable.sort();
    reachable.dedup();
    assert_eq!(heap.object_count(), reachable.len() + 1);

    heap.acquire_access();
    heap.unprotect(root);
    heap.release_access();
}
