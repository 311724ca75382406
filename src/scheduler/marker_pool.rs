//! The pool of marker threads.  Markers block on the shared mark stack,
//! drain batches through their own visitors, and park again when marking
//! runs dry or the scheduler throttles them.

use atomic_refcell::AtomicRefCell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::binding::RuntimeBinding;
use crate::heap::Heap;
use crate::marking::SlotVisitor;

/// Per-marker statistics, merged into the heap's totals on demand.
#[derive(Default, Clone, Copy)]
pub(crate) struct MarkerStat {
    pub batches: usize,
    pub cells_visited: usize,
    pub bytes_visited: usize,
}

/// The part of a marker shared with the pool, for parked-state queries and
/// stat merging.
pub(crate) struct MarkerShared {
    parked: AtomicBool,
    stat: AtomicRefCell<MarkerStat>,
}

// Error message for borrowing `MarkerShared::stat`.
const STAT_BORROWED_MSG: &str = "MarkerShared.stat is already borrowed.  This may happen if \
    statistics are queried while the marker is updating them.";

impl MarkerShared {
    fn new() -> Self {
        MarkerShared {
            parked: AtomicBool::new(true),
            stat: AtomicRefCell::new(MarkerStat::default()),
        }
    }

    pub fn is_parked(&self) -> bool {
        self.parked.load(Ordering::SeqCst)
    }

    pub fn stat(&self) -> MarkerStat {
        *self.stat.try_borrow().expect(STAT_BORROWED_MSG)
    }
}

pub(crate) struct MarkerPool {
    markers_shared: Vec<Arc<MarkerShared>>,
}

impl MarkerPool {
    pub fn new(count: usize) -> Self {
        MarkerPool {
            markers_shared: (0..count).map(|_| Arc::new(MarkerShared::new())).collect(),
        }
    }

    pub fn marker_count(&self) -> usize {
        self.markers_shared.len()
    }

    pub fn shared(&self, ordinal: usize) -> Arc<MarkerShared> {
        self.markers_shared[ordinal].clone()
    }

    pub fn parked_markers(&self) -> usize {
        self.markers_shared.iter().filter(|m| m.is_parked()).count()
    }

    pub fn merged_stat(&self) -> MarkerStat {
        let mut total = MarkerStat::default();
        for shared in &self.markers_shared {
            let stat = shared.stat();
            total.batches += stat.batches;
            total.cells_visited += stat.cells_visited;
            total.bytes_visited += stat.bytes_visited;
        }
        total
    }
}

/// A marker thread's private half.  The binding's `spawn_gc_thread` receives
/// one of these boxed and calls [`Marker::run`] on its new thread.
pub struct Marker<R: RuntimeBinding> {
    heap: Arc<Heap<R>>,
    ordinal: usize,
    shared: Arc<MarkerShared>,
}

impl<R: RuntimeBinding> Marker<R> {
    pub(crate) fn new(heap: Arc<Heap<R>>, ordinal: usize, shared: Arc<MarkerShared>) -> Self {
        Marker {
            heap,
            ordinal,
            shared,
        }
    }

    pub fn ordinal(&self) -> usize {
        self.ordinal
    }

    pub fn run(self) {
        trace!("marker {} running", self.ordinal);
        loop {
            let heap: &Heap<R> = &self.heap;
            let mut visitor = SlotVisitor::new(heap);
            self.shared.parked.store(true, Ordering::SeqCst);
            if !visitor.take_blocking_from_shared() {
                break;
            }
            self.shared.parked.store(false, Ordering::SeqCst);
            let mut batches = 1;
            loop {
                visitor.drain(None, None);
                heap.shared_mark_stack().finish_drainer();
                // Respect the mutator's timeslice: park instead of grabbing
                // another batch while throttled.
                if heap.shared_mark_stack().is_throttled() {
                    break;
                }
                if !visitor.try_take_from_shared() {
                    break;
                }
                batches += 1;
            }
            {
                let mut stat = self.shared.stat.try_borrow_mut().expect(STAT_BORROWED_MSG);
                stat.batches += batches;
                stat.cells_visited += visitor.visit_count();
                stat.bytes_visited += visitor.bytes_visited();
            }
        }
        trace!("marker {} exiting", self.ordinal);
    }
}
