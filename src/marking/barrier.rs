//! The write barrier.  Invoked on every heap-pointer store; the fast path is
//! a single unordered load of the source cell's state byte compared against
//! the heap's barrier threshold, so the steady-state cost is one predictable
//! branch.

use std::sync::atomic::{fence, Ordering};

use crate::binding::RuntimeBinding;
use crate::heap::Heap;
use crate::space::CellState;
use crate::util::ObjectReference;

impl<R: RuntimeBinding> Heap<R> {
    /// The barrier for a store of a heap reference into a field of `from`.
    /// Call it after the store.  Idempotent: calling it N times has the same
    /// marking effect as calling it once.
    #[inline]
    pub fn write_barrier(&self, from: ObjectReference) {
        if from.header().state_byte() < self.barrier_threshold() {
            self.write_barrier_slow_path(from);
        }
    }

    /// Barrier variant for stores whose value is known; a null store needs no
    /// barrier.
    #[inline]
    pub fn write_barrier_to(&self, from: ObjectReference, to: Option<ObjectReference>) {
        if to.is_some() {
            self.write_barrier(from);
        }
    }

    /// Issue the store-store fence the concurrent collector relies on, if one
    /// is currently required.  Publishing a pointer to a freshly initialized
    /// object must not be observable before the object's initializing writes.
    #[inline]
    pub fn mutator_fence(&self) {
        if self.mutator_should_be_fenced() {
            fence(Ordering::SeqCst);
        }
    }

    /// Take this if you know that `from`'s state byte is below the barrier
    /// threshold.
    #[cold]
    pub(crate) fn write_barrier_slow_path(&self, from: ObjectReference) {
        if self.mutator_should_be_fenced() {
            // The collector blackens a cell before reading its slots; this
            // fence orders the mutator's store before the state re-check, so
            // one of the two sides always observes the other.
            fence(Ordering::SeqCst);
        }
        self.count_barrier();
        // Only an old-and-clean cell needs re-greying; losing the race means
        // someone else already queued it.
        if from
            .header()
            .cas_state(CellState::PossiblyBlack, CellState::PossiblyGrey)
        {
            self.add_to_remembered_set(from);
        }
    }
}
