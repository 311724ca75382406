//! GC deferral scopes.  Some operations allocate several related objects
//! that must all survive together before any of them becomes individually
//! reachable; a `DeferGc` scope keeps allocation from triggering a collection
//! until the scope exits, at which point the deferred check runs.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use super::global::Heap;
use crate::binding::RuntimeBinding;

pub(crate) struct DeferralState {
    depth: AtomicUsize,
    did_defer_work: AtomicBool,
}

impl DeferralState {
    pub fn new() -> Self {
        DeferralState {
            depth: AtomicUsize::new(0),
            did_defer_work: AtomicBool::new(false),
        }
    }

    pub fn is_deferred(&self) -> bool {
        self.depth.load(Ordering::Relaxed) != 0
    }

    pub fn increment(&self) {
        self.depth.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns true if the depth dropped to zero with a deferred check
    /// pending.
    pub fn decrement(&self) -> bool {
        let old = self.depth.fetch_sub(1, Ordering::Relaxed);
        assert!(old > 0, "unbalanced GC deferral");
        old == 1 && self.did_defer_work.swap(false, Ordering::Relaxed)
    }

    pub fn note_deferred_work(&self) {
        self.did_defer_work.store(true, Ordering::Relaxed);
    }
}

/// An RAII scope preventing allocation inside it from triggering a
/// collection.  Scopes nest; the coalesced check runs when the outermost
/// scope exits.
pub struct DeferGc<'h, R: RuntimeBinding> {
    heap: &'h Heap<R>,
}

impl<'h, R: RuntimeBinding> DeferGc<'h, R> {
    pub fn new(heap: &'h Heap<R>) -> Self {
        heap.increment_deferral_depth();
        DeferGc { heap }
    }
}

impl<R: RuntimeBinding> Drop for DeferGc<'_, R> {
    fn drop(&mut self) {
        self.heap.decrement_deferral_depth_and_gc_if_needed();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deferral_depth_nests() {
        let state = DeferralState::new();
        assert!(!state.is_deferred());
        state.increment();
        state.increment();
        assert!(state.is_deferred());
        state.note_deferred_work();
        assert!(!state.decrement());
        assert!(state.decrement());
        assert!(!state.is_deferred());
    }

    #[test]
    #[should_panic(expected = "unbalanced")]
    fn unbalanced_deferral_panics() {
        let state = DeferralState::new();
        state.decrement();
    }
}
