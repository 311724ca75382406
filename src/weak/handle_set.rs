//! Protect-counted roots and weak handles.
//!
//! `protect`/`unprotect` pin cells on behalf of API callers that cannot
//! participate in root scanning; the protected set is re-reported to the
//! marker every fixpoint iteration.  Weak handles are shared slots the heap
//! clears when their target dies, swept after user finalizers run because
//! finalizers may themselves read weak state.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::util::ObjectReference;

/// A weak reference slot.  Holders keep an `Arc<WeakHandle>`; the heap keeps
/// a `Weak` and clears the slot when the target is reclaimed.
pub struct WeakHandle {
    target: AtomicUsize,
}

impl WeakHandle {
    fn new(target: ObjectReference) -> Self {
        WeakHandle {
            target: AtomicUsize::new(target.to_raw()),
        }
    }

    /// The target, unless it has been collected.
    pub fn get(&self) -> Option<ObjectReference> {
        ObjectReference::from_raw(self.target.load(Ordering::SeqCst))
    }

    fn clear(&self) {
        self.target.store(0, Ordering::SeqCst);
    }
}

pub(crate) struct HandleSet {
    protected: Mutex<HashMap<ObjectReference, usize>>,
    weak_handles: Mutex<Vec<Weak<WeakHandle>>>,
}

impl HandleSet {
    pub fn new() -> Self {
        HandleSet {
            protected: Mutex::new(HashMap::new()),
            weak_handles: Mutex::new(Vec::new()),
        }
    }

    pub fn protect(&self, cell: ObjectReference) {
        *self.protected.lock().unwrap().entry(cell).or_insert(0) += 1;
    }

    /// Returns true when the protect count drops to zero.
    pub fn unprotect(&self, cell: ObjectReference) -> bool {
        let mut protected = self.protected.lock().unwrap();
        match protected.get_mut(&cell) {
            Some(count) if *count > 1 => {
                *count -= 1;
                false
            }
            Some(_) => {
                protected.remove(&cell);
                true
            }
            None => panic!("unprotect of a cell that is not protected"),
        }
    }

    pub fn protected_count(&self) -> usize {
        self.protected.lock().unwrap().len()
    }

    pub fn for_each_protected<F>(&self, mut f: F)
    where
        F: FnMut(ObjectReference),
    {
        for &cell in self.protected.lock().unwrap().keys() {
            f(cell);
        }
    }

    pub fn make_weak_handle(&self, target: ObjectReference) -> Arc<WeakHandle> {
        let handle = Arc::new(WeakHandle::new(target));
        self.weak_handles.lock().unwrap().push(Arc::downgrade(&handle));
        handle
    }

    /// Clear every handle whose target died; drop registrations whose holder
    /// went away.
    pub fn reap_weak_handles(&self, is_live: &dyn Fn(ObjectReference) -> bool) {
        let mut handles = self.weak_handles.lock().unwrap();
        handles.retain(|weak| match weak.upgrade() {
            Some(handle) => {
                if let Some(target) = handle.get() {
                    if !is_live(target) {
                        handle.clear();
                    }
                }
                true
            }
            None => false,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cell(raw: usize) -> ObjectReference {
        ObjectReference::from_raw(raw).unwrap()
    }

    #[test]
    fn protect_counts_nest() {
        let handles = HandleSet::new();
        handles.protect(cell(16));
        handles.protect(cell(16));
        assert_eq!(handles.protected_count(), 1);
        assert!(!handles.unprotect(cell(16)));
        assert!(handles.unprotect(cell(16)));
        assert_eq!(handles.protected_count(), 0);
    }

    #[test]
    #[should_panic(expected = "not protected")]
    fn unbalanced_unprotect_panics() {
        let handles = HandleSet::new();
        handles.unprotect(cell(16));
    }

    #[test]
    fn weak_handles_clear_on_death() {
        let handles = HandleSet::new();
        let live = handles.make_weak_handle(cell(16));
        let dead = handles.make_weak_handle(cell(32));
        handles.reap_weak_handles(&|target| target == cell(16));
        assert_eq!(live.get(), Some(cell(16)));
        assert_eq!(dead.get(), None);
    }

    #[test]
    fn dropped_holders_fall_out() {
        let handles = HandleSet::new();
        drop(handles.make_weak_handle(cell(16)));
        handles.reap_weak_handles(&|_| true);
        assert!(handles.weak_handles.lock().unwrap().is_empty());
    }
}
