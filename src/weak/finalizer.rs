//! Per-cell conditional finalizers and the dead-code-stub registry.
//!
//! A conditional finalizer runs exactly once, for a cell found dead at the
//! end of a marking cycle, strictly before the cell's memory is released.
//! Code stubs are destroyed after finalizers ran, once their owning cell is
//! dead.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::util::ObjectReference;

/// A per-cell finalizer: a plain function or a closure.
pub enum Finalizer {
    Function(fn(ObjectReference)),
    Closure(Box<dyn FnOnce(ObjectReference) + Send>),
}

impl Finalizer {
    pub(crate) fn invoke(self, cell: ObjectReference) {
        match self {
            Finalizer::Function(f) => f(cell),
            Finalizer::Closure(f) => f(cell),
        }
    }
}

pub(crate) struct FinalizerTable {
    entries: Mutex<HashMap<ObjectReference, Vec<Finalizer>>>,
}

impl FinalizerTable {
    pub fn new() -> Self {
        FinalizerTable {
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn add(&self, cell: ObjectReference, finalizer: Finalizer) {
        self.entries
            .lock()
            .unwrap()
            .entry(cell)
            .or_default()
            .push(finalizer);
    }

    /// Remove and return the finalizers of every dead cell.  Removal is what
    /// makes "exactly once" hold: a cell's entry can only be taken in the
    /// cycle that found it dead, and its address cannot be reused before the
    /// End phase finishes.
    pub fn take_dead(
        &self,
        is_live: &dyn Fn(ObjectReference) -> bool,
    ) -> Vec<(ObjectReference, Vec<Finalizer>)> {
        let mut entries = self.entries.lock().unwrap();
        let dead_keys: Vec<ObjectReference> =
            entries.keys().copied().filter(|&c| !is_live(c)).collect();
        dead_keys
            .into_iter()
            .map(|cell| {
                let finalizers = entries.remove(&cell).unwrap();
                (cell, finalizers)
            })
            .collect()
    }

    /// Drain everything.  Used at shutdown, when every cell is about to die
    /// with the heap.
    pub fn take_all(&self) -> Vec<(ObjectReference, Vec<Finalizer>)> {
        self.entries.lock().unwrap().drain().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }
}

/// Compiled-code stubs owned by heap cells.  A stub whose owner died is
/// destroyed at the end of the cycle, after finalizers and handle sweeping,
/// so nothing can still reach it.
pub(crate) struct CodeStubSet {
    stubs: Mutex<Vec<CodeStub>>,
}

struct CodeStub {
    owner: ObjectReference,
    destructor: Box<dyn FnOnce() + Send>,
}

impl CodeStubSet {
    pub fn new() -> Self {
        CodeStubSet {
            stubs: Mutex::new(Vec::new()),
        }
    }

    pub fn add(&self, owner: ObjectReference, destructor: Box<dyn FnOnce() + Send>) {
        self.stubs.lock().unwrap().push(CodeStub { owner, destructor });
    }

    /// Destroy stubs with dead owners.  Returns how many died.
    pub fn delete_dead(&self, is_live: &dyn Fn(ObjectReference) -> bool) -> usize {
        let mut stubs = self.stubs.lock().unwrap();
        let mut dead = Vec::new();
        let mut index = 0;
        while index < stubs.len() {
            if is_live(stubs[index].owner) {
                index += 1;
            } else {
                dead.push(stubs.swap_remove(index));
            }
        }
        drop(stubs);
        let count = dead.len();
        for stub in dead {
            (stub.destructor)();
        }
        count
    }

    pub fn len(&self) -> usize {
        self.stubs.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn cell(raw: usize) -> ObjectReference {
        ObjectReference::from_raw(raw).unwrap()
    }

    #[test]
    fn take_dead_is_exactly_once() {
        let table = FinalizerTable::new();
        table.add(cell(16), Finalizer::Function(|_| {}));
        let first = table.take_dead(&|_| false);
        assert_eq!(first.len(), 1);
        let second = table.take_dead(&|_| false);
        assert!(second.is_empty());
    }

    #[test]
    fn live_cells_keep_their_finalizers() {
        let table = FinalizerTable::new();
        table.add(cell(16), Finalizer::Function(|_| {}));
        assert!(table.take_dead(&|_| true).is_empty());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn closure_finalizers_capture_state() {
        let table = FinalizerTable::new();
        let ran = Arc::new(AtomicUsize::new(0));
        let ran2 = ran.clone();
        table.add(
            cell(16),
            Finalizer::Closure(Box::new(move |_| {
                ran2.fetch_add(1, Ordering::SeqCst);
            })),
        );
        for (cell, finalizers) in table.take_dead(&|_| false) {
            for f in finalizers {
                f.invoke(cell);
            }
        }
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn stubs_die_with_their_owners() {
        let stubs = CodeStubSet::new();
        let destroyed = Arc::new(AtomicUsize::new(0));
        for raw in [16usize, 32, 48] {
            let destroyed = destroyed.clone();
            stubs.add(
                cell(raw),
                Box::new(move || {
                    destroyed.fetch_add(1, Ordering::SeqCst);
                }),
            );
        }
        let dead = stubs.delete_dead(&|owner| owner == cell(32));
        assert_eq!(dead, 2);
        assert_eq!(destroyed.load(Ordering::SeqCst), 2);
        assert_eq!(stubs.len(), 1);
    }
}
