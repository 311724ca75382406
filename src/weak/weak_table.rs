//! Weak-keyed tables.  The heap references registered tables weakly; a table
//! dropped by its owner simply falls out of the registry.  Pruning happens
//! after marking stabilizes and strictly before any dead cell's memory is
//! reused, so a lookup can never observe a reclaimed key.

use std::collections::HashMap;
use std::sync::{Mutex, Weak};

use crate::util::ObjectReference;

/// A table whose entries must die with their keys.
pub trait WeakGcTable: Send + Sync {
    /// Drop every entry whose key is dead.  `is_live` answers for any cell in
    /// the heap.
    fn prune(&self, is_live: &dyn Fn(ObjectReference) -> bool);
}

pub(crate) struct WeakTableRegistry {
    tables: Mutex<Vec<Weak<dyn WeakGcTable>>>,
}

impl WeakTableRegistry {
    pub fn new() -> Self {
        WeakTableRegistry {
            tables: Mutex::new(Vec::new()),
        }
    }

    pub fn register(&self, table: Weak<dyn WeakGcTable>) {
        self.tables.lock().unwrap().push(table);
    }

    pub fn unregister(&self, table: &Weak<dyn WeakGcTable>) {
        self.tables
            .lock()
            .unwrap()
            .retain(|t| !t.ptr_eq(table));
    }

    /// Prune every live table, dropping registrations whose owner went away.
    pub fn prune_all(&self, is_live: &dyn Fn(ObjectReference) -> bool) {
        let mut tables = self.tables.lock().unwrap();
        tables.retain(|weak| match weak.upgrade() {
            Some(table) => {
                table.prune(is_live);
                true
            }
            None => false,
        });
    }
}

/// A ready-made weak-keyed map for embedders (and the test suite).
pub struct WeakCellMap<V> {
    entries: Mutex<HashMap<ObjectReference, V>>,
}

impl<V: Send> WeakCellMap<V> {
    pub fn new() -> Self {
        WeakCellMap {
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn insert(&self, key: ObjectReference, value: V) {
        self.entries.lock().unwrap().insert(key, value);
    }

    pub fn remove(&self, key: ObjectReference) -> Option<V> {
        self.entries.lock().unwrap().remove(&key)
    }

    pub fn contains(&self, key: ObjectReference) -> bool {
        self.entries.lock().unwrap().contains_key(&key)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<V: Clone + Send> WeakCellMap<V> {
    pub fn get(&self, key: ObjectReference) -> Option<V> {
        self.entries.lock().unwrap().get(&key).cloned()
    }
}

impl<V: Send> Default for WeakCellMap<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: Send> WeakGcTable for WeakCellMap<V> {
    fn prune(&self, is_live: &dyn Fn(ObjectReference) -> bool) {
        let mut entries = self.entries.lock().unwrap();
        let before = entries.len();
        entries.retain(|&key, _| is_live(key));
        let pruned = before - entries.len();
        if pruned > 0 {
            trace!("pruned {} stale weak table entries", pruned);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn cell(raw: usize) -> ObjectReference {
        ObjectReference::from_raw(raw).unwrap()
    }

    #[test]
    fn prune_removes_dead_keys() {
        let table: Arc<WeakCellMap<u32>> = Arc::new(WeakCellMap::new());
        table.insert(cell(16), 1);
        table.insert(cell(32), 2);
        let registry = WeakTableRegistry::new();
        registry.register(Arc::downgrade(&table) as Weak<dyn WeakGcTable>);
        registry.prune_all(&|key| key == cell(32));
        assert!(!table.contains(cell(16)));
        assert!(table.contains(cell(32)));
    }

    #[test]
    fn dropped_tables_fall_out_of_the_registry() {
        let registry = WeakTableRegistry::new();
        {
            let table: Arc<WeakCellMap<u32>> = Arc::new(WeakCellMap::new());
            registry.register(Arc::downgrade(&table) as Weak<dyn WeakGcTable>);
        }
        // The owner is gone; pruning should not panic and should drop the
        // stale registration.
        registry.prune_all(&|_| true);
        assert!(registry.tables.lock().unwrap().is_empty());
    }

    #[test]
    fn unregister_by_identity() {
        let registry = WeakTableRegistry::new();
        let a: Arc<WeakCellMap<u32>> = Arc::new(WeakCellMap::new());
        let b: Arc<WeakCellMap<u32>> = Arc::new(WeakCellMap::new());
        a.insert(cell(16), 1);
        b.insert(cell(16), 1);
        registry.register(Arc::downgrade(&a) as Weak<dyn WeakGcTable>);
        registry.register(Arc::downgrade(&b) as Weak<dyn WeakGcTable>);
        let a_weak = Arc::downgrade(&a) as Weak<dyn WeakGcTable>;
        registry.unregister(&a_weak);
        registry.prune_all(&|_| false);
        assert!(a.contains(cell(16)), "unregistered table must not be pruned");
        assert!(!b.contains(cell(16)));
    }
}
