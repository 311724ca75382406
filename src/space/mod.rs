//! The marked space: blocks of size-classed cells, their headers, and the
//! registry of cell kinds.  The space is the allocator-side collaborator of
//! the collector; the orchestrator consumes it through `allocate`, sweep
//! hooks and cell enumeration, and does not reach into block internals.

mod cell;
mod marked_space;

pub use cell::{CellHeader, CellState, HeapVersion, CELL_HEADER_SIZE, STALE_MARK_VERSION};
pub use cell::{BLACK_THRESHOLD, TAUTOLOGICAL_THRESHOLD};
pub use marked_space::{MarkedSpace, SweepOutcome};

use crate::util::ObjectReference;
use std::sync::Mutex;

/// Identifies a registered cell kind.  The embedding runtime dispatches its
/// per-type visit logic on this tag.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct CellKind(pub u32);

/// What the heap knows about one kind of cell.  New kinds are added by
/// registering another descriptor, not by growing the heap itself.
#[derive(Copy, Clone)]
pub struct SubspaceDescriptor {
    pub name: &'static str,
    /// Invoked in bulk for every dead cell of this kind at the end of a
    /// cycle, before the cell's memory is reused.  Runs with the world
    /// stopped and block directories locked; it must not allocate.
    pub unconditional_finalizer: Option<fn(ObjectReference)>,
}

impl SubspaceDescriptor {
    pub const fn new(name: &'static str) -> Self {
        SubspaceDescriptor {
            name,
            unconditional_finalizer: None,
        }
    }
}

/// The table of registered cell kinds.
pub struct KindRegistry {
    kinds: Mutex<Vec<SubspaceDescriptor>>,
}

impl KindRegistry {
    pub fn new() -> Self {
        KindRegistry {
            kinds: Mutex::new(Vec::new()),
        }
    }

    pub fn register(&self, descriptor: SubspaceDescriptor) -> CellKind {
        let mut kinds = self.kinds.lock().unwrap();
        kinds.push(descriptor);
        CellKind((kinds.len() - 1) as u32)
    }

    pub fn descriptor(&self, kind: CellKind) -> SubspaceDescriptor {
        let kinds = self.kinds.lock().unwrap();
        kinds[kind.0 as usize]
    }
}

impl Default for KindRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_are_dense() {
        let registry = KindRegistry::new();
        let a = registry.register(SubspaceDescriptor::new("a"));
        let b = registry.register(SubspaceDescriptor::new("b"));
        assert_eq!(a, CellKind(0));
        assert_eq!(b, CellKind(1));
        assert_eq!(registry.descriptor(b).name, "b");
    }
}
