//! A minimal in-tree runtime used by the test suite and the benches.  Cells
//! are arrays of reference slots; roots are whatever the tests protect or
//! register through marking constraints.

use std::sync::atomic::{AtomicUsize, Ordering};

use super::{Collection, GcThreadContext, RuntimeBinding, Scanning};
use crate::heap::Heap;
use crate::marking::SlotVisitor;
use crate::space::{CellKind, SubspaceDescriptor, CELL_HEADER_SIZE};
use crate::util::ObjectReference;

pub struct MockRuntime;

impl RuntimeBinding for MockRuntime {
    type Scanning = MockScanning;
    type Collection = MockCollection;
}

/// Every mock cell is an array of nullable reference slots.
pub struct MockScanning;

impl Scanning<MockRuntime> for MockScanning {
    fn scan_cell(cell: ObjectReference, visitor: &mut SlotVisitor<'_, MockRuntime>) {
        for index in 0..slot_count(cell) {
            visitor.visit_opt(get_slot(cell, index));
        }
    }

    fn scan_roots(_visitor: &mut SlotVisitor<'_, MockRuntime>) {
        // The mock runtime has no ambient roots; tests pin cells with
        // `Heap::protect` or register their own constraints.
    }
}

pub struct MockCollection;

impl Collection<MockRuntime> for MockCollection {
    fn spawn_gc_thread(ctx: GcThreadContext<MockRuntime>) {
        let name = match &ctx {
            GcThreadContext::Controller(_) => "tidemark-controller".to_string(),
            GcThreadContext::Marker(marker) => format!("tidemark-marker-{}", marker.ordinal()),
        };
        std::thread::Builder::new()
            .name(name)
            .spawn(move || match ctx {
                GcThreadContext::Controller(controller) => controller.run(),
                GcThreadContext::Marker(marker) => marker.run(),
            })
            .expect("failed to spawn GC thread");
    }
}

/// The one cell kind the mock runtime registers.
pub const MOCK_CELL: SubspaceDescriptor = SubspaceDescriptor::new("mock-cell");

pub fn register_mock_cell(heap: &Heap<MockRuntime>) -> CellKind {
    heap.register_cell_kind(MOCK_CELL)
}

/// Allocate a cell with `slots` reference slots.
pub fn allocate_cell(heap: &Heap<MockRuntime>, kind: CellKind, slots: usize) -> ObjectReference {
    heap.allocate(kind, slots * std::mem::size_of::<usize>())
}

pub fn slot_count(cell: ObjectReference) -> usize {
    (cell.header().cell_size() - CELL_HEADER_SIZE) / std::mem::size_of::<usize>()
}

fn slot(cell: ObjectReference, index: usize) -> &'static AtomicUsize {
    debug_assert!(index < slot_count(cell));
    let addr = cell.payload() + index * std::mem::size_of::<usize>();
    unsafe { addr.as_ref() }
}

pub fn get_slot(cell: ObjectReference, index: usize) -> Option<ObjectReference> {
    ObjectReference::from_raw(slot(cell, index).load(Ordering::SeqCst))
}

/// Store a reference into a slot, with the store fence and write barrier a
/// real runtime would emit.
pub fn set_slot(
    heap: &Heap<MockRuntime>,
    cell: ObjectReference,
    index: usize,
    value: Option<ObjectReference>,
) {
    heap.mutator_fence();
    slot(cell, index).store(value.map_or(0, |v| v.to_raw()), Ordering::SeqCst);
    heap.write_barrier_to(cell, value);
}
