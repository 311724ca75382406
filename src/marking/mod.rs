//! Tri-color marking: the mark stacks, the tracing agent ([`SlotVisitor`]),
//! the fixpoint constraint set, and the write barrier.

mod barrier;
mod constraints;
mod mark_stack;
mod slot_visitor;

pub use constraints::{FnConstraint, MarkingConstraint};
pub(crate) use constraints::{
    MarkingConstraintSet, ProtectedCellsConstraint, RememberedSetConstraint, RuntimeRootsConstraint,
};
pub(crate) use mark_stack::{MarkStack, QuiesceState, SharedMarkStack};
pub use slot_visitor::SlotVisitor;
pub(crate) use slot_visitor::DrainOutcome;
