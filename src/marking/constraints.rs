//! Marking constraints: external callbacks that may discover more roots each
//! fixpoint iteration.  The fixpoint terminates only when a full pass over
//! all constraints plus a full stack drain produce zero new grey cells.

use super::slot_visitor::SlotVisitor;
use crate::binding::{RuntimeBinding, Scanning};

/// A root-producing collaborator.  Executed once per fixpoint iteration with
/// the visitor to push newly visible roots into.
///
/// Constraints must not register further constraints from inside `execute`;
/// the set is locked for the duration of a pass.
pub trait MarkingConstraint<R: RuntimeBinding>: Send + Sync {
    fn name(&self) -> &str;
    fn execute(&self, visitor: &mut SlotVisitor<'_, R>);
}

/// A constraint from a plain function or closure.
pub struct FnConstraint<F> {
    name: &'static str,
    f: F,
}

impl<F> FnConstraint<F> {
    pub fn new(name: &'static str, f: F) -> Self {
        FnConstraint { name, f }
    }
}

impl<R, F> MarkingConstraint<R> for FnConstraint<F>
where
    R: RuntimeBinding,
    F: Fn(&mut SlotVisitor<'_, R>) + Send + Sync,
{
    fn name(&self) -> &str {
        self.name
    }

    fn execute(&self, visitor: &mut SlotVisitor<'_, R>) {
        (self.f)(visitor)
    }
}

/// The runtime's own roots: conservative stack scan, global handles,
/// compiler worklists.  Whatever the binding reports.
pub(crate) struct RuntimeRootsConstraint;

impl<R: RuntimeBinding> MarkingConstraint<R> for RuntimeRootsConstraint {
    fn name(&self) -> &str {
        "runtime-roots"
    }

    fn execute(&self, visitor: &mut SlotVisitor<'_, R>) {
        <R::Scanning as Scanning<R>>::scan_roots(visitor);
    }
}

/// Cells pinned by `Heap::protect` on behalf of C-API style callers.
pub(crate) struct ProtectedCellsConstraint;

impl<R: RuntimeBinding> MarkingConstraint<R> for ProtectedCellsConstraint {
    fn name(&self) -> &str {
        "protected-cells"
    }

    fn execute(&self, visitor: &mut SlotVisitor<'_, R>) {
        let heap = visitor.heap();
        heap.for_each_protected_cell(|cell| visitor.visit(cell));
    }
}

/// Old cells remembered by the write barrier since the last cycle.  Their
/// children may be unmarked even though the cells themselves are stamped, so
/// they are queued for re-tracing rather than merely marked.
pub(crate) struct RememberedSetConstraint;

impl<R: RuntimeBinding> MarkingConstraint<R> for RememberedSetConstraint {
    fn name(&self) -> &str {
        "remembered-set"
    }

    fn execute(&self, visitor: &mut SlotVisitor<'_, R>) {
        let heap = visitor.heap();
        for cell in heap.take_remembered_set() {
            visitor.rescan(cell);
        }
    }
}

pub(crate) struct MarkingConstraintSet<R: RuntimeBinding> {
    constraints: Vec<Box<dyn MarkingConstraint<R>>>,
}

impl<R: RuntimeBinding> MarkingConstraintSet<R> {
    pub fn new() -> Self {
        MarkingConstraintSet {
            constraints: Vec::new(),
        }
    }

    pub fn add(&mut self, constraint: Box<dyn MarkingConstraint<R>>) {
        self.constraints.push(constraint);
    }

    /// One pass over every constraint.  Returns how many cells the pass newly
    /// discovered; zero (together with drained stacks) means the fixpoint is
    /// stable.
    pub fn execute_all(&self, visitor: &mut SlotVisitor<'_, R>) -> usize {
        let before = visitor.newly_marked();
        for constraint in &self.constraints {
            let at_entry = visitor.newly_marked();
            constraint.execute(visitor);
            trace!(
                "constraint {} discovered {} cells",
                constraint.name(),
                visitor.newly_marked() - at_entry
            );
        }
        visitor.newly_marked() - before
    }
}
