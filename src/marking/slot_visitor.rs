//! The tracing agent.  A visitor pops cells off its work list, invokes their
//! type-specific visit logic, and pushes newly discovered cells.  One visitor
//! drives the mutator's incremental marking; the markers each drive their own
//! during parallel and concurrent draining.

use std::time::Instant;

use super::mark_stack::MarkStack;
use crate::binding::{RuntimeBinding, Scanning};
use crate::heap::Heap;
use crate::space::CellState;
use crate::util::constants::{DONATION_THRESHOLD, DRAIN_CHECK_INTERVAL, MARK_BATCH_SIZE};
use crate::util::ObjectReference;

/// Why a drain returned.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum DrainOutcome {
    /// Local stack is empty.
    Drained,
    /// The deadline passed; undrained work remains local until donated.
    DeadlineHit,
    /// The byte budget was spent.
    BudgetHit,
}

pub struct SlotVisitor<'h, R: RuntimeBinding> {
    heap: &'h Heap<R>,
    local: MarkStack,
    mark_version: u32,
    /// Cells this visitor transitioned white to grey.
    newly_marked: usize,
    /// Cells this visitor traced to black.
    visit_count: usize,
    bytes_visited: usize,
}

impl<'h, R: RuntimeBinding> SlotVisitor<'h, R> {
    pub(crate) fn new(heap: &'h Heap<R>) -> Self {
        SlotVisitor {
            heap,
            local: MarkStack::new(),
            mark_version: heap.mark_version(),
            newly_marked: 0,
            visit_count: 0,
            bytes_visited: 0,
        }
    }

    pub fn heap(&self) -> &'h Heap<R> {
        self.heap
    }

    /// Report one outgoing reference of the cell being visited.  This is the
    /// atomic white-to-grey transition: the cell is pushed at most once.
    pub fn visit(&mut self, object: ObjectReference) {
        if !object.header().test_and_set_marked(self.mark_version) {
            self.newly_marked += 1;
            self.local.push(object);
            if self.local.len() > DONATION_THRESHOLD {
                self.donate_excess();
            }
        }
    }

    /// Convenience for nullable slots.
    pub fn visit_opt(&mut self, object: Option<ObjectReference>) {
        if let Some(object) = object {
            self.visit(object);
        }
    }

    /// Queue an already-marked cell for re-tracing.  Used for remembered
    /// cells, whose children may be unmarked even though the cell itself is
    /// stamped.
    pub fn rescan(&mut self, object: ObjectReference) {
        if !object.header().test_and_set_marked(self.mark_version) {
            self.newly_marked += 1;
        }
        self.local.push(object);
    }

    /// Cells newly discovered by this visitor so far.  The fixpoint uses the
    /// delta across a constraint pass to decide convergence.
    pub(crate) fn newly_marked(&self) -> usize {
        self.newly_marked
    }

    pub(crate) fn bytes_visited(&self) -> usize {
        self.bytes_visited
    }

    pub(crate) fn visit_count(&self) -> usize {
        self.visit_count
    }

    pub(crate) fn local_is_empty(&self) -> bool {
        self.local.is_empty()
    }

    fn visit_children(&mut self, cell: ObjectReference) {
        // Leaving the work list transitions the cell to black before its
        // slots are read.  A store racing with this scan either lands before
        // the transition (and the scan reads it) or runs the barrier's slow
        // path against the black state and re-queues the cell.
        cell.header().store_state(CellState::PossiblyBlack);
        <R::Scanning as Scanning<R>>::scan_cell(cell, self);
        self.visit_count += 1;
        self.bytes_visited += cell.header().cell_size();
    }

    fn donate_excess(&mut self) {
        let donated = self.local.take_lower_half();
        self.heap.shared_mark_stack().donate(donated);
    }

    /// Give everything local back to the shared stack.
    pub(crate) fn donate_all(&mut self) {
        let donated = self.local.take_all();
        self.heap.shared_mark_stack().donate(donated);
    }

    /// Drain the local stack.  Checks the deadline every few cells; a byte
    /// budget bounds incremental mutator drains.
    pub(crate) fn drain(
        &mut self,
        deadline: Option<Instant>,
        byte_budget: Option<usize>,
    ) -> DrainOutcome {
        let budget_floor = byte_budget.map(|b| self.bytes_visited + b);
        let mut until_check = DRAIN_CHECK_INTERVAL;
        while let Some(cell) = self.local.pop() {
            self.visit_children(cell);
            if let Some(floor) = budget_floor {
                if self.bytes_visited >= floor {
                    return DrainOutcome::BudgetHit;
                }
            }
            until_check -= 1;
            if until_check == 0 {
                until_check = DRAIN_CHECK_INTERVAL;
                if let Some(deadline) = deadline {
                    if Instant::now() >= deadline {
                        return DrainOutcome::DeadlineHit;
                    }
                }
            }
        }
        DrainOutcome::Drained
    }

    /// Drain the local stack and keep pulling batches from the shared stack
    /// until both run dry or the deadline passes.  Returns true when marking
    /// ran completely dry (shared stack quiescent included).
    pub(crate) fn drain_with_shared(&mut self, deadline: Option<Instant>) -> bool {
        use super::mark_stack::QuiesceState;
        let shared = self.heap.shared_mark_stack();
        loop {
            if !self.local.is_empty() {
                match self.drain(deadline, None) {
                    DrainOutcome::Drained => {}
                    DrainOutcome::DeadlineHit => {
                        self.donate_all();
                        return false;
                    }
                    DrainOutcome::BudgetHit => unreachable!(),
                }
            }
            if shared.try_take(&mut self.local, MARK_BATCH_SIZE) {
                let outcome = self.drain(deadline, None);
                self.donate_if_interrupted(&outcome);
                shared.finish_drainer();
                if outcome == DrainOutcome::DeadlineHit {
                    return false;
                }
                continue;
            }
            match shared.wait_quiescent(deadline) {
                QuiesceState::Quiet => return true,
                QuiesceState::Timeout => return false,
                QuiesceState::WorkAvailable => continue,
            }
        }
    }

    fn donate_if_interrupted(&mut self, outcome: &DrainOutcome) {
        if *outcome != DrainOutcome::Drained {
            self.donate_all();
        }
    }

    /// Block until the shared stack hands this visitor a batch.  Returns
    /// false when the stack is shutting down.  Marker threads live here.
    pub(crate) fn take_blocking_from_shared(&mut self) -> bool {
        self.heap.shared_mark_stack().take_blocking(&mut self.local)
    }

    /// Non-blocking batch grab.  The caller becomes a busy drainer on
    /// success.
    pub(crate) fn try_take_from_shared(&mut self) -> bool {
        self.heap
            .shared_mark_stack()
            .try_take(&mut self.local, MARK_BATCH_SIZE)
    }

    /// A bounded incremental drain on the mutator's dime.  Returns the bytes
    /// visited by this increment.
    pub(crate) fn drain_increment(&mut self, byte_budget: usize) -> usize {
        debug_assert!(self.local_is_empty(), "increments start with a fresh visitor");
        let shared = self.heap.shared_mark_stack();
        let before = self.bytes_visited;
        while self.bytes_visited - before < byte_budget {
            if self.local.is_empty() && !shared.try_take(&mut self.local, MARK_BATCH_SIZE) {
                break;
            }
            let outcome = self.drain(None, Some(byte_budget - (self.bytes_visited - before)));
            self.donate_if_interrupted(&outcome);
            shared.finish_drainer();
            if outcome == DrainOutcome::BudgetHit {
                break;
            }
        }
        self.bytes_visited - before
    }
}
