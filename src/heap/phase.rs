//! The collector's phase vocabulary and the legal transitions between
//! phases.  Exactly one of {mutator, collector} holds the conn (the right to
//! drive the next transition) at any time; transitions only happen inside the
//! transition functions in `heap::global`.

use bytemuck::NoUninit;
use enum_map::Enum;

/// Where the collector is in its cycle.
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, NoUninit, Enum)]
pub enum CollectorPhase {
    /// No cycle in flight.
    NotRunning,
    /// Stop compiler threads, pick the collection scope, snapshot stats.
    Begin,
    /// Gather roots and seed the mark stacks.
    FixpointBegin,
    /// Stop-the-world constraint fixpoint and draining.
    Fixpoint,
    /// Decision point: marking converged, or hand off to concurrent marking.
    FixpointEnd,
    /// The mutator runs while markers drain barrier-generated work.
    Concurrent,
    /// Stop the world again and re-check the constraints.
    Reloop,
    /// Weak reconciliation, finalization, sweeping, limit update.
    End,
}

impl CollectorPhase {
    pub fn can_transition_to(self, next: CollectorPhase) -> bool {
        use CollectorPhase::*;
        matches!(
            (self, next),
            (NotRunning, Begin)
                | (Begin, FixpointBegin)
                | (FixpointBegin, Fixpoint)
                | (Fixpoint, FixpointEnd)
                | (FixpointEnd, Concurrent)
                | (FixpointEnd, End)
                | (Concurrent, Reloop)
                | (Reloop, Fixpoint)
                | (Reloop, FixpointEnd)
                | (End, NotRunning)
        )
    }

    /// Is marking machinery live in this phase?
    pub fn is_marking(self) -> bool {
        use CollectorPhase::*;
        matches!(self, FixpointBegin | Fixpoint | FixpointEnd | Concurrent | Reloop)
    }

    pub fn is_running(self) -> bool {
        self != CollectorPhase::NotRunning
    }
}

/// How much of the heap a cycle collects.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum CollectionScope {
    /// Only cells allocated since the last collection.
    Eden,
    /// The entire heap, old and new generations.
    Full,
}

/// Whether a collection entry point waits for the cycle to complete.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Synchronousness {
    Sync,
    Async,
}

/// Which side is driving the phase machine.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum GcConductor {
    Mutator,
    Collector,
}
