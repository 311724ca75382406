//! The interface between the collector core and the embedding runtime.
//!
//! The runtime supplies the pieces the core treats as external
//! collaborators: per-type visit logic, root enumeration, compiler-thread
//! control, and GC thread spawning.  The core never assumes anything about
//! object layout beyond "a cell has a header and can be asked to enumerate
//! its references".

pub mod mock;

use crate::heap::Controller;
use crate::marking::SlotVisitor;
use crate::scheduler::Marker;
use crate::util::ObjectReference;

/// The root trait an embedding runtime implements.
pub trait RuntimeBinding: 'static + Send + Sync + Sized {
    type Scanning: Scanning<Self>;
    type Collection: Collection<Self>;
}

/// Object-graph introspection supplied by the runtime.
pub trait Scanning<R: RuntimeBinding> {
    /// Enumerate the outgoing references of `cell` into the visitor.  Called
    /// concurrently with the mutator, so reference slots must be read with
    /// sequentially consistent atomics; racing stores are sound because the
    /// mutator's write barrier re-queues the cell.
    fn scan_cell(cell: ObjectReference, visitor: &mut SlotVisitor<'_, R>);

    /// Report every root the runtime knows about: conservative stack scans,
    /// global handles, compiler worklist references.  Executed once per
    /// fixpoint iteration, so it must be safe to run repeatedly.
    fn scan_roots(visitor: &mut SlotVisitor<'_, R>);
}

/// A GC thread about to be spawned.  The binding owns thread creation so the
/// runtime can set up thread-local state, naming, and affinity its own way.
pub enum GcThreadContext<R: RuntimeBinding> {
    /// The thread driving phase transitions in async mode.
    Controller(Box<Controller<R>>),
    /// One of the pool of marker threads.
    Marker(Box<Marker<R>>),
}

/// Runtime-side collection hooks.
pub trait Collection<R: RuntimeBinding> {
    /// Spawn a GC thread.  The implementation must eventually call `run()` on
    /// the boxed context, typically from a fresh thread.
    fn spawn_gc_thread(ctx: GcThreadContext<R>);

    /// Stop the runtime's compiler threads so no new code is emitted
    /// referencing heap cells mid-collection.
    fn suspend_compiler_threads() {}

    /// Resume them at the end of the cycle.
    fn resume_compiler_threads() {}
}
