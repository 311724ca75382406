//! Tidemark is a concurrent, incremental, generational garbage collector core
//! for embedding in language runtimes.
//!
//! The crate owns the collector's phase state machine, the mutator/collector
//! handshake protocol, tri-color marking with a write barrier, heap sizing and
//! pacing, and the weak-reference/finalization reconciliation that ends a
//! collection cycle.  Everything else -- object layout, per-type tracing
//! logic, compiler threads, root enumeration -- is supplied by the embedding
//! runtime through the [`binding::RuntimeBinding`] trait.
//!
//! A runtime embeds Tidemark by:
//!
//! 1.  Implementing [`binding::RuntimeBinding`] (object scanning, root
//!     enumeration, GC thread spawning).
//! 2.  Creating a [`heap::Heap`] from a [`heap::HeapConfig`], registering its
//!     cell kinds, and calling [`heap::Heap::notify_is_safe_to_collect`] once
//!     bring-up is complete.
//! 3.  Calling [`heap::Heap::stop_if_necessary`] at safepoints,
//!     [`heap::Heap::write_barrier`] on every heap-pointer store, and
//!     [`heap::Heap::allocate`] to allocate cells.

#[macro_use]
extern crate log;
#[macro_use]
extern crate static_assertions;

pub mod binding;
pub mod heap;
pub mod marking;
pub mod scheduler;
pub mod space;
pub mod util;
pub mod weak;

pub use crate::heap::{
    CollectionScope, CollectorPhase, GcRequest, Heap, HeapConfig, Synchronousness,
};
pub use crate::util::{Address, ObjectReference};
