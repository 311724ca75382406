//! GC worker scheduling: the marker thread pool that executes sharded
//! marking, and the mutator scheduler that decides how wall-clock time is
//! split between the collector threads and the mutator during a concurrent
//! collection.

mod marker_pool;
mod mutator_scheduler;

pub use marker_pool::Marker;
pub(crate) use marker_pool::{MarkerPool, MarkerStat};
pub(crate) use mutator_scheduler::SpaceTimeScheduler;
