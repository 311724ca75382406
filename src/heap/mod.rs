//! The heap orchestrator: the phase state machine, the mutator/collector
//! handshake, request tickets, pacing, and the End-phase reconciliation.

mod controller;
mod defer;
mod global;
mod pacing;
mod phase;
mod requests;
mod stats;
mod world;

pub use controller::Controller;
pub(crate) use controller::ControllerMessage;
pub use defer::DeferGc;
pub use global::{Heap, HeapConfig, HeapFinalizerCallback, HeapObserver};
pub use phase::{CollectionScope, CollectorPhase, GcConductor, Synchronousness};
pub use requests::GcRequest;
