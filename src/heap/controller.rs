//! The dedicated collector thread.  In async mode it sleeps on its mailbox
//! until a collection is requested, then drives the phase machine to
//! completion, serving the whole request backlog before sleeping again.

use crossbeam::channel::Receiver;
use std::sync::Arc;

use super::global::Heap;
use crate::binding::RuntimeBinding;

pub(crate) enum ControllerMessage {
    /// A collection was requested (or became runnable).
    Wake,
    /// The heap is shutting down.
    Exit,
}

/// The collector thread's half.  The binding's `spawn_gc_thread` receives it
/// boxed and calls [`Controller::run`] on the new thread.
pub struct Controller<R: RuntimeBinding> {
    heap: Arc<Heap<R>>,
    mailbox: Receiver<ControllerMessage>,
}

impl<R: RuntimeBinding> Controller<R> {
    pub(crate) fn new(heap: Arc<Heap<R>>, mailbox: Receiver<ControllerMessage>) -> Self {
        Controller { heap, mailbox }
    }

    pub fn run(self) {
        debug!("collector thread running");
        loop {
            match self.mailbox.recv() {
                Ok(ControllerMessage::Wake) => {}
                Ok(ControllerMessage::Exit) | Err(_) => break,
            }
            // Coalesce a burst of wakes into one driving pass.
            let mut exit = false;
            while let Ok(message) = self.mailbox.try_recv() {
                if matches!(message, ControllerMessage::Exit) {
                    exit = true;
                }
            }
            if exit {
                break;
            }
            self.heap.drive_as_collector();
        }
        debug!("collector thread exiting");
    }
}
