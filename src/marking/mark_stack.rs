//! Work lists of cells pending trace.
//!
//! Each visitor owns a local [`MarkStack`]; excess work is donated to the
//! heap's [`SharedMarkStack`], which markers, the conductor and the mutator's
//! incremental drains all pull from.  The shared stack is a plain
//! lock-plus-condvar structure: entries may appear only while their cell is
//! grey, and leaving the stack (followed by the visit) transitions the cell
//! to black.

use std::sync::{Condvar, Mutex};
use std::time::Instant;

use crate::util::constants::MARK_BATCH_SIZE;
use crate::util::ObjectReference;

/// A visitor-local work list.  Order is irrelevant; this is a multiset.
pub(crate) struct MarkStack {
    entries: Vec<ObjectReference>,
}

impl MarkStack {
    pub fn new() -> Self {
        MarkStack { entries: Vec::new() }
    }

    pub fn push(&mut self, cell: ObjectReference) {
        self.entries.push(cell);
    }

    pub fn pop(&mut self) -> Option<ObjectReference> {
        self.entries.pop()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Split off the lower half for donation, keeping the hot top half local.
    pub fn take_lower_half(&mut self) -> Vec<ObjectReference> {
        let keep = self.entries.len() / 2;
        let donated = self.entries.split_off(keep);
        std::mem::replace(&mut self.entries, donated)
    }

    pub fn take_all(&mut self) -> Vec<ObjectReference> {
        std::mem::take(&mut self.entries)
    }

    pub fn extend(&mut self, cells: Vec<ObjectReference>) {
        self.entries.extend(cells);
    }
}

/// What a quiescence wait observed.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum QuiesceState {
    /// No entries and no busy drainer: marking has (for now) run dry.
    Quiet,
    /// The deadline passed first.
    Timeout,
    /// New entries appeared; the caller should drain instead of waiting.
    WorkAvailable,
}

struct SharedStackSync {
    entries: Vec<ObjectReference>,
    /// Drainers that popped a batch and have not yet reported back.  The
    /// stack is only quiescent when this is zero and `entries` is empty.
    busy: usize,
    marking_active: bool,
    /// Set while the mutator scheduler has assigned the current timeslice to
    /// the mutator; markers do not start new batches.
    throttled: bool,
    shutdown: bool,
}

/// The shared mark stack.  All synchronization is this one lock plus the two
/// condition variables; there is nothing lock-free here.
pub(crate) struct SharedMarkStack {
    sync: Mutex<SharedStackSync>,
    /// Markers wait here for entries, activation, or un-throttling.
    work_available: Condvar,
    /// The conductor waits here for the stack to run dry.
    quiescent: Condvar,
}

impl SharedMarkStack {
    pub fn new() -> Self {
        SharedMarkStack {
            sync: Mutex::new(SharedStackSync {
                entries: Vec::new(),
                busy: 0,
                marking_active: false,
                throttled: false,
                shutdown: false,
            }),
            work_available: Condvar::new(),
            quiescent: Condvar::new(),
        }
    }

    /// Push one grey cell.  Used by the write barrier while marking is
    /// active.
    pub fn push(&self, cell: ObjectReference) {
        let mut sync = self.sync.lock().unwrap();
        sync.entries.push(cell);
        self.work_available.notify_one();
        self.quiescent.notify_all();
    }

    /// Donate a batch of grey cells.
    pub fn donate(&self, cells: Vec<ObjectReference>) {
        if cells.is_empty() {
            return;
        }
        let mut sync = self.sync.lock().unwrap();
        sync.entries.extend(cells);
        self.work_available.notify_all();
        self.quiescent.notify_all();
    }

    /// Move up to `max` entries into `dest` without blocking.  On success the
    /// caller becomes a busy drainer and must call [`Self::finish_drainer`]
    /// once its local stack runs dry.
    pub fn try_take(&self, dest: &mut MarkStack, max: usize) -> bool {
        let mut sync = self.sync.lock().unwrap();
        if sync.entries.is_empty() {
            return false;
        }
        let split = sync.entries.len().saturating_sub(max);
        let batch = sync.entries.split_off(split);
        dest.extend(batch);
        sync.busy += 1;
        true
    }

    /// Blocking variant for marker threads.  Returns false when the stack is
    /// shutting down.
    pub fn take_blocking(&self, dest: &mut MarkStack) -> bool {
        let mut sync = self.sync.lock().unwrap();
        loop {
            if sync.shutdown {
                return false;
            }
            if sync.marking_active && !sync.throttled && !sync.entries.is_empty() {
                let split = sync.entries.len().saturating_sub(MARK_BATCH_SIZE);
                let batch = sync.entries.split_off(split);
                dest.extend(batch);
                sync.busy += 1;
                return true;
            }
            sync = self.work_available.wait(sync).unwrap();
        }
    }

    /// A drainer's local stack ran dry.
    pub fn finish_drainer(&self) {
        let mut sync = self.sync.lock().unwrap();
        debug_assert!(sync.busy > 0);
        sync.busy -= 1;
        if sync.busy == 0 && sync.entries.is_empty() {
            self.quiescent.notify_all();
        }
    }

    /// Wait for the stack to run dry, for new work to show up, or for the
    /// deadline, whichever comes first.
    pub fn wait_quiescent(&self, deadline: Option<Instant>) -> QuiesceState {
        let mut sync = self.sync.lock().unwrap();
        loop {
            if !sync.entries.is_empty() {
                return QuiesceState::WorkAvailable;
            }
            if sync.busy == 0 {
                return QuiesceState::Quiet;
            }
            match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return QuiesceState::Timeout;
                    }
                    let (guard, timeout) = self
                        .quiescent
                        .wait_timeout(sync, deadline - now)
                        .unwrap();
                    sync = guard;
                    if timeout.timed_out() {
                        // Re-check once; the state may have changed as we woke.
                        continue;
                    }
                }
                None => {
                    sync = self.quiescent.wait(sync).unwrap();
                }
            }
        }
    }

    pub fn set_marking_active(&self, active: bool) {
        let mut sync = self.sync.lock().unwrap();
        sync.marking_active = active;
        self.work_available.notify_all();
    }

    pub fn is_marking_active(&self) -> bool {
        self.sync.lock().unwrap().marking_active
    }

    pub fn is_throttled(&self) -> bool {
        self.sync.lock().unwrap().throttled
    }

    pub fn set_throttled(&self, throttled: bool) {
        let mut sync = self.sync.lock().unwrap();
        sync.throttled = throttled;
        if !throttled {
            self.work_available.notify_all();
        }
    }

    pub fn request_shutdown(&self) {
        let mut sync = self.sync.lock().unwrap();
        sync.shutdown = true;
        self.work_available.notify_all();
        self.quiescent.notify_all();
    }

    pub fn assert_empty(&self) {
        let sync = self.sync.lock().unwrap();
        assert!(
            sync.entries.is_empty() && sync.busy == 0,
            "mark stack not empty when expected empty: {} entries, {} busy drainers",
            sync.entries.len(),
            sync.busy
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cell(raw: usize) -> ObjectReference {
        ObjectReference::from_raw(raw).unwrap()
    }

    #[test]
    fn donation_keeps_top_half_local() {
        let mut local = MarkStack::new();
        for i in 1..=10 {
            local.push(cell(i * 16));
        }
        let donated = local.take_lower_half();
        assert_eq!(donated.len(), 5);
        assert_eq!(local.len(), 5);
        // The most recently pushed entries stay local.
        assert_eq!(local.pop(), Some(cell(160)));
    }

    #[test]
    fn try_take_tracks_busy_drainers() {
        let shared = SharedMarkStack::new();
        shared.donate(vec![cell(16), cell(32)]);
        let mut dest = MarkStack::new();
        assert!(shared.try_take(&mut dest, 16));
        assert_eq!(dest.len(), 2);
        // Still busy: not quiescent.
        assert_eq!(
            shared.wait_quiescent(Some(Instant::now())),
            QuiesceState::Timeout
        );
        shared.finish_drainer();
        assert_eq!(shared.wait_quiescent(None), QuiesceState::Quiet);
    }

    #[test]
    fn blocked_markers_wake_on_work() {
        let shared = SharedMarkStack::new();
        shared.set_marking_active(true);
        std::thread::scope(|scope| {
            let handle = scope.spawn(|| {
                let mut dest = MarkStack::new();
                assert!(shared.take_blocking(&mut dest));
                assert_eq!(dest.len(), 1);
                shared.finish_drainer();
            });
            shared.push(cell(64));
            handle.join().unwrap();
        });
        assert_eq!(shared.wait_quiescent(None), QuiesceState::Quiet);
    }

    #[test]
    fn shutdown_releases_blocked_markers() {
        let shared = SharedMarkStack::new();
        std::thread::scope(|scope| {
            let handle = scope.spawn(|| {
                let mut dest = MarkStack::new();
                assert!(!shared.take_blocking(&mut dest));
            });
            shared.request_shutdown();
            handle.join().unwrap();
        });
    }
}
