//! The world state: one atomic word of handshake bits shared between the
//! mutator and the collector, plus the condition variable both sides sleep
//! on.  The protocol itself (stop/resume, access acquisition, safepoints)
//! lives in `heap::global`; this module owns the mechanism.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Condvar, Mutex};

/// The mutator currently holds heap access.
pub(crate) const HAS_ACCESS_BIT: u32 = 1 << 0;
/// The mutator is parked.  Only ever set while `HAS_ACCESS_BIT` is clear.
pub(crate) const STOPPED_BIT: u32 = 1 << 1;
/// The collector wants the mutator parked at its next safepoint.
pub(crate) const STOP_REQUESTED_BIT: u32 = 1 << 2;
/// The mutator holds the conn and drives phase transitions itself.
pub(crate) const MUTATOR_HAS_CONN_BIT: u32 = 1 << 3;
/// End-of-cycle callbacks are pending and should run on a mutator thread.
pub(crate) const NEED_FINALIZE_BIT: u32 = 1 << 4;
/// A mutator is blocked waiting for a collection ticket.
pub(crate) const MUTATOR_WAITING_BIT: u32 = 1 << 5;

const_assert!(
    HAS_ACCESS_BIT
        ^ STOPPED_BIT
        ^ STOP_REQUESTED_BIT
        ^ MUTATOR_HAS_CONN_BIT
        ^ NEED_FINALIZE_BIT
        ^ MUTATOR_WAITING_BIT
        == 0x3f
);

pub(crate) struct WorldState {
    bits: AtomicU32,
    sync: Mutex<()>,
    cond: Condvar,
}

impl WorldState {
    pub fn new() -> Self {
        WorldState {
            bits: AtomicU32::new(0),
            sync: Mutex::new(()),
            cond: Condvar::new(),
        }
    }

    pub fn load(&self) -> u32 {
        self.bits.load(Ordering::SeqCst)
    }

    /// Relaxed load for the safepoint fast path: a single unordered load and
    /// compare, no lock.
    pub fn load_relaxed(&self) -> u32 {
        self.bits.load(Ordering::Relaxed)
    }

    pub fn has(&self, mask: u32) -> bool {
        self.load() & mask != 0
    }

    /// Set bits and wake every waiter.  Returns the previous bits.
    pub fn set(&self, mask: u32) -> u32 {
        let old = self.bits.fetch_or(mask, Ordering::SeqCst);
        self.assert_coherent(old | mask);
        self.notify_all();
        old
    }

    /// Clear bits and wake every waiter.  Returns the previous bits.
    pub fn clear(&self, mask: u32) -> u32 {
        let old = self.bits.fetch_and(!mask, Ordering::SeqCst);
        self.notify_all();
        old
    }

    /// One CAS attempt, for lock-free fast paths.  Does not notify.
    pub fn cas(&self, old: u32, new: u32) -> bool {
        self.assert_coherent(new);
        self.bits
            .compare_exchange(old, new, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// CAS that also wakes waiters on success.
    pub fn cas_and_notify(&self, old: u32, new: u32) -> bool {
        if self.cas(old, new) {
            self.notify_all();
            true
        } else {
            false
        }
    }

    pub fn notify_all(&self) {
        let _guard = self.sync.lock().unwrap();
        self.cond.notify_all();
    }

    /// Sleep until `pred` holds for the current bits.
    pub fn wait_until<F>(&self, pred: F)
    where
        F: Fn(u32) -> bool,
    {
        let mut guard = self.sync.lock().unwrap();
        while !pred(self.load()) {
            guard = self.cond.wait(guard).unwrap();
        }
    }

    /// The mutator cannot be stopped while also believed to hold heap
    /// access.
    fn assert_coherent(&self, bits: u32) {
        debug_assert!(
            bits & (STOPPED_BIT | HAS_ACCESS_BIT) != (STOPPED_BIT | HAS_ACCESS_BIT),
            "world state claims a stopped mutator that still holds heap access: {:#x}",
            bits
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_clear_round_trip() {
        let w = WorldState::new();
        assert_eq!(w.set(HAS_ACCESS_BIT), 0);
        assert!(w.has(HAS_ACCESS_BIT));
        assert_eq!(w.clear(HAS_ACCESS_BIT), HAS_ACCESS_BIT);
        assert!(!w.has(HAS_ACCESS_BIT));
    }

    #[test]
    fn cas_is_exclusive() {
        let w = WorldState::new();
        assert!(w.cas(0, HAS_ACCESS_BIT));
        assert!(!w.cas(0, HAS_ACCESS_BIT));
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "stopped mutator")]
    fn stopped_with_access_is_incoherent() {
        let w = WorldState::new();
        w.set(HAS_ACCESS_BIT);
        w.cas(HAS_ACCESS_BIT, HAS_ACCESS_BIT | STOPPED_BIT);
    }

    #[test]
    fn waiters_see_updates() {
        let w = WorldState::new();
        std::thread::scope(|scope| {
            scope.spawn(|| {
                w.wait_until(|bits| bits & STOP_REQUESTED_BIT != 0);
            });
            w.set(STOP_REQUESTED_BIT);
        });
    }
}
