//! Cycle-level counters published by the heap: versions, per-phase wall
//! clock, barrier executions.

use enum_map::EnumMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use super::phase::CollectorPhase;

pub(crate) struct HeapStatistics {
    /// Micros spent in each phase, cumulative.
    phase_times_us: EnumMap<CollectorPhase, AtomicU64>,
    /// Completed-cycle counter; the "new heap version" published at End.
    gc_version: AtomicU64,
    /// Bumped on every phase transition.
    phase_version: AtomicU64,
    /// Bumped every time the mutator resumes.
    mutator_execution_version: AtomicU64,
    barriers_executed: AtomicUsize,
    completed_full_collections: AtomicU64,
    completed_eden_collections: AtomicU64,
}

impl HeapStatistics {
    pub fn new() -> Self {
        HeapStatistics {
            phase_times_us: EnumMap::default(),
            gc_version: AtomicU64::new(0),
            phase_version: AtomicU64::new(0),
            mutator_execution_version: AtomicU64::new(0),
            barriers_executed: AtomicUsize::new(0),
            completed_full_collections: AtomicU64::new(0),
            completed_eden_collections: AtomicU64::new(0),
        }
    }

    pub fn record_phase(&self, phase: CollectorPhase, elapsed: Duration) {
        self.phase_times_us[phase].fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn phase_time(&self, phase: CollectorPhase) -> Duration {
        Duration::from_micros(self.phase_times_us[phase].load(Ordering::Relaxed))
    }

    pub fn bump_gc_version(&self) -> u64 {
        self.gc_version.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn gc_version(&self) -> u64 {
        self.gc_version.load(Ordering::SeqCst)
    }

    pub fn bump_phase_version(&self) {
        self.phase_version.fetch_add(1, Ordering::Relaxed);
    }

    pub fn phase_version(&self) -> u64 {
        self.phase_version.load(Ordering::Relaxed)
    }

    pub fn bump_mutator_execution_version(&self) {
        self.mutator_execution_version.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mutator_execution_version(&self) -> u64 {
        self.mutator_execution_version.load(Ordering::Relaxed)
    }

    pub fn count_barrier(&self) {
        self.barriers_executed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn barriers_executed(&self) -> usize {
        self.barriers_executed.load(Ordering::Relaxed)
    }

    pub fn count_completed(&self, full: bool) {
        if full {
            self.completed_full_collections.fetch_add(1, Ordering::Relaxed);
        } else {
            self.completed_eden_collections.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn completed_full_collections(&self) -> u64 {
        self.completed_full_collections.load(Ordering::Relaxed)
    }

    pub fn completed_eden_collections(&self) -> u64 {
        self.completed_eden_collections.load(Ordering::Relaxed)
    }
}
