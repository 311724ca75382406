//! Heap sizing and pacing: when to trigger a cycle, how large the heap may
//! grow relative to its live set and to available RAM, and the credit/debit
//! counter that meters the mutator's share of concurrent marking work.

use atomic::Atomic;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use super::phase::CollectionScope;
use crate::util::constants::GC_RATE_LIMITING_HALF_LIFE_MS;
use crate::util::options::{GrowthMode, Options};

/// A CAS-loop f64 cell.  The pacing counters are doubles because fractions
/// of a byte of marking debt are meaningful across many small allocations.
struct AtomicF64(Atomic<f64>);

impl AtomicF64 {
    fn new(value: f64) -> Self {
        AtomicF64(Atomic::new(value))
    }

    fn load(&self) -> f64 {
        self.0.load(Ordering::Relaxed)
    }

    fn store(&self, value: f64) {
        self.0.store(value, Ordering::Relaxed)
    }

    fn add(&self, delta: f64) -> f64 {
        let mut current = self.0.load(Ordering::Relaxed);
        loop {
            let next = current + delta;
            match self
                .0
                .compare_exchange_weak(current, next, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => return next,
                Err(actual) => current = actual,
            }
        }
    }
}

struct PacingTimes {
    last_gc_start: Instant,
    last_gc_end: Instant,
    last_full_gc_end: Option<Instant>,
    last_full_gc_length: Duration,
    last_eden_gc_length: Duration,
    total_gc_time: Duration,
}

pub(crate) struct Pacing {
    ram_size: usize,

    bytes_allocated_this_cycle: AtomicUsize,
    bytes_allocated_since_full: AtomicUsize,
    bytes_abandoned_since_full: AtomicUsize,
    extra_memory: AtomicUsize,
    stress_bytes: AtomicUsize,

    max_eden_size: AtomicUsize,
    max_heap_size: AtomicUsize,

    size_before_last_full_collect: AtomicUsize,
    size_after_last_full_collect: AtomicUsize,
    size_before_last_eden_collect: AtomicUsize,
    size_after_last_eden_collect: AtomicUsize,
    size_after_last_collect: AtomicUsize,

    total_bytes_visited: AtomicUsize,

    /// Marking debt banked by the mutator's allocations during a concurrent
    /// cycle; `perform_increment` pays it down.
    increment_balance: AtomicF64,
    /// Smooths out bursty allocation so one burst does not trigger
    /// back-to-back collections.  Decays towards zero while the mutator runs.
    gc_rate_limiting_value: AtomicF64,

    times: Mutex<PacingTimes>,
}

impl Pacing {
    pub fn new(options: &Options, ram_size: usize) -> Self {
        let now = Instant::now();
        Pacing {
            ram_size,
            bytes_allocated_this_cycle: AtomicUsize::new(0),
            bytes_allocated_since_full: AtomicUsize::new(0),
            bytes_abandoned_since_full: AtomicUsize::new(0),
            extra_memory: AtomicUsize::new(0),
            stress_bytes: AtomicUsize::new(0),
            max_eden_size: AtomicUsize::new(options.min_bytes_per_cycle),
            max_heap_size: AtomicUsize::new(options.min_bytes_per_cycle),
            size_before_last_full_collect: AtomicUsize::new(0),
            size_after_last_full_collect: AtomicUsize::new(0),
            size_before_last_eden_collect: AtomicUsize::new(0),
            size_after_last_eden_collect: AtomicUsize::new(0),
            size_after_last_collect: AtomicUsize::new(0),
            total_bytes_visited: AtomicUsize::new(0),
            increment_balance: AtomicF64::new(0.0),
            gc_rate_limiting_value: AtomicF64::new(0.0),
            times: Mutex::new(PacingTimes {
                last_gc_start: now,
                last_gc_end: now,
                last_full_gc_end: None,
                last_full_gc_length: Duration::from_millis(10),
                last_eden_gc_length: Duration::from_millis(10),
                total_gc_time: Duration::ZERO,
            }),
        }
    }

    pub fn did_allocate(&self, bytes: usize) -> usize {
        self.bytes_allocated_since_full.fetch_add(bytes, Ordering::Relaxed);
        self.bytes_allocated_this_cycle.fetch_add(bytes, Ordering::Relaxed) + bytes
    }

    pub fn bytes_allocated_this_cycle(&self) -> usize {
        self.bytes_allocated_this_cycle.load(Ordering::Relaxed)
    }

    /// Account a dropped reference to a whole object graph.  Abandoned bytes
    /// push the next full collection closer without showing up as live.
    pub fn did_abandon(&self, bytes: usize) {
        self.bytes_abandoned_since_full.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn report_extra_memory_allocated(&self, bytes: usize) {
        self.extra_memory.fetch_add(bytes, Ordering::Relaxed);
        self.did_allocate(bytes);
    }

    pub fn report_extra_memory_visited(&self, bytes: usize) {
        self.total_bytes_visited.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn extra_memory_size(&self) -> usize {
        self.extra_memory.load(Ordering::Relaxed)
    }

    /// Stress collections: returns true every `stress_factor` allocated
    /// bytes.
    pub fn crossed_stress_boundary(&self, bytes: usize, stress_factor: usize) -> bool {
        if stress_factor == 0 {
            return false;
        }
        let old = self.stress_bytes.fetch_add(bytes, Ordering::Relaxed);
        old / stress_factor != (old + bytes) / stress_factor
    }

    pub fn max_eden_size(&self) -> usize {
        self.max_eden_size.load(Ordering::Relaxed)
    }

    pub fn max_heap_size(&self) -> usize {
        self.max_heap_size.load(Ordering::Relaxed)
    }

    /// The GC rate limiting value projected to `now`, decaying with a fixed
    /// half-life since the last collection ended.
    pub fn projected_gc_rate_limiting_value(&self, now: Instant) -> f64 {
        let elapsed_ms = {
            let times = self.times.lock().unwrap();
            now.saturating_duration_since(times.last_gc_end).as_secs_f64() * 1000.0
        };
        let value = self.gc_rate_limiting_value.load();
        value * 0.5f64.powf(elapsed_ms / GC_RATE_LIMITING_HALF_LIFE_MS)
    }

    /// Has the mutator allocated enough to warrant a collection?
    pub fn should_collect_heuristic(&self, now: Instant) -> bool {
        let rate = self.projected_gc_rate_limiting_value(now).min(1.0);
        let limit = (self.max_eden_size() as f64 * (1.0 + rate)) as usize;
        self.bytes_allocated_this_cycle() > limit
    }

    /// Is the heap so far past its limit that the mutator should stall
    /// rather than keep allocating ahead of the running collector?
    pub fn is_over_headroom(&self, headroom: f64) -> bool {
        let limit = (self.max_eden_size() as f64 * headroom) as usize;
        self.bytes_allocated_this_cycle() > limit
    }

    /// Should the cycle about to start collect the full heap?
    pub fn should_do_full_collection(&self, current_size: usize, use_generational: bool) -> bool {
        if !use_generational {
            return true;
        }
        let times = self.times.lock().unwrap();
        if times.last_full_gc_end.is_none() {
            // Nothing has been promoted yet; scan everything once so the old
            // generation starts from a real live set.
            return true;
        }
        drop(times);
        let pressure = current_size
            + self.extra_memory_size()
            + self.bytes_abandoned_since_full.load(Ordering::Relaxed);
        pressure > self.max_heap_size()
    }

    pub fn was_full_collection_done_recently(&self, window_ms: f64, now: Instant) -> bool {
        let times = self.times.lock().unwrap();
        match times.last_full_gc_end {
            Some(end) => now.saturating_duration_since(end).as_secs_f64() * 1000.0 < window_ms,
            None => false,
        }
    }

    pub fn begin_cycle(&self, scope: CollectionScope, size_before: usize, now: Instant) {
        match scope {
            CollectionScope::Full => {
                self.size_before_last_full_collect.store(size_before, Ordering::Relaxed)
            }
            CollectionScope::Eden => {
                self.size_before_last_eden_collect.store(size_before, Ordering::Relaxed)
            }
        }
        self.times.lock().unwrap().last_gc_start = now;
    }

    /// Update the allocation limits at the end of a cycle.  The heap grows
    /// proportionally to its live set, capped by a fraction of RAM and
    /// tightened under memory pressure.
    pub fn end_cycle(
        &self,
        scope: CollectionScope,
        size_after: usize,
        bytes_visited: usize,
        options: &Options,
        now: Instant,
    ) {
        self.total_bytes_visited.fetch_add(bytes_visited, Ordering::Relaxed);
        self.size_after_last_collect.store(size_after, Ordering::Relaxed);

        let live = size_after + self.extra_memory_size();
        let growth = match options.growth_mode {
            GrowthMode::Default => options.heap_growth_factor,
            GrowthMode::Aggressive => options.heap_growth_factor * 1.3,
        };

        match scope {
            CollectionScope::Full => {
                self.size_after_last_full_collect.store(size_after, Ordering::Relaxed);
                self.bytes_allocated_since_full.store(0, Ordering::Relaxed);
                self.bytes_abandoned_since_full.store(0, Ordering::Relaxed);

                let proportional = (live as f64 * growth) as usize;
                let ram_cap = if live < (self.ram_size as f64 * options.small_heap_ram_fraction) as usize
                {
                    (self.ram_size as f64 * options.small_heap_ram_fraction) as usize
                } else {
                    (self.ram_size as f64 * options.large_heap_ram_fraction) as usize
                };
                let max_heap = proportional.clamp(options.min_bytes_per_cycle, ram_cap.max(options.min_bytes_per_cycle));
                self.max_heap_size.store(max_heap, Ordering::Relaxed);

                let mut max_eden = max_heap
                    .saturating_sub(live)
                    .max(options.min_bytes_per_cycle);
                if live > (self.ram_size as f64 * options.critical_ram_fraction) as usize {
                    // Over the critical threshold: collect much more eagerly.
                    max_eden = (max_eden / 4).max(options.min_bytes_per_cycle / 4);
                }
                self.max_eden_size.store(max_eden, Ordering::Relaxed);
            }
            CollectionScope::Eden => {
                self.size_after_last_eden_collect.store(size_after, Ordering::Relaxed);
                let max_eden = self
                    .max_heap_size()
                    .saturating_sub(live)
                    .max(options.min_bytes_per_cycle / 4);
                self.max_eden_size.store(max_eden, Ordering::Relaxed);
            }
        }
        self.bytes_allocated_this_cycle.store(0, Ordering::Relaxed);

        let mut times = self.times.lock().unwrap();
        let pause = now.saturating_duration_since(times.last_gc_start);
        let mutator_time = times.last_gc_start.saturating_duration_since(times.last_gc_end);
        times.total_gc_time += pause;
        times.last_gc_end = now;
        match scope {
            CollectionScope::Full => {
                times.last_full_gc_length = pause;
                times.last_full_gc_end = Some(now);
            }
            CollectionScope::Eden => times.last_eden_gc_length = pause,
        }
        drop(times);

        // Bump the rate limiter by this cycle's pause ratio so a burst of
        // triggers right after an expensive collection is absorbed.
        let ratio = pause.as_secs_f64() / (pause + mutator_time).as_secs_f64().max(1e-9);
        let projected = self.projected_gc_rate_limiting_value(now);
        self.gc_rate_limiting_value.store(projected + ratio);

        debug!(
            "end_cycle({:?}): live = {}, max_heap = {}, max_eden = {}",
            scope,
            live,
            self.max_heap_size(),
            self.max_eden_size()
        );
    }

    pub fn add_increment_balance(&self, bytes: f64) -> f64 {
        self.increment_balance.add(bytes)
    }

    pub fn increment_balance(&self) -> f64 {
        self.increment_balance.load()
    }

    pub fn reset_increment_balance(&self) {
        self.increment_balance.store(0.0);
    }

    pub fn size_before_last_full_collect(&self) -> usize {
        self.size_before_last_full_collect.load(Ordering::Relaxed)
    }

    pub fn size_after_last_full_collect(&self) -> usize {
        self.size_after_last_full_collect.load(Ordering::Relaxed)
    }

    pub fn size_before_last_eden_collect(&self) -> usize {
        self.size_before_last_eden_collect.load(Ordering::Relaxed)
    }

    pub fn size_after_last_eden_collect(&self) -> usize {
        self.size_after_last_eden_collect.load(Ordering::Relaxed)
    }

    pub fn last_full_gc_length(&self) -> Duration {
        self.times.lock().unwrap().last_full_gc_length
    }

    pub fn last_eden_gc_length(&self) -> Duration {
        self.times.lock().unwrap().last_eden_gc_length
    }

    pub fn total_gc_time(&self) -> Duration {
        self.times.lock().unwrap().total_gc_time
    }
}
