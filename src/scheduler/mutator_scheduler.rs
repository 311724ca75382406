//! The space-time mutator scheduler.  During the Concurrent phase the
//! collector works in fixed periods, taking its own share of each period and
//! then handing the CPU back so the mutator hits its configured utilization
//! target.

use std::sync::Mutex;
use std::time::Duration;

use crate::util::options::Options;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SchedulerState {
    Idle,
    CollectorRunning,
    MutatorRunning,
}

pub(crate) struct SpaceTimeScheduler {
    period: Duration,
    mutator_utilization: f64,
    pause_budget: Duration,
    state: Mutex<SchedulerState>,
}

impl SpaceTimeScheduler {
    pub fn new(options: &Options) -> Self {
        SpaceTimeScheduler {
            period: Duration::from_secs_f64(options.concurrent_gc_period_ms / 1000.0),
            mutator_utilization: options.max_mutator_utilization,
            pause_budget: Duration::from_secs_f64(options.min_gc_pause_ms / 1000.0),
            state: Mutex::new(SchedulerState::Idle),
        }
    }

    /// How long the collector may drain before yielding the period.
    pub fn collector_quantum(&self) -> Duration {
        self.period.mul_f64(1.0 - self.mutator_utilization)
    }

    /// The mutator's share of each period.
    pub fn mutator_quantum(&self) -> Duration {
        self.period.mul_f64(self.mutator_utilization)
    }

    /// The stop-the-world increment budget before marking is handed off to
    /// the concurrent phase.
    pub fn pause_budget(&self) -> Duration {
        self.pause_budget
    }

    pub fn begin_collection(&self) {
        *self.state.lock().unwrap() = SchedulerState::CollectorRunning;
    }

    pub fn did_yield_to_mutator(&self) {
        let mut state = self.state.lock().unwrap();
        trace!("scheduler: collector yields for {:?}", self.mutator_quantum());
        *state = SchedulerState::MutatorRunning;
    }

    pub fn did_reclaim_timeslice(&self) {
        *self.state.lock().unwrap() = SchedulerState::CollectorRunning;
    }

    pub fn end_collection(&self) {
        *self.state.lock().unwrap() = SchedulerState::Idle;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quanta_split_the_period() {
        let options = Options::default();
        let scheduler = SpaceTimeScheduler::new(&options);
        let total = scheduler.collector_quantum() + scheduler.mutator_quantum();
        let period = Duration::from_secs_f64(options.concurrent_gc_period_ms / 1000.0);
        let diff = if total > period { total - period } else { period - total };
        assert!(diff < Duration::from_micros(10), "diff = {:?}", diff);
    }

    #[test]
    fn mutator_gets_the_larger_share_by_default() {
        let options = Options::default();
        let scheduler = SpaceTimeScheduler::new(&options);
        assert!(scheduler.mutator_quantum() > scheduler.collector_quantum());
    }
}
