//! Collection requests and their tickets.  A request carries a requested
//! strength (Eden, Full, or "collector's choice") and is fulfilled
//! asynchronously; tickets are monotonically increasing integers letting a
//! caller wait for "my request or a stronger one has completed" without over-
//! or under-counting completions.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

use super::phase::CollectionScope;

/// A request to run a collection.  `scope == None` lets the collector choose.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub struct GcRequest {
    pub scope: Option<CollectionScope>,
}

impl GcRequest {
    pub fn eden() -> Self {
        GcRequest {
            scope: Some(CollectionScope::Eden),
        }
    }

    pub fn full() -> Self {
        GcRequest {
            scope: Some(CollectionScope::Full),
        }
    }

    /// Merge rank.  Full collections always beat Eden; where an unscoped
    /// request ranks is a configured policy choice (see
    /// `Options::unscoped_requests_are_weakest`).
    fn strength(self, unscoped_weakest: bool) -> u8 {
        match self.scope {
            Some(CollectionScope::Full) => 3,
            Some(CollectionScope::Eden) => {
                if unscoped_weakest {
                    2
                } else {
                    1
                }
            }
            None => {
                if unscoped_weakest {
                    1
                } else {
                    2
                }
            }
        }
    }

    /// Would a cycle that satisfies `other` also satisfy `self`?  Used to
    /// avoid queueing a request when an equal-or-stronger one is already
    /// pending or in flight.
    pub fn subsumed_by(self, other: GcRequest, unscoped_weakest: bool) -> bool {
        self.strength(unscoped_weakest) <= other.strength(unscoped_weakest)
    }

    /// Is this request satisfied by a completed cycle of scope `scope`?
    pub fn satisfied_by(self, scope: CollectionScope) -> bool {
        match self.scope {
            Some(CollectionScope::Full) => scope == CollectionScope::Full,
            _ => true,
        }
    }
}

pub(crate) type Ticket = u64;

struct RequestsSync {
    /// The backlog.  Front is served next.
    requests: VecDeque<(GcRequest, Ticket)>,
    /// The request the in-flight cycle (if any) was started for.
    current: Option<(GcRequest, Ticket)>,
    last_granted: Ticket,
    last_served: Ticket,
}

/// This data structure lets mutators queue collections and wait for their
/// completion.
pub(crate) struct RequestQueue {
    sync: Mutex<RequestsSync>,
    served: Condvar,
    unscoped_weakest: bool,
}

impl RequestQueue {
    pub fn new(unscoped_weakest: bool) -> Self {
        RequestQueue {
            sync: Mutex::new(RequestsSync {
                requests: VecDeque::new(),
                current: None,
                last_granted: 0,
                last_served: 0,
            }),
            served: Condvar::new(),
            unscoped_weakest,
        }
    }

    /// Queue a request.  Returns the ticket to wait on.  If a pending or
    /// in-flight request of equal or greater strength exists, its ticket is
    /// returned and no new entry is queued.
    pub fn request(&self, request: GcRequest) -> Ticket {
        let mut sync = self.sync.lock().unwrap();
        if let Some((current, ticket)) = sync.current {
            if request.subsumed_by(current, self.unscoped_weakest) {
                return ticket;
            }
        }
        if let Some(&(last, ticket)) = sync.requests.back() {
            if request.subsumed_by(last, self.unscoped_weakest) {
                return ticket;
            }
        }
        sync.last_granted += 1;
        let ticket = sync.last_granted;
        sync.requests.push_back((request, ticket));
        trace!("granted ticket {} for {:?}", ticket, request);
        ticket
    }

    pub fn has_pending(&self) -> bool {
        let sync = self.sync.lock().unwrap();
        !sync.requests.is_empty()
    }

    pub fn is_served(&self, ticket: Ticket) -> bool {
        let sync = self.sync.lock().unwrap();
        sync.last_served >= ticket
    }

    /// Wait up to `timeout` for `ticket` to be served.  Returns whether it
    /// was.  Callers loop around this so they can interleave other work (e.g.
    /// driving the collector when they hold the conn).
    pub fn wait_served_timeout(&self, ticket: Ticket, timeout: std::time::Duration) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        let mut sync = self.sync.lock().unwrap();
        while sync.last_served < ticket {
            let now = std::time::Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = self.served.wait_timeout(sync, deadline - now).unwrap();
            sync = guard;
        }
        true
    }

    /// The collector begins a cycle: pop the front request and decide the
    /// cycle's scope from the strongest outstanding request.  Returns `None`
    /// when there is nothing to do.
    pub fn begin_cycle(&self) -> Option<(GcRequest, Ticket, Option<CollectionScope>)> {
        let mut sync = self.sync.lock().unwrap();
        let (front, ticket) = sync.requests.pop_front()?;
        // The cycle we are about to run serves the whole backlog if it is
        // strong enough, so scope by the strongest outstanding request, never
        // downgrading an already-promised collection.
        let mut strongest = front;
        for &(r, _) in sync.requests.iter() {
            if strongest.subsumed_by(r, self.unscoped_weakest) {
                strongest = r;
            }
        }
        sync.current = Some((front, ticket));
        Some((front, ticket, strongest.scope))
    }

    /// The cycle of scope `scope` is done collecting: retire the current
    /// request plus every queued request the cycle satisfies.  Returns the
    /// highest ticket the cycle serves; requests arriving after this point
    /// queue a fresh cycle instead of being subsumed by a finished one.
    pub fn retire_cycle(&self, scope: CollectionScope) -> Ticket {
        let mut sync = self.sync.lock().unwrap();
        let mut served = sync.last_served;
        if let Some((_, ticket)) = sync.current.take() {
            served = served.max(ticket);
        }
        while let Some(&(front, ticket)) = sync.requests.front() {
            if front.satisfied_by(scope) {
                served = served.max(ticket);
                sync.requests.pop_front();
            } else {
                break;
            }
        }
        served
    }

    /// Wake the waiters.  Split from [`Self::retire_cycle`] so the collector
    /// can publish the new phase before anyone observes completion.
    pub fn publish_served(&self, ticket: Ticket) {
        let mut sync = self.sync.lock().unwrap();
        sync.last_served = sync.last_served.max(ticket);
        self.served.notify_all();
    }

    /// Retire and publish in one step.
    pub fn complete_cycle(&self, scope: CollectionScope) {
        let served = self.retire_cycle(scope);
        self.publish_served(served);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_wins_over_eden() {
        let queue = RequestQueue::new(true);
        let t_eden = queue.request(GcRequest::eden());
        let t_full = queue.request(GcRequest::full());
        assert!(t_full > t_eden);
        let (_, _, scope) = queue.begin_cycle().unwrap();
        assert_eq!(scope, Some(CollectionScope::Full));
    }

    #[test]
    fn equal_strength_requests_coalesce() {
        let queue = RequestQueue::new(true);
        let t1 = queue.request(GcRequest::full());
        let t2 = queue.request(GcRequest::full());
        assert_eq!(t1, t2);
    }

    #[test]
    fn unscoped_is_weakest_by_default() {
        let queue = RequestQueue::new(true);
        let t_eden = queue.request(GcRequest::eden());
        // An unscoped request is subsumed by the pending Eden request.
        let t_any = queue.request(GcRequest::default());
        assert_eq!(t_eden, t_any);
    }

    #[test]
    fn unscoped_can_outrank_eden_when_configured() {
        let queue = RequestQueue::new(false);
        let t_eden = queue.request(GcRequest::eden());
        let t_any = queue.request(GcRequest::default());
        assert!(t_any > t_eden);
        // The cycle's scope is the collector's choice.
        let (_, _, scope) = queue.begin_cycle().unwrap();
        assert_eq!(scope, None);
    }

    #[test]
    fn full_cycle_serves_the_backlog() {
        let queue = RequestQueue::new(true);
        let t_eden = queue.request(GcRequest::eden());
        let t_full = queue.request(GcRequest::full());
        let (_, _, scope) = queue.begin_cycle().unwrap();
        assert_eq!(scope, Some(CollectionScope::Full));
        queue.complete_cycle(CollectionScope::Full);
        assert!(queue.is_served(t_eden));
        assert!(queue.is_served(t_full));
        assert!(!queue.has_pending());
    }

    #[test]
    fn eden_cycle_leaves_full_request_queued() {
        let queue = RequestQueue::new(true);
        // An in-flight Eden cycle...
        queue.request(GcRequest::eden());
        let (_, _, _) = queue.begin_cycle().unwrap();
        // ...does not satisfy a Full request issued meanwhile.
        let t_full = queue.request(GcRequest::full());
        queue.complete_cycle(CollectionScope::Eden);
        assert!(!queue.is_served(t_full));
        assert!(queue.has_pending());
    }

    #[test]
    fn request_during_flight_is_satisfied_by_inflight_cycle() {
        let queue = RequestQueue::new(true);
        queue.request(GcRequest::full());
        queue.begin_cycle().unwrap();
        // Requested while one is in flight: no second cycle is queued.
        let t = queue.request(GcRequest::eden());
        queue.complete_cycle(CollectionScope::Full);
        assert!(queue.is_served(t));
        assert!(!queue.has_pending());
    }

    #[test]
    fn tickets_are_monotonic() {
        let queue = RequestQueue::new(true);
        let t1 = queue.request(GcRequest::full());
        queue.begin_cycle().unwrap();
        queue.complete_cycle(CollectionScope::Full);
        let t2 = queue.request(GcRequest::full());
        assert!(t2 > t1);
        assert!(queue.is_served(t1));
        assert!(!queue.is_served(t2));
    }
}
