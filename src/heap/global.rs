//! The `Heap` orchestrator.  It owns the phase state machine, the
//! mutator/collector handshake, pacing and limits, weak processing, and
//! finalization.  Both the dedicated collector thread (async mode) and a
//! conn-holding mutator (sync mode) drive cycles through the same phase
//! transition functions in this file.

use atomic::Atomic;
use crossbeam::channel::{unbounded, Sender};
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::{Duration, Instant};

use super::controller::{Controller, ControllerMessage};
use super::defer::DeferralState;
use super::pacing::Pacing;
use super::phase::{CollectionScope, CollectorPhase, GcConductor, Synchronousness};
use super::requests::{GcRequest, RequestQueue, Ticket};
use super::stats::HeapStatistics;
use super::world::{
    WorldState, HAS_ACCESS_BIT, MUTATOR_HAS_CONN_BIT, MUTATOR_WAITING_BIT, NEED_FINALIZE_BIT,
    STOPPED_BIT, STOP_REQUESTED_BIT,
};
use crate::binding::{Collection, GcThreadContext, RuntimeBinding};
use crate::marking::{
    MarkingConstraint, MarkingConstraintSet, ProtectedCellsConstraint, RememberedSetConstraint,
    RuntimeRootsConstraint, SharedMarkStack, SlotVisitor,
};
use crate::scheduler::{Marker, MarkerPool, MarkerStat, SpaceTimeScheduler};
use crate::space::{
    CellKind, HeapVersion, KindRegistry, MarkedSpace, SubspaceDescriptor, BLACK_THRESHOLD,
    TAUTOLOGICAL_THRESHOLD,
};
use crate::util::options::Options;
use crate::util::ObjectReference;
use crate::weak::{
    CodeStubSet, Finalizer, FinalizerTable, HandleSet, WeakGcTable, WeakHandle, WeakTableRegistry,
};

/// Invoked once per completed cycle, on a mutator thread, after the world
/// resumed.
pub type HeapFinalizerCallback<R> = Arc<dyn Fn(&Heap<R>) + Send + Sync>;

std::thread_local! {
    /// Whether the current thread is the one holding heap access.  The world
    /// state tracks that *some* thread has access; only the owning thread may
    /// release it or park at safepoints.
    static THREAD_HAS_ACCESS: std::cell::Cell<bool> = const { std::cell::Cell::new(false) };
}

/// Registered collaborators told when cycles start and finish.  The heap
/// references observers weakly; dropping the observer unregisters it.
pub trait HeapObserver: Send + Sync {
    fn will_collect(&self, _scope: CollectionScope) {}
    fn did_collect(&self, _scope: CollectionScope) {}
}

/// Everything the heap is configured with, resolved once at construction.
/// No ambient globals: the config is threaded through explicitly.
pub struct HeapConfig {
    pub options: Options,
    pub ram_size: usize,
}

impl HeapConfig {
    pub fn from_env() -> Self {
        HeapConfig {
            options: Options::default(),
            ram_size: Self::probe_ram_size(),
        }
    }

    pub fn with_options(options: Options) -> Self {
        HeapConfig {
            options,
            ram_size: Self::probe_ram_size(),
        }
    }

    fn probe_ram_size() -> usize {
        let mut system = sysinfo::System::new();
        system.refresh_memory();
        let total = system.total_memory() as usize;
        if total == 0 {
            // Some sandboxes report nothing; assume a small desktop.
            8 << 30
        } else {
            total
        }
    }
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

/// Private phase-machine state, touched only under its lock.
struct ControllerState {
    /// Scope requested for the cycle being started (`None` = collector's
    /// choice).
    requested_scope: Option<CollectionScope>,
    /// Scope of the in-flight cycle.
    scope: Option<CollectionScope>,
    last_scope: Option<CollectionScope>,
    /// Did the last Fixpoint pass converge (stacks drained, constraints
    /// produced nothing)?
    marking_converged: bool,
    world_is_stopped: bool,
    prevention_count: usize,
    marker_stat_at_begin: MarkerStat,
}

pub struct Heap<R: RuntimeBinding> {
    config: HeapConfig,
    object_space: MarkedSpace,
    kinds: KindRegistry,
    version: HeapVersion,

    world: WorldState,
    /// Whoever is driving phase transitions holds this for the whole driving
    /// session; two threads are never mid-transition simultaneously.
    conn_driver: Mutex<()>,
    controller_state: Mutex<ControllerState>,
    phase_changed: Condvar,
    current_phase: Atomic<CollectorPhase>,
    phase_timer: Mutex<Instant>,

    shared_stack: SharedMarkStack,
    remembered_set: Mutex<Vec<ObjectReference>>,
    constraints: Mutex<MarkingConstraintSet<R>>,
    cycle_bytes_visited: AtomicUsize,

    handle_set: HandleSet,
    weak_tables: WeakTableRegistry,
    finalizers: FinalizerTable,
    code_stubs: CodeStubSet,
    heap_callbacks: Mutex<Vec<HeapFinalizerCallback<R>>>,
    observers: Mutex<Vec<Weak<dyn HeapObserver>>>,

    requests: RequestQueue,
    pacing: Pacing,
    scheduler: SpaceTimeScheduler,
    markers: MarkerPool,
    stats: HeapStatistics,
    deferral: DeferralState,

    barrier_threshold: AtomicU8,
    mutator_should_be_fenced: AtomicBool,

    is_safe_to_collect: AtomicBool,
    is_shutting_down: AtomicBool,

    mailbox: Sender<ControllerMessage>,
    mailbox_receiver: Mutex<Option<crossbeam::channel::Receiver<ControllerMessage>>>,
}

impl<R: RuntimeBinding> Heap<R> {
    pub fn new(config: HeapConfig) -> Arc<Self> {
        config.options.assert_coherent();
        let _ = crate::util::logger::try_init();

        let (sender, receiver) = unbounded();
        let mut constraints = MarkingConstraintSet::new();
        constraints.add(Box::new(RuntimeRootsConstraint));
        constraints.add(Box::new(ProtectedCellsConstraint));
        constraints.add(Box::new(RememberedSetConstraint));

        let force_fenced = config.options.force_fenced_barrier;
        let pacing = Pacing::new(&config.options, config.ram_size);
        let scheduler = SpaceTimeScheduler::new(&config.options);
        let markers = MarkerPool::new(config.options.num_gc_markers);
        let unscoped_weakest = config.options.unscoped_requests_are_weakest;

        Arc::new(Heap {
            config,
            object_space: MarkedSpace::new(),
            kinds: KindRegistry::new(),
            version: HeapVersion::new(),
            world: WorldState::new(),
            conn_driver: Mutex::new(()),
            controller_state: Mutex::new(ControllerState {
                requested_scope: None,
                scope: None,
                last_scope: None,
                marking_converged: false,
                world_is_stopped: false,
                prevention_count: 0,
                marker_stat_at_begin: MarkerStat::default(),
            }),
            phase_changed: Condvar::new(),
            current_phase: Atomic::new(CollectorPhase::NotRunning),
            phase_timer: Mutex::new(Instant::now()),
            shared_stack: SharedMarkStack::new(),
            remembered_set: Mutex::new(Vec::new()),
            constraints: Mutex::new(constraints),
            cycle_bytes_visited: AtomicUsize::new(0),
            handle_set: HandleSet::new(),
            weak_tables: WeakTableRegistry::new(),
            finalizers: FinalizerTable::new(),
            code_stubs: CodeStubSet::new(),
            heap_callbacks: Mutex::new(Vec::new()),
            observers: Mutex::new(Vec::new()),
            requests: RequestQueue::new(unscoped_weakest),
            pacing,
            scheduler,
            markers,
            stats: HeapStatistics::new(),
            deferral: DeferralState::new(),
            barrier_threshold: AtomicU8::new(if force_fenced {
                TAUTOLOGICAL_THRESHOLD
            } else {
                BLACK_THRESHOLD
            }),
            mutator_should_be_fenced: AtomicBool::new(force_fenced),
            is_safe_to_collect: AtomicBool::new(false),
            is_shutting_down: AtomicBool::new(false),
            mailbox: sender,
            mailbox_receiver: Mutex::new(Some(receiver)),
        })
    }

    pub fn options(&self) -> &Options {
        &self.config.options
    }

    // ------------------------------------------------------------------
    // Bring-up and shutdown
    // ------------------------------------------------------------------

    /// Collection requests made before this call are deferred, not dropped;
    /// they run once safety is signaled.  Also spawns the GC threads through
    /// the binding.
    pub fn notify_is_safe_to_collect(self: &Arc<Self>) {
        if self.is_safe_to_collect.swap(true, Ordering::SeqCst) {
            return;
        }
        if self.config.options.use_collector_thread {
            let receiver = self
                .mailbox_receiver
                .lock()
                .unwrap()
                .take()
                .expect("collector thread spawned twice");
            R::Collection::spawn_gc_thread(GcThreadContext::Controller(Box::new(
                Controller::new(self.clone(), receiver),
            )));
        }
        for ordinal in 0..self.markers.marker_count() {
            R::Collection::spawn_gc_thread(GcThreadContext::Marker(Box::new(Marker::new(
                self.clone(),
                ordinal,
                self.markers.shared(ordinal),
            ))));
        }
        if self.requests.has_pending() {
            self.kick_collector();
        }
        info!(
            "heap is safe to collect ({} markers, collector thread: {})",
            self.markers.marker_count(),
            self.config.options.use_collector_thread
        );
    }

    pub fn is_safe_to_collect(&self) -> bool {
        self.is_safe_to_collect.load(Ordering::SeqCst)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.is_shutting_down.load(Ordering::SeqCst)
    }

    /// Last chance to finalize: wait out any in-flight cycle, stop the GC
    /// threads, and run every remaining finalizer as if its cell died.
    pub fn shutdown(&self) {
        if self.is_shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.prevent_collection();
        let _ = self.mailbox.send(ControllerMessage::Exit);
        self.shared_stack.request_shutdown();
        self.world.notify_all();
        for (cell, finalizers) in self.finalizers.take_all() {
            for finalizer in finalizers {
                finalizer.invoke(cell);
            }
        }
        self.code_stubs.delete_dead(&|_| false);
        self.allow_collection();
        debug!("heap shut down");
    }

    // ------------------------------------------------------------------
    // Cell kinds and allocation
    // ------------------------------------------------------------------

    pub fn register_cell_kind(&self, descriptor: SubspaceDescriptor) -> CellKind {
        self.kinds.register(descriptor)
    }

    /// Allocate a cell.  This is a safepoint, and it may trigger a
    /// collection unless one is deferred.
    pub fn allocate(&self, kind: CellKind, payload_bytes: usize) -> ObjectReference {
        debug_assert!(
            self.this_thread_has_access(),
            "allocation requires heap access"
        );
        self.stop_if_necessary();
        self.collect_if_necessary_or_defer();
        let object = self
            .object_space
            .allocate(kind, payload_bytes, self.mark_version());
        self.did_allocate(MarkedSpace::cell_size(object));
        object
    }

    /// Allocation accounting.  Also the hook that paces concurrent
    /// collection and stress collections.
    pub fn did_allocate(&self, bytes: usize) {
        self.pacing.did_allocate(bytes);
        if self
            .pacing
            .crossed_stress_boundary(bytes, self.config.options.stress_factor)
        {
            self.collect_async(GcRequest::full());
        }
        self.perform_increment(bytes);
    }

    /// Report non-GC memory referenced by GC objects.
    pub fn report_extra_memory_allocated(&self, bytes: usize) {
        self.pacing.report_extra_memory_allocated(bytes);
    }

    pub fn report_extra_memory_visited(&self, bytes: usize) {
        self.pacing.report_extra_memory_visited(bytes);
    }

    pub fn extra_memory_size(&self) -> usize {
        self.pacing.extra_memory_size()
    }

    /// An entire object graph just became unreachable (e.g. a context was
    /// torn down).  Nudges the pacing without waiting for tracing to notice.
    pub fn report_abandoned_object_graph(&self) {
        self.pacing.did_abandon(self.object_space.size() / 8);
    }

    pub fn object_count(&self) -> usize {
        self.object_space.object_count()
    }

    pub fn size(&self) -> usize {
        self.object_space.size()
    }

    pub fn capacity(&self) -> usize {
        self.object_space.capacity()
    }

    pub fn object_space(&self) -> &MarkedSpace {
        &self.object_space
    }

    // ------------------------------------------------------------------
    // Requesting collections
    // ------------------------------------------------------------------

    /// Queue up a collection.  Returns immediately.  No new cycle is queued
    /// if one of equal or greater strength is pending or in flight.
    pub fn collect_async(&self, request: GcRequest) {
        self.request_collection(request);
    }

    /// Queue up a collection and wait until a cycle at least as strong has
    /// completed, including any backlog ahead of it.
    pub fn collect_sync(&self, request: GcRequest) {
        let ticket = self.request_collection(request);
        self.wait_for_collection(ticket);
    }

    pub fn collect(&self, synchronousness: Synchronousness, request: GcRequest) {
        match synchronousness {
            Synchronousness::Sync => self.collect_sync(request),
            Synchronousness::Async => self.collect_async(request),
        }
    }

    /// Like [`Self::collect`], but the Async flavor polls the safepoint on
    /// the way out so a stop requested by the new cycle is taken promptly.
    pub fn collect_now(&self, synchronousness: Synchronousness, request: GcRequest) {
        self.collect(synchronousness, request);
        if synchronousness == Synchronousness::Async {
            self.stop_if_necessary();
        }
    }

    /// Bounded-frequency full collection: a no-op if a full collection
    /// completed within the configured recency window.
    pub fn collect_now_full_if_not_done_recently(&self, synchronousness: Synchronousness) {
        if self
            .pacing
            .was_full_collection_done_recently(self.config.options.full_gc_recency_ms, Instant::now())
        {
            debug!("skipping full collection; one completed recently");
            return;
        }
        self.collect_now(synchronousness, GcRequest::full());
    }

    /// Called from allocation slow paths: trigger a collection if the
    /// heuristic says so, unless a deferral scope is active.
    pub fn collect_if_necessary_or_defer(&self) {
        if self.deferral.is_deferred() {
            self.deferral.note_deferred_work();
            return;
        }
        if !self.is_safe_to_collect() {
            return;
        }
        if self.current_phase().is_running() {
            if self
                .pacing
                .is_over_headroom(self.config.options.concurrent_gc_max_headroom)
            {
                // Way ahead of the running collector: take the safepoint and
                // contribute or wait rather than keep allocating.
                self.stop_if_necessary();
            }
            return;
        }
        if self.pacing.should_collect_heuristic(Instant::now()) {
            self.collect_async(GcRequest::default());
        }
    }

    pub fn should_collect_heuristic(&self) -> bool {
        self.pacing.should_collect_heuristic(Instant::now())
    }

    fn request_collection(&self, request: GcRequest) -> Ticket {
        let ticket = self.requests.request(request);
        self.kick_collector();
        ticket
    }

    fn kick_collector(&self) {
        if !self.is_safe_to_collect() || self.is_shutting_down() {
            return;
        }
        if self.controller_state.lock().unwrap().prevention_count > 0 {
            return;
        }
        if self.config.options.use_collector_thread {
            let _ = self.mailbox.send(ControllerMessage::Wake);
        } else {
            // No dedicated collector thread: the mutator gets the conn and
            // drives the cycle from its own safepoints.
            self.world.set(MUTATOR_HAS_CONN_BIT);
        }
    }

    fn wait_for_collection(&self, ticket: Ticket) {
        let had_access = self.this_thread_has_access();
        if had_access {
            self.release_access();
        }
        self.world.set(MUTATOR_WAITING_BIT);
        loop {
            if self.requests.is_served(ticket) {
                break;
            }
            if self.world.has(MUTATOR_HAS_CONN_BIT)
                && (had_access || !self.world.has(HAS_ACCESS_BIT))
            {
                // The conn is with the mutator side and nobody else is being
                // the mutator right now: drive the cycle ourselves instead of
                // waiting for anyone.
                self.acquire_access();
                self.collect_in_mutator_thread();
                self.release_access();
                continue;
            }
            self.requests
                .wait_served_timeout(ticket, Duration::from_millis(2));
        }
        self.world.clear(MUTATOR_WAITING_BIT);
        if had_access {
            self.acquire_access();
        }
        if self.world.has(NEED_FINALIZE_BIT) {
            self.handle_need_finalize();
        }
    }

    // ------------------------------------------------------------------
    // Heap access and safepoints
    // ------------------------------------------------------------------

    pub fn has_access(&self) -> bool {
        self.world.has(HAS_ACCESS_BIT)
    }

    /// Does the calling thread hold heap access?  The mutator is required to
    /// precisely track whether or not it has heap access.
    pub fn this_thread_has_access(&self) -> bool {
        THREAD_HAS_ACCESS.with(|flag| flag.get())
    }

    pub fn world_is_stopped(&self) -> bool {
        self.controller_state.lock().unwrap().world_is_stopped
    }

    /// Acquire heap access.  Blocks while the collector is using the lack of
    /// access to do dangerous things to the heap.
    pub fn acquire_access(&self) {
        assert!(
            !self.this_thread_has_access(),
            "acquire_access: this thread already has heap access"
        );
        loop {
            let bits = self.world.load();
            if bits & (STOP_REQUESTED_BIT | STOPPED_BIT | HAS_ACCESS_BIT) != 0 {
                // Stopped world, or another thread is the mutator right now.
                self.world
                    .wait_until(|b| b & (STOP_REQUESTED_BIT | STOPPED_BIT | HAS_ACCESS_BIT) == 0);
                continue;
            }
            if self.world.cas(bits, bits | HAS_ACCESS_BIT) {
                THREAD_HAS_ACCESS.with(|flag| flag.set(true));
                return;
            }
        }
    }

    /// Release heap access.  If the collector is waiting to stop the world,
    /// it gets to run now.
    pub fn release_access(&self) {
        assert!(
            self.this_thread_has_access(),
            "release_access from a thread that does not hold access"
        );
        if self.world.has(NEED_FINALIZE_BIT) {
            self.handle_need_finalize();
        }
        loop {
            let bits = self.world.load();
            assert!(bits & HAS_ACCESS_BIT != 0, "release_access without access");
            if self.world.cas_and_notify(bits, bits & !HAS_ACCESS_BIT) {
                THREAD_HAS_ACCESS.with(|flag| flag.set(false));
                return;
            }
        }
    }

    /// The safepoint.  The fast path is a single unordered load and branch.
    #[inline]
    pub fn stop_if_necessary(&self) {
        if self.may_need_to_stop() {
            self.stop_if_necessary_slow();
        }
    }

    #[inline]
    pub fn may_need_to_stop(&self) -> bool {
        self.world.load_relaxed()
            & (STOP_REQUESTED_BIT | NEED_FINALIZE_BIT | MUTATOR_HAS_CONN_BIT)
            != 0
    }

    #[cold]
    fn stop_if_necessary_slow(&self) {
        if !self.this_thread_has_access() {
            // Safepoints only mean something for the access-holding mutator.
            return;
        }
        loop {
            let bits = self.world.load();
            if bits & NEED_FINALIZE_BIT != 0 {
                self.handle_need_finalize();
                continue;
            }
            if bits & MUTATOR_HAS_CONN_BIT != 0 {
                self.collect_in_mutator_thread();
                continue;
            }
            if bits & STOP_REQUESTED_BIT != 0 {
                self.park_mutator();
                continue;
            }
            return;
        }
    }

    /// Park until the collector resumes the world.  Access is dropped while
    /// parked; the stopped bit is only ever set for a mutator holding no
    /// access.
    fn park_mutator(&self) {
        loop {
            let bits = self.world.load();
            if bits & STOP_REQUESTED_BIT == 0 {
                return; // resumed before we parked
            }
            if self.world.cas_and_notify(bits, bits & !HAS_ACCESS_BIT) {
                THREAD_HAS_ACCESS.with(|flag| flag.set(false));
                break;
            }
        }
        trace!("mutator parked");
        self.world
            .wait_until(|b| b & (STOP_REQUESTED_BIT | STOPPED_BIT) == 0);
        self.acquire_access();
        trace!("mutator resumed");
    }

    /// Stop the mutator.  Returns false if the mutator holds the conn, in
    /// which case it will drive the phase machine itself.
    fn stop_the_mutator(&self) -> bool {
        self.world.set(STOP_REQUESTED_BIT);
        loop {
            let bits = self.world.load();
            if bits & MUTATOR_HAS_CONN_BIT != 0 {
                self.world.clear(STOP_REQUESTED_BIT);
                return false;
            }
            if bits & HAS_ACCESS_BIT == 0 {
                if bits & STOPPED_BIT != 0 || self.world.cas_and_notify(bits, bits | STOPPED_BIT) {
                    return true;
                }
                continue;
            }
            self.world
                .wait_until(|b| b & HAS_ACCESS_BIT == 0 || b & MUTATOR_HAS_CONN_BIT != 0);
        }
    }

    fn resume_the_mutator(&self) {
        self.stats.bump_mutator_execution_version();
        self.world.clear(STOPPED_BIT | STOP_REQUESTED_BIT);
    }

    /// Voluntarily hand the conn to the mutator so it can make forward
    /// progress on its own allocation slow paths without waiting for the
    /// collector thread to wake up.
    pub fn relinquish_conn(&self) {
        // Only between cycles; a transition in flight keeps its conductor.
        if self.current_phase().is_running() {
            return;
        }
        if self.requests.has_pending() && !self.is_shutting_down() {
            self.world.set(MUTATOR_HAS_CONN_BIT);
        }
    }

    fn collect_in_mutator_thread(&self) {
        // The safepoint must never block on the collector's long-held driver
        // lock; losing the race just means someone else is driving.
        let Ok(_guard) = self.conn_driver.try_lock() else {
            std::thread::yield_now();
            return;
        };
        if !self.world.has(MUTATOR_HAS_CONN_BIT) {
            return;
        }
        while self.run_current_phase(GcConductor::Mutator) {}
        self.world.clear(MUTATOR_HAS_CONN_BIT);
        if self.requests.has_pending() {
            self.kick_collector();
        }
    }

    /// Called by the collector thread when woken: drive phases until there is
    /// nothing left to do.
    pub(crate) fn drive_as_collector(&self) {
        let _guard = self.conn_driver.lock().unwrap();
        loop {
            if self.is_shutting_down() {
                return;
            }
            if self.world.has(MUTATOR_HAS_CONN_BIT) {
                // The mutator is driving; it will kick us again if needed.
                return;
            }
            if !self.run_current_phase(GcConductor::Collector) {
                return;
            }
        }
    }

    fn handle_need_finalize(&self) {
        let old = self.world.clear(NEED_FINALIZE_BIT);
        if old & NEED_FINALIZE_BIT == 0 {
            return; // another thread took it
        }
        let callbacks: Vec<HeapFinalizerCallback<R>> =
            self.heap_callbacks.lock().unwrap().clone();
        debug!("running {} heap finalizer callbacks", callbacks.len());
        for callback in callbacks {
            callback(self);
        }
    }

    // ------------------------------------------------------------------
    // Deferral
    // ------------------------------------------------------------------

    pub fn is_deferred(&self) -> bool {
        self.deferral.is_deferred()
    }

    pub(crate) fn increment_deferral_depth(&self) {
        self.deferral.increment();
    }

    pub(crate) fn decrement_deferral_depth_and_gc_if_needed(&self) {
        if self.deferral.decrement() {
            self.collect_if_necessary_or_defer();
        }
    }

    // ------------------------------------------------------------------
    // Prevention
    // ------------------------------------------------------------------

    /// A much stronger kind of stopping: prevents new cycles from starting
    /// and waits for any outstanding cycle to complete.
    pub fn prevent_collection(&self) {
        self.controller_state.lock().unwrap().prevention_count += 1;
        let had_access = self.this_thread_has_access();
        if had_access {
            self.release_access();
        }
        let mut state = self.controller_state.lock().unwrap();
        while self.current_phase().is_running() {
            state = self.phase_changed.wait(state).unwrap();
        }
        drop(state);
        if had_access {
            self.acquire_access();
        }
    }

    pub fn allow_collection(&self) {
        {
            let mut state = self.controller_state.lock().unwrap();
            assert!(state.prevention_count > 0, "unbalanced allow_collection");
            state.prevention_count -= 1;
        }
        self.kick_collector();
    }

    // ------------------------------------------------------------------
    // Roots, weak state, finalizers
    // ------------------------------------------------------------------

    /// Pin a cell against collection on behalf of callers that cannot
    /// participate in root scanning.
    pub fn protect(&self, cell: ObjectReference) {
        self.handle_set.protect(cell);
    }

    /// Returns true when the protect count drops to zero.
    pub fn unprotect(&self, cell: ObjectReference) -> bool {
        self.handle_set.unprotect(cell)
    }

    pub fn protected_object_count(&self) -> usize {
        self.handle_set.protected_count()
    }

    pub fn for_each_protected_cell<F>(&self, f: F)
    where
        F: FnMut(ObjectReference),
    {
        self.handle_set.for_each_protected(f);
    }

    pub fn make_weak_handle(&self, target: ObjectReference) -> Arc<WeakHandle> {
        self.handle_set.make_weak_handle(target)
    }

    pub fn register_weak_table(&self, table: Weak<dyn WeakGcTable>) {
        self.weak_tables.register(table);
    }

    pub fn unregister_weak_table(&self, table: &Weak<dyn WeakGcTable>) {
        self.weak_tables.unregister(table);
    }

    /// Register a finalizer invoked exactly once, when `cell` is found dead,
    /// before its memory is reused.
    pub fn add_finalizer(&self, cell: ObjectReference, finalizer: Finalizer) {
        self.finalizers.add(cell, finalizer);
    }

    pub fn add_heap_finalizer_callback(&self, callback: HeapFinalizerCallback<R>) {
        self.heap_callbacks.lock().unwrap().push(callback);
    }

    pub fn remove_heap_finalizer_callback(&self, callback: &HeapFinalizerCallback<R>) {
        self.heap_callbacks
            .lock()
            .unwrap()
            .retain(|c| !Arc::ptr_eq(c, callback));
    }

    /// Register a compiled-code stub destroyed when its owning cell dies.
    pub fn register_code_stub(&self, owner: ObjectReference, destructor: Box<dyn FnOnce() + Send>) {
        self.code_stubs.add(owner, destructor);
    }

    pub fn add_marking_constraint(&self, constraint: Box<dyn MarkingConstraint<R>>) {
        assert!(
            !self.current_phase().is_marking(),
            "cannot register constraints while marking"
        );
        self.constraints.lock().unwrap().add(constraint);
    }

    pub fn add_observer(&self, observer: &Arc<dyn HeapObserver>) {
        self.observers.lock().unwrap().push(Arc::downgrade(observer));
    }

    pub fn remove_observer(&self, observer: &Arc<dyn HeapObserver>) {
        let weak = Arc::downgrade(observer);
        self.observers.lock().unwrap().retain(|o| !o.ptr_eq(&weak));
    }

    fn notify_observers<F>(&self, f: F)
    where
        F: Fn(&dyn HeapObserver),
    {
        let strong: Vec<Arc<dyn HeapObserver>> = {
            let mut observers = self.observers.lock().unwrap();
            observers.retain(|o| o.strong_count() > 0);
            observers.iter().filter_map(|o| o.upgrade()).collect()
        };
        for observer in strong {
            f(&*observer);
        }
    }

    // ------------------------------------------------------------------
    // Marking plumbing
    // ------------------------------------------------------------------

    pub(crate) fn mark_version(&self) -> u32 {
        self.version.current()
    }

    pub(crate) fn shared_mark_stack(&self) -> &SharedMarkStack {
        &self.shared_stack
    }

    pub(crate) fn take_remembered_set(&self) -> Vec<ObjectReference> {
        std::mem::take(&mut *self.remembered_set.lock().unwrap())
    }

    pub(crate) fn add_to_remembered_set(&self, cell: ObjectReference) {
        if self.shared_stack.is_marking_active() {
            // Mid-cycle: hand the re-grey straight to the markers.
            self.shared_stack.push(cell);
        } else {
            self.remembered_set.lock().unwrap().push(cell);
        }
    }

    pub(crate) fn count_barrier(&self) {
        self.stats.count_barrier();
    }

    pub fn barrier_threshold(&self) -> u8 {
        self.barrier_threshold.load(Ordering::Relaxed)
    }

    pub fn mutator_should_be_fenced(&self) -> bool {
        self.mutator_should_be_fenced.load(Ordering::Relaxed)
    }

    fn set_mutator_should_be_fenced(&self, value: bool) {
        let value = value || self.config.options.force_fenced_barrier;
        self.mutator_should_be_fenced.store(value, Ordering::SeqCst);
        self.barrier_threshold.store(
            if value {
                TAUTOLOGICAL_THRESHOLD
            } else {
                BLACK_THRESHOLD
            },
            Ordering::SeqCst,
        );
    }

    /// The pacing hook for concurrent collection: called from allocation
    /// paths, pays down banked marking debt with a bounded marking
    /// increment on the mutator thread.
    pub fn perform_increment(&self, bytes: usize) {
        let scale = self.config.options.gc_increment_scale;
        if scale == 0.0 || self.current_phase() != CollectorPhase::Concurrent {
            return;
        }
        let balance = self.pacing.add_increment_balance(bytes as f64 * scale);
        if balance < self.config.options.gc_increment_bytes as f64 {
            return;
        }
        let mut visitor = SlotVisitor::new(self);
        let visited = visitor.drain_increment(balance as usize);
        if visited == 0 {
            self.pacing.reset_increment_balance();
        } else {
            self.pacing.add_increment_balance(-(visited as f64));
            self.cycle_bytes_visited.fetch_add(visited, Ordering::Relaxed);
            trace!(
                "mutator marking increment visited {} bytes (balance {:.0})",
                visited,
                self.pacing.increment_balance()
            );
        }
    }

    fn add_cycle_bytes_visited(&self, bytes: usize) {
        self.cycle_bytes_visited.fetch_add(bytes, Ordering::Relaxed);
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    pub fn current_phase(&self) -> CollectorPhase {
        self.current_phase.load(Ordering::SeqCst)
    }

    pub fn is_in_phase(&self, phase: CollectorPhase) -> bool {
        self.current_phase() == phase
    }

    pub fn collection_scope(&self) -> Option<CollectionScope> {
        self.controller_state.lock().unwrap().scope
    }

    pub fn last_collection_scope(&self) -> Option<CollectionScope> {
        self.controller_state.lock().unwrap().last_scope
    }

    pub fn gc_version(&self) -> u64 {
        self.stats.gc_version()
    }

    pub fn phase_version(&self) -> u64 {
        self.stats.phase_version()
    }

    pub fn mutator_execution_version(&self) -> u64 {
        self.stats.mutator_execution_version()
    }

    /// Cumulative wall clock spent in a phase, across all cycles.
    pub fn time_spent_in_phase(&self, phase: CollectorPhase) -> Duration {
        self.stats.phase_time(phase)
    }

    pub fn barriers_executed(&self) -> usize {
        self.stats.barriers_executed()
    }

    pub fn completed_full_collections(&self) -> u64 {
        self.stats.completed_full_collections()
    }

    pub fn completed_eden_collections(&self) -> u64 {
        self.stats.completed_eden_collections()
    }

    pub fn last_full_gc_length(&self) -> Duration {
        self.pacing.last_full_gc_length()
    }

    pub fn last_eden_gc_length(&self) -> Duration {
        self.pacing.last_eden_gc_length()
    }

    pub fn total_gc_time(&self) -> Duration {
        self.pacing.total_gc_time()
    }

    pub fn size_before_last_full_collection(&self) -> usize {
        self.pacing.size_before_last_full_collect()
    }

    pub fn size_after_last_full_collection(&self) -> usize {
        self.pacing.size_after_last_full_collect()
    }

    pub fn size_before_last_eden_collection(&self) -> usize {
        self.pacing.size_before_last_eden_collect()
    }

    pub fn size_after_last_eden_collection(&self) -> usize {
        self.pacing.size_after_last_eden_collect()
    }

    pub fn max_eden_size(&self) -> usize {
        self.pacing.max_eden_size()
    }

    pub fn max_heap_size(&self) -> usize {
        self.pacing.max_heap_size()
    }

    // ------------------------------------------------------------------
    // The phase state machine
    // ------------------------------------------------------------------

    /// Drive one phase.  Returns true if the conductor should keep driving.
    fn run_current_phase(&self, conductor: GcConductor) -> bool {
        match conductor {
            GcConductor::Mutator => {
                assert!(
                    self.world.has(MUTATOR_HAS_CONN_BIT),
                    "mutator driving phases without the conn"
                );
            }
            GcConductor::Collector => {
                if self.world.has(MUTATOR_HAS_CONN_BIT) {
                    // The conn was relinquished; the mutator drives now.
                    return false;
                }
            }
        }
        let phase = self.current_phase();
        trace!("{:?} driving {:?}", conductor, phase);
        match phase {
            CollectorPhase::NotRunning => self.run_not_running_phase(conductor),
            CollectorPhase::Begin => self.run_begin_phase(conductor),
            CollectorPhase::FixpointBegin => self.run_fixpoint_begin_phase(conductor),
            CollectorPhase::Fixpoint => self.run_fixpoint_phase(conductor),
            CollectorPhase::FixpointEnd => self.run_fixpoint_end_phase(conductor),
            CollectorPhase::Concurrent => self.run_concurrent_phase(conductor),
            CollectorPhase::Reloop => self.run_reloop_phase(conductor),
            CollectorPhase::End => self.run_end_phase(conductor),
        }
    }

    fn run_not_running_phase(&self, conductor: GcConductor) -> bool {
        if self.is_shutting_down() || !self.is_safe_to_collect() {
            return false;
        }
        if self.controller_state.lock().unwrap().prevention_count > 0 {
            return false;
        }
        let Some((request, ticket, requested_scope)) = self.requests.begin_cycle() else {
            return false;
        };
        debug!(
            "starting cycle for {:?} (ticket {}), requested scope {:?}",
            request, ticket, requested_scope
        );
        {
            let mut state = self.controller_state.lock().unwrap();
            state.requested_scope = requested_scope;
            state.marker_stat_at_begin = self.markers_stat();
        }
        self.change_phase(conductor, CollectorPhase::Begin);
        true
    }

    fn run_begin_phase(&self, conductor: GcConductor) -> bool {
        self.stop_the_world(conductor);
        let requested = self.controller_state.lock().unwrap().requested_scope;
        let scope = if requested == Some(CollectionScope::Full)
            || self.pacing.should_do_full_collection(
                self.object_space.size(),
                self.config.options.use_generational_gc,
            ) {
            CollectionScope::Full
        } else {
            CollectionScope::Eden
        };
        info!(
            "GC begin: {:?} collection ({} cells, {} bytes live)",
            scope,
            self.object_count(),
            self.size()
        );
        self.notify_observers(|o| o.will_collect(scope));
        R::Collection::suspend_compiler_threads();
        self.pacing
            .begin_cycle(scope, self.object_space.size(), Instant::now());
        if scope == CollectionScope::Full {
            // All cells become implicitly unmarked, no clear-all pass needed.
            self.version.bump();
        }
        self.object_space.set_allocating_black(true);
        let may_mark_concurrently =
            self.config.options.use_concurrent_gc && conductor == GcConductor::Collector;
        self.set_mutator_should_be_fenced(may_mark_concurrently);
        {
            let mut state = self.controller_state.lock().unwrap();
            state.scope = Some(scope);
            state.marking_converged = false;
        }
        self.cycle_bytes_visited.store(0, Ordering::Relaxed);
        self.shared_stack.set_marking_active(true);
        self.change_phase(conductor, CollectorPhase::FixpointBegin);
        true
    }

    fn run_fixpoint_begin_phase(&self, conductor: GcConductor) -> bool {
        debug_assert!(self.world_is_stopped());
        let mut visitor = SlotVisitor::new(self);
        let discovered = self.constraints.lock().unwrap().execute_all(&mut visitor);
        visitor.donate_all();
        self.add_cycle_bytes_visited(visitor.bytes_visited());
        debug!("root gathering discovered {} cells", discovered);
        self.change_phase(conductor, CollectorPhase::Fixpoint);
        true
    }

    fn run_fixpoint_phase(&self, conductor: GcConductor) -> bool {
        debug_assert!(self.world_is_stopped());
        let concurrent_allowed =
            self.config.options.use_concurrent_gc && conductor == GcConductor::Collector;
        let deadline =
            concurrent_allowed.then(|| Instant::now() + self.scheduler.pause_budget());
        let mut visitor = SlotVisitor::new(self);
        let converged = loop {
            if !visitor.drain_with_shared(deadline) {
                break false; // pause budget spent with work remaining
            }
            let discovered = self.constraints.lock().unwrap().execute_all(&mut visitor);
            if discovered == 0 && visitor.local_is_empty() {
                break true;
            }
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    break false;
                }
            }
        };
        visitor.donate_all();
        self.add_cycle_bytes_visited(visitor.bytes_visited());
        self.controller_state.lock().unwrap().marking_converged = converged;
        self.change_phase(conductor, CollectorPhase::FixpointEnd);
        true
    }

    fn run_fixpoint_end_phase(&self, conductor: GcConductor) -> bool {
        let converged = self.controller_state.lock().unwrap().marking_converged;
        if converged {
            self.change_phase(conductor, CollectorPhase::End);
        } else {
            debug_assert!(
                self.config.options.use_concurrent_gc && conductor == GcConductor::Collector,
                "unconverged marking can only be handed off to the concurrent phase"
            );
            self.change_phase(conductor, CollectorPhase::Concurrent);
            self.resume_the_world(conductor);
        }
        true
    }

    fn run_concurrent_phase(&self, conductor: GcConductor) -> bool {
        debug_assert!(conductor == GcConductor::Collector);
        self.scheduler.begin_collection();
        let mut visitor = SlotVisitor::new(self);
        loop {
            if self.is_shutting_down() {
                break;
            }
            self.shared_stack.set_throttled(false);
            self.scheduler.did_reclaim_timeslice();
            let deadline = Instant::now() + self.scheduler.collector_quantum();
            if visitor.drain_with_shared(Some(deadline)) {
                // Ran dry.  The barrier may still push more; Reloop will
                // re-check with the world stopped.
                break;
            }
            self.shared_stack.set_throttled(true);
            self.scheduler.did_yield_to_mutator();
            std::thread::sleep(self.scheduler.mutator_quantum());
        }
        self.shared_stack.set_throttled(false);
        self.scheduler.end_collection();
        self.add_cycle_bytes_visited(visitor.bytes_visited());
        self.change_phase(conductor, CollectorPhase::Reloop);
        true
    }

    fn run_reloop_phase(&self, conductor: GcConductor) -> bool {
        // Objects may have been allocated and stores barriered while we
        // marked concurrently; stop the world and re-check the constraints.
        self.stop_the_world(conductor);
        self.change_phase(conductor, CollectorPhase::Fixpoint);
        true
    }

    fn run_end_phase(&self, conductor: GcConductor) -> bool {
        self.stop_the_world(conductor);
        self.shared_stack.set_marking_active(false);
        self.shared_stack.assert_empty();
        trace!(
            "end phase: {}/{} markers parked, {} cells carry finalizers, {} code stubs",
            self.markers.parked_markers(),
            self.markers.marker_count(),
            self.finalizers.len(),
            self.code_stubs.len()
        );

        let (scope, version) = {
            let state = self.controller_state.lock().unwrap();
            (
                state.scope.expect("End phase without a collection scope"),
                self.mark_version(),
            )
        };
        let is_live =
            |cell: ObjectReference| !cell.header().is_dead_at_cycle_end(scope, version);

        // The reconciliation order is load-bearing; see the weak module.
        self.weak_tables.prune_all(&is_live);
        for (cell, finalizers) in self.finalizers.take_dead(&is_live) {
            for finalizer in finalizers {
                finalizer.invoke(cell);
            }
        }
        self.run_unconditional_finalizers(scope, version);
        self.handle_set.reap_weak_handles(&is_live);
        let stubs_deleted = self.code_stubs.delete_dead(&is_live);
        if stubs_deleted > 0 {
            debug!("deleted {} dead code stubs", stubs_deleted);
        }
        let swept = self.object_space.sweep(scope, version);

        self.object_space.set_allocating_black(false);
        self.set_mutator_should_be_fenced(false);

        let marker_stat = self.markers_stat();
        let begin_stat = self.controller_state.lock().unwrap().marker_stat_at_begin;
        let bytes_visited = self.cycle_bytes_visited.swap(0, Ordering::Relaxed)
            + (marker_stat.bytes_visited - begin_stat.bytes_visited);
        self.pacing.end_cycle(
            scope,
            self.object_space.size(),
            bytes_visited,
            &self.config.options,
            Instant::now(),
        );
        let heap_version = self.stats.bump_gc_version();
        self.stats.count_completed(scope == CollectionScope::Full);

        self.notify_observers(|o| o.did_collect(scope));
        if !self.heap_callbacks.lock().unwrap().is_empty() {
            self.world.set(NEED_FINALIZE_BIT);
        }
        R::Collection::resume_compiler_threads();
        let served = self.requests.retire_cycle(scope);
        {
            let mut state = self.controller_state.lock().unwrap();
            state.scope = None;
            state.last_scope = Some(scope);
        }
        self.change_phase(conductor, CollectorPhase::NotRunning);
        self.resume_the_world(conductor);
        // Wake waiters only after the new phase and the resumed world are
        // published; a woken waiter must observe a finished collection.
        self.requests.publish_served(served);
        info!(
            "GC end: {:?} collection v{} swept {} cells / {} bytes, visited {} bytes, {} cells live",
            scope, heap_version, swept.swept_cells, swept.swept_bytes, bytes_visited,
            self.object_count()
        );
        self.requests.has_pending()
    }

    fn run_unconditional_finalizers(&self, scope: CollectionScope, version: u32) {
        let mut ran = 0usize;
        self.object_space.for_each_dead_cell(scope, version, |cell| {
            let descriptor = self.kinds.descriptor(cell.header().kind());
            if let Some(finalizer) = descriptor.unconditional_finalizer {
                finalizer(cell);
                ran += 1;
            }
        });
        if ran > 0 {
            debug!("ran {} unconditional finalizers", ran);
        }
    }

    fn change_phase(&self, _conductor: GcConductor, next: CollectorPhase) {
        let current = self.current_phase();
        assert!(
            current.can_transition_to(next),
            "invalid collector phase transition {:?} -> {:?}",
            current,
            next
        );
        {
            let mut timer = self.phase_timer.lock().unwrap();
            let now = Instant::now();
            self.stats.record_phase(current, now - *timer);
            *timer = now;
        }
        self.current_phase.store(next, Ordering::SeqCst);
        self.stats.bump_phase_version();
        debug!("collector phase: {:?} -> {:?}", current, next);
        let _state = self.controller_state.lock().unwrap();
        self.phase_changed.notify_all();
    }

    fn stop_the_world(&self, conductor: GcConductor) {
        if self.world_is_stopped() {
            return;
        }
        if conductor == GcConductor::Collector {
            let stopped = self.stop_the_mutator();
            assert!(stopped, "collector lost the conn mid-cycle");
        }
        // A mutator conductor is the mutator; nothing else mutates the heap.
        self.controller_state.lock().unwrap().world_is_stopped = true;
        trace!("world stopped by {:?}", conductor);
    }

    fn resume_the_world(&self, conductor: GcConductor) {
        if !self.world_is_stopped() {
            return;
        }
        self.controller_state.lock().unwrap().world_is_stopped = false;
        if conductor == GcConductor::Collector {
            self.resume_the_mutator();
        } else {
            self.stats.bump_mutator_execution_version();
        }
        trace!("world resumed by {:?}", conductor);
    }

    fn markers_stat(&self) -> MarkerStat {
        self.markers.merged_stat()
    }
}
