//! The incremental marker: owner of the colors, the work-list, and the
//! marking lifecycle.
//!
//! One `IncrementalMarker` exists per heap and lives as long as the heap.
//! The mutator drives every lifecycle transition; marking *steps* run on the
//! mutator (allocation-triggered or idle-time) while optional concurrent
//! tasks share only the scanning loop and the bailout channel.

mod fixup;
mod lifecycle;
mod step;

use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use arc_swap::ArcSwap;
use parking_lot::Mutex;

use crate::barrier::WriteBarrier;
use crate::black_allocation::BlackAllocator;
use crate::concurrent::ConcurrentMarking;
use crate::config::MarkingConfig;
use crate::heap::{GcState, Heap};
use crate::interfaces::{Compactor, EmbedderTracer};
use crate::pacer::Pacer;
use crate::space::AllocationObserver;
use crate::types::Address;
use crate::worklist::MarkingWorklist;

/// Lifecycle states. `is_marking` covers both `Marking` and `Complete`:
/// the barrier stays active until `stop`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkingState {
    Stopped,
    Sweeping,
    Marking,
    Complete,
}

/// What the marker last asked the mutator to do via the stack guard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RequestType {
    None = 0,
    Finalization = 1,
    CompleteMarking = 2,
}

impl RequestType {
    fn from_u8(raw: u8) -> RequestType {
        match raw {
            0 => RequestType::None,
            1 => RequestType::Finalization,
            2 => RequestType::CompleteMarking,
            _ => unreachable!("invalid request type {raw}"),
        }
    }
}

/// Whether completion raises a stack-guard GC request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionAction {
    GcViaStackGuard,
    NoGcViaStackGuard,
}

/// Whether a step may declare completion itself or defers behind the
/// idle-delay counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForceCompletionAction {
    ForceCompletion,
    DoNotForceCompletion,
}

/// Who is running the scanning loop; task work accrues schedule credit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOrigin {
    Mutator,
    Task,
}

/// Steps with an empty work-list only complete after this many idle retries,
/// unless completion is forced.
pub const MAX_IDLE_MARKING_DELAY: usize = 3;

/// The incremental tri-color marker.
///
/// # Examples
///
/// ```
/// use greymark::config::GcReason;
/// use greymark::test_utils::TestFixture;
///
/// let fixture = TestFixture::new();
/// let marker = &fixture.marker;
/// assert!(marker.is_stopped());
///
/// let map = fixture.heap.new_plain_map(1);
/// let root = fixture.heap.allocate_plain(map);
/// fixture.heap.add_root(root);
///
/// marker.start(GcReason::Testing).unwrap();
/// marker.finalize();
/// assert!(fixture.heap.is_black(root));
/// assert!(marker.is_stopped());
/// ```
pub struct IncrementalMarker {
    heap: Arc<Heap>,
    config: MarkingConfig,
    compactor: Arc<dyn Compactor>,
    embedder: Arc<dyn EmbedderTracer>,
    worklist: MarkingWorklist,
    barrier: WriteBarrier,
    black_allocator: BlackAllocator,
    concurrent: ConcurrentMarking,
    self_weak: Weak<IncrementalMarker>,

    state: ArcSwap<MarkingState>,
    request_type: AtomicU8,
    is_compacting: AtomicBool,
    should_hurry: AtomicBool,
    was_activated: AtomicBool,
    finalize_marking_completed: AtomicBool,
    trace_wrappers_toggle: AtomicBool,

    pacer: Mutex<Pacer>,
    clock_origin: Instant,
    start_time_ms: AtomicUsize,
    bytes_marked_ahead_of_schedule: AtomicUsize,
    unscanned_bytes_of_large_object: AtomicUsize,
    idle_marking_delay_counter: AtomicUsize,
    finalization_rounds: AtomicUsize,

    observer: Mutex<Option<Arc<dyn AllocationObserver>>>,
}

impl IncrementalMarker {
    pub fn new(
        heap: &Arc<Heap>,
        config: MarkingConfig,
        compactor: Arc<dyn Compactor>,
        embedder: Arc<dyn EmbedderTracer>,
    ) -> Arc<IncrementalMarker> {
        let worklist = MarkingWorklist::new(config.worklist_capacity);
        let concurrent = ConcurrentMarking::new(config.parallel_workers, config.concurrent_marking);
        Arc::new_cyclic(|self_weak| IncrementalMarker {
            heap: Arc::clone(heap),
            black_allocator: BlackAllocator::new(heap),
            config,
            compactor,
            embedder,
            worklist,
            barrier: WriteBarrier::new(),
            concurrent,
            self_weak: self_weak.clone(),
            state: ArcSwap::from_pointee(MarkingState::Stopped),
            request_type: AtomicU8::new(RequestType::None as u8),
            is_compacting: AtomicBool::new(false),
            should_hurry: AtomicBool::new(false),
            was_activated: AtomicBool::new(false),
            finalize_marking_completed: AtomicBool::new(false),
            trace_wrappers_toggle: AtomicBool::new(false),
            pacer: Mutex::new(Pacer::new()),
            clock_origin: Instant::now(),
            start_time_ms: AtomicUsize::new(0),
            bytes_marked_ahead_of_schedule: AtomicUsize::new(0),
            unscanned_bytes_of_large_object: AtomicUsize::new(0),
            idle_marking_delay_counter: AtomicUsize::new(0),
            finalization_rounds: AtomicUsize::new(0),
            observer: Mutex::new(None),
        })
    }

    // Component accessors.

    pub fn heap(&self) -> &Arc<Heap> {
        &self.heap
    }

    pub fn config(&self) -> &MarkingConfig {
        &self.config
    }

    pub fn worklist(&self) -> &MarkingWorklist {
        &self.worklist
    }

    pub fn barrier(&self) -> &WriteBarrier {
        &self.barrier
    }

    pub fn black_allocator(&self) -> &BlackAllocator {
        &self.black_allocator
    }

    pub fn compactor(&self) -> &Arc<dyn Compactor> {
        &self.compactor
    }

    pub fn embedder(&self) -> &Arc<dyn EmbedderTracer> {
        &self.embedder
    }

    pub fn concurrent(&self) -> &ConcurrentMarking {
        &self.concurrent
    }

    pub(crate) fn self_arc(&self) -> Arc<IncrementalMarker> {
        self.self_weak.upgrade().expect("marker already dropped")
    }

    // State and predicates.

    pub fn state(&self) -> MarkingState {
        **self.state.load()
    }

    pub(crate) fn set_state(&self, state: MarkingState) {
        self.state.store(Arc::new(state));
    }

    pub fn is_stopped(&self) -> bool {
        self.state() == MarkingState::Stopped
    }

    pub fn is_sweeping(&self) -> bool {
        self.state() == MarkingState::Sweeping
    }

    pub fn is_marking(&self) -> bool {
        matches!(self.state(), MarkingState::Marking | MarkingState::Complete)
    }

    pub fn is_complete(&self) -> bool {
        self.state() == MarkingState::Complete
    }

    pub fn is_compacting(&self) -> bool {
        self.is_compacting.load(Ordering::Acquire)
    }

    pub fn should_hurry(&self) -> bool {
        self.should_hurry.load(Ordering::Acquire)
    }

    pub(crate) fn set_should_hurry(&self, value: bool) {
        self.should_hurry.store(value, Ordering::Release);
    }

    pub fn was_activated(&self) -> bool {
        self.was_activated.load(Ordering::Acquire)
    }

    pub fn finalize_marking_completed(&self) -> bool {
        self.finalize_marking_completed.load(Ordering::Acquire)
    }

    pub fn finalization_rounds(&self) -> usize {
        self.finalization_rounds.load(Ordering::Relaxed)
    }

    pub fn request_type(&self) -> RequestType {
        RequestType::from_u8(self.request_type.load(Ordering::Acquire))
    }

    pub(crate) fn set_request_type(&self, request: RequestType) {
        self.request_type.store(request as u8, Ordering::Release);
    }

    /// Starting is allowed while the feature is on, the heap is idle, and no
    /// serializer is running.
    pub fn can_be_activated(&self) -> bool {
        self.config.incremental_marking
            && self.heap.gc_state() == GcState::NotInGc
            && self.heap.deserialization_complete()
            && !self.heap.serializer_enabled()
    }

    /// Bytes marked by concurrent or idle tasks that allocation-triggered
    /// steps may spend instead of scanning synchronously.
    pub fn bytes_marked_ahead_of_schedule(&self) -> usize {
        self.bytes_marked_ahead_of_schedule.load(Ordering::Acquire)
    }

    pub(crate) fn add_schedule_credit(&self, bytes: usize) {
        self.bytes_marked_ahead_of_schedule
            .fetch_add(bytes, Ordering::AcqRel);
    }

    /// Atomically spend `bytes` of credit; false if the balance is short.
    pub(crate) fn try_spend_credit(&self, bytes: usize) -> bool {
        self.bytes_marked_ahead_of_schedule
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |credit| {
                credit.checked_sub(bytes)
            })
            .is_ok()
    }

    // Clock. All deadlines use this monotonic millisecond scale.

    pub fn now_ms(&self) -> f64 {
        self.clock_origin.elapsed().as_secs_f64() * 1000.0
    }

    pub(crate) fn ms_since_start(&self) -> f64 {
        let started = self.start_time_ms.load(Ordering::Relaxed) as f64;
        (self.now_ms() - started).max(0.0)
    }

    pub(crate) fn record_start_time(&self) {
        self.start_time_ms
            .store(self.now_ms() as usize, Ordering::Relaxed);
    }

    // Idle-delay counter.

    pub(crate) fn idle_marking_delay_limit_reached(&self) -> bool {
        self.idle_marking_delay_counter.load(Ordering::Relaxed) > MAX_IDLE_MARKING_DELAY
    }

    pub(crate) fn increment_idle_marking_delay_counter(&self) {
        self.idle_marking_delay_counter
            .fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn clear_idle_marking_delay_counter(&self) {
        self.idle_marking_delay_counter.store(0, Ordering::Relaxed);
    }

    pub(crate) fn set_is_compacting(&self, value: bool) {
        self.is_compacting.store(value, Ordering::Release);
    }

    pub(crate) fn set_was_activated(&self, value: bool) {
        self.was_activated.store(value, Ordering::Release);
    }

    pub(crate) fn trace_wrappers_toggle_flip(&self) -> bool {
        self.trace_wrappers_toggle.fetch_xor(true, Ordering::Relaxed)
    }

    pub(crate) fn reset_schedule_credit(&self) {
        self.bytes_marked_ahead_of_schedule.store(0, Ordering::Release);
    }
}

/// The allocation observer the marker registers with every space while a
/// cycle runs. Fires on the observer threshold and pays for the allocated
/// bytes with a marking step.
pub(crate) struct MarkingObserver {
    marker: Weak<IncrementalMarker>,
}

impl MarkingObserver {
    pub(crate) fn new(marker: Weak<IncrementalMarker>) -> MarkingObserver {
        MarkingObserver { marker }
    }
}

impl AllocationObserver for MarkingObserver {
    fn step(&self, _bytes_allocated: usize, _soon_object: Address, _size: usize) {
        if let Some(marker) = self.marker.upgrade() {
            marker.advance_incremental_marking_on_allocation();
        }
    }
}
