//! Recording and null collaborators for tests and examples.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::interfaces::{Compactor, EmbedderTracer};
use crate::types::{Address, ObjectRef};

/// A compactor stand-in that records every slot it is handed.
///
/// # Examples
///
/// ```
/// use greymark::interfaces::mocks::RecordingCompactor;
/// use greymark::interfaces::Compactor;
///
/// let compactor = RecordingCompactor::default();
/// assert!(!compactor.start_compaction());
/// compactor.set_will_compact(true);
/// assert!(compactor.start_compaction());
/// ```
#[derive(Default)]
pub struct RecordingCompactor {
    will_compact: AtomicBool,
    sweeping: AtomicBool,
    sweeper_tasks: AtomicBool,
    sweeps_forced: AtomicUsize,
    slots: Mutex<Vec<(ObjectRef, Address, ObjectRef)>>,
    reloc_slots: Mutex<Vec<(ObjectRef, Address, ObjectRef)>>,
}

impl RecordingCompactor {
    pub fn set_will_compact(&self, value: bool) {
        self.will_compact.store(value, Ordering::Release);
    }

    pub fn set_sweeping_in_progress(&self, value: bool) {
        self.sweeping.store(value, Ordering::Release);
    }

    pub fn set_sweeper_tasks_running(&self, value: bool) {
        self.sweeper_tasks.store(value, Ordering::Release);
    }

    pub fn recorded_slots(&self) -> Vec<(ObjectRef, Address, ObjectRef)> {
        self.slots.lock().clone()
    }

    pub fn recorded_reloc_slots(&self) -> Vec<(ObjectRef, Address, ObjectRef)> {
        self.reloc_slots.lock().clone()
    }

    pub fn forced_sweep_count(&self) -> usize {
        self.sweeps_forced.load(Ordering::Relaxed)
    }
}

impl Compactor for RecordingCompactor {
    fn start_compaction(&self) -> bool {
        self.will_compact.load(Ordering::Acquire)
    }

    fn sweeping_in_progress(&self) -> bool {
        self.sweeping.load(Ordering::Acquire)
    }

    fn sweeper_tasks_running(&self) -> bool {
        self.sweeper_tasks.load(Ordering::Acquire)
    }

    fn ensure_sweeping_completed(&self) {
        self.sweeps_forced.fetch_add(1, Ordering::Relaxed);
        self.sweeping.store(false, Ordering::Release);
        self.sweeper_tasks.store(false, Ordering::Release);
    }

    fn record_slot(&self, host: ObjectRef, slot: Address, value: ObjectRef) {
        self.slots.lock().push((host, slot, value));
    }

    fn record_reloc_slot(&self, host: ObjectRef, reloc: Address, value: ObjectRef) {
        self.reloc_slots.lock().push((host, reloc, value));
    }
}

/// An embedder with no wrappers: always ready to finalize.
#[derive(Default)]
pub struct NullEmbedderTracer {
    prologues: AtomicUsize,
    registrations: AtomicUsize,
    empty_notifications: AtomicUsize,
}

impl NullEmbedderTracer {
    pub fn prologue_count(&self) -> usize {
        self.prologues.load(Ordering::Relaxed)
    }

    pub fn registration_count(&self) -> usize {
        self.registrations.load(Ordering::Relaxed)
    }

    pub fn empty_notification_count(&self) -> usize {
        self.empty_notifications.load(Ordering::Relaxed)
    }
}

impl EmbedderTracer for NullEmbedderTracer {
    fn in_use(&self) -> bool {
        false
    }

    fn trace_prologue(&self) {
        self.prologues.fetch_add(1, Ordering::Relaxed);
    }

    fn trace(&self, _deadline_ms: f64) {}

    fn should_finalize_incremental_marking(&self) -> bool {
        true
    }

    fn register_wrappers_with_remote_tracer(&self) {
        self.registrations.fetch_add(1, Ordering::Relaxed);
    }

    fn cached_wrappers_to_trace(&self) -> usize {
        0
    }

    fn notify_marking_worklist_empty(&self) {
        self.empty_notifications.fetch_add(1, Ordering::Relaxed);
    }
}

/// An embedder that holds back finalization for a configurable number of
/// polls, then reports ready. Exercises the not-ready path of `step`.
pub struct StallingEmbedderTracer {
    remaining_stalls: AtomicUsize,
    cached: AtomicUsize,
    empty_notifications: AtomicUsize,
}

impl StallingEmbedderTracer {
    pub fn new(stalls: usize, cached_wrappers: usize) -> Self {
        Self {
            remaining_stalls: AtomicUsize::new(stalls),
            cached: AtomicUsize::new(cached_wrappers),
            empty_notifications: AtomicUsize::new(0),
        }
    }

    pub fn empty_notification_count(&self) -> usize {
        self.empty_notifications.load(Ordering::Relaxed)
    }
}

impl EmbedderTracer for StallingEmbedderTracer {
    fn in_use(&self) -> bool {
        true
    }

    fn trace_prologue(&self) {}

    fn trace(&self, _deadline_ms: f64) {
        self.cached.store(0, Ordering::Relaxed);
    }

    fn should_finalize_incremental_marking(&self) -> bool {
        if self.remaining_stalls.load(Ordering::Relaxed) == 0 {
            return true;
        }
        self.remaining_stalls.fetch_sub(1, Ordering::Relaxed);
        false
    }

    fn register_wrappers_with_remote_tracer(&self) {}

    fn cached_wrappers_to_trace(&self) -> usize {
        self.cached.load(Ordering::Relaxed)
    }

    fn notify_marking_worklist_empty(&self) {
        self.empty_notifications.fetch_add(1, Ordering::Relaxed);
    }
}
