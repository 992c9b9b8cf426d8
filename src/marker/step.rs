//! The scanning loop, the write-barrier slow paths, and the paced step
//! entry points.

use std::sync::atomic::Ordering;

use log::trace;

use crate::heap::GcState;
use crate::marker::{
    CompletionAction, ForceCompletionAction, IncrementalMarker, MarkingState, StepOrigin,
};
use crate::object::{HeapObject, InstanceType, Map};
use crate::page::{PageFlags, SpaceId};
use crate::pacer::{
    estimate_step_size, ALLOCATED_THRESHOLD, MAX_STEP_SIZE_MS, OOM_SLACK_BYTES, STEP_SIZE_MS,
};
use crate::types::{Address, ObjectRef};
use crate::visitor::MarkingVisitor;

impl IncrementalMarker {
    // Color transitions with work-list discipline.

    /// Grey a white object and enqueue it. Returns whether this call did the
    /// greying. If the main channel is full the object overflows into the
    /// bailout channel, which cannot fail, so a grey object is never
    /// stranded off-list.
    pub fn white_to_grey_and_push(&self, obj: ObjectRef) -> bool {
        let page = self.heap().page_of_object(obj);
        if page.white_to_grey(obj.to_address()) {
            if !self.worklist().push(obj) {
                self.worklist().push_bailout(obj);
            }
            return true;
        }
        false
    }

    /// Grey a white object without enqueueing it (normalized-map caches).
    pub(crate) fn white_to_grey_without_push(&self, obj: ObjectRef) {
        let page = self.heap().page_of_object(obj);
        page.white_to_grey(obj.to_address());
    }

    /// Color an object black and hand it to the bailout channel (concurrent
    /// configuration) or the main channel with the black-to-grey fallback.
    pub fn mark_black_and_push(&self, obj: ObjectRef) {
        let page = self.heap().page_of_object(obj);
        let addr = obj.to_address();
        page.white_to_grey(addr);
        if page.grey_to_black(addr) {
            if self.config().concurrent_marking {
                self.worklist().push_bailout(obj);
            } else if !self.worklist().push(obj) {
                page.black_to_grey(addr);
            }
        }
    }

    /// Re-enqueue a partially scanned progress-bar array.
    pub(crate) fn requeue_progress_bar_object(&self, obj: ObjectRef) {
        if self.config().concurrent_marking {
            self.worklist().push_bailout(obj);
            return;
        }
        let page = self.heap().page_of_object(obj);
        let addr = obj.to_address();
        if page.is_grey(addr) {
            // A full main channel is fine here: the visitor keeps scanning
            // synchronously while the list stays full.
            let _ = self.worklist().push(obj);
        } else {
            debug_assert!(page.is_black(addr));
            if !self.worklist().push(obj) {
                page.black_to_grey(addr);
            }
        }
    }

    /// The progress-bar arm tells the pacer how much of the array it did not
    /// reach, so a step is only charged for bytes actually scanned.
    pub(crate) fn notify_incomplete_scan(&self, unscanned_bytes: usize) {
        self.unscanned_bytes_of_large_object
            .store(unscanned_bytes, Ordering::Release);
    }

    // Write-barrier slow paths.

    fn base_record_write(&self, host: ObjectRef, value: ObjectRef) -> bool {
        debug_assert!(self.heap().color_of(value) != crate::bitmap::Color::Impossible);
        let need_recording = self.config().concurrent_marking || self.heap().is_black(host);
        if need_recording && self.white_to_grey_and_push(value) {
            self.restart_if_not_marking();
        }
        self.is_compacting() && need_recording
    }

    /// Slow path for `host.*slot = value`.
    pub fn record_write(&self, host: ObjectRef, slot: Address, value: ObjectRef) {
        if self.base_record_write(host, value) {
            // The host will not be rescanned; the compactor needs the slot.
            self.compactor().record_slot(host, slot, value);
        }
    }

    /// Slow path for stores into a code object's relocation info.
    pub fn record_write_into_code(&self, host: ObjectRef, reloc: Address, value: ObjectRef) {
        if self.base_record_write(host, value) {
            self.compactor().record_reloc_slot(host, reloc, value);
        }
    }

    /// A code target was patched at `pc` inside `host`.
    pub fn record_code_target_patch(&self, host: ObjectRef, pc: Address, value: ObjectRef) {
        if self.is_marking() {
            self.record_write_into_code(host, pc, value);
        }
    }

    /// Visitor-side slot recording; only compacting cycles need the slots.
    pub(crate) fn record_slot(&self, host: ObjectRef, slot: Address, value: ObjectRef) {
        if self.is_compacting() {
            self.compactor().record_slot(host, slot, value);
        }
    }

    /// Mutator store helper: performs the store, then runs the barrier fast
    /// path and, when interesting, the slow path.
    pub fn write_field(&self, host: ObjectRef, index: usize, value: Option<ObjectRef>) {
        let view = HeapObject::new(host);
        view.set_raw_field(index, value.map_or(0, ObjectRef::as_usize));
        if let Some(value) = value {
            if self.barrier().store_needs_slow_path(self.heap(), host, value) {
                self.record_write(host, view.field_address(index), value);
            }
        }
    }

    // The scanning loop.

    /// Visit one grey object: blacken it, grey its map, scan its fields.
    /// Returns the object size in bytes.
    pub(crate) fn visit_object(&self, map: Map, obj: ObjectRef) -> usize {
        let page = self.heap().page_of_object(obj);
        let addr = obj.to_address();
        debug_assert!(matches!(
            page.color(addr),
            crate::bitmap::Color::Grey | crate::bitmap::Color::Black
        ));
        if !page.grey_to_black(addr) {
            // Already black: a progress-bar array mid-scan, or a plain
            // object / string that raced an unsafe layout change.
            debug_assert!(
                page.is_flag_set(PageFlags::HAS_PROGRESS_BAR)
                    || matches!(
                        map.instance_type(),
                        InstanceType::Plain | InstanceType::ByteData
                    )
            );
        }
        self.white_to_grey_and_push(map.object());
        MarkingVisitor::new(self).visit(map, obj)
    }

    /// Pop and scan until `bytes_to_process` bytes are accounted for, or to
    /// exhaustion under `ForceCompletion`. Returns bytes actually scanned.
    pub(crate) fn process_marking_worklist(
        &self,
        bytes_to_process: usize,
        completion: ForceCompletionAction,
    ) -> usize {
        let mut bytes_processed = 0;
        while bytes_processed < bytes_to_process
            || completion == ForceCompletionAction::ForceCompletion
        {
            let Some(obj) = self.worklist().pop() else {
                break;
            };
            // Left trimming leaves filler objects on the list; skip them.
            if self.heap().is_filler(obj) {
                continue;
            }
            let map = HeapObject::new(obj).map();
            self.unscanned_bytes_of_large_object.store(0, Ordering::Release);
            let size = self.visit_object(map, obj);
            bytes_processed +=
                size - self.unscanned_bytes_of_large_object.load(Ordering::Acquire);
        }
        // Hand any wrappers found during scanning to the embedder before the
        // mutator can invalidate them.
        self.embedder().register_wrappers_with_remote_tracer();
        bytes_processed
    }

    /// One marking step of roughly `bytes_to_process` bytes.
    pub fn step(
        &self,
        bytes_to_process: usize,
        action: CompletionAction,
        completion: ForceCompletionAction,
        origin: StepOrigin,
    ) -> usize {
        let start = self.now_ms();

        if self.state() == MarkingState::Sweeping {
            self.finalize_sweeping();
        }

        let mut bytes_processed = 0;
        if self.state() == MarkingState::Marking {
            if self.config().concurrent_marking {
                self.add_schedule_credit(self.concurrent().drain_progress());
            }
            // `completion` governs only the completion decision below; the
            // drain itself always honors the byte budget.
            bytes_processed = self.process_marking_worklist(
                bytes_to_process,
                ForceCompletionAction::DoNotForceCompletion,
            );
            if origin == StepOrigin::Task {
                self.add_schedule_credit(bytes_processed);
            }

            if self.worklist().is_empty() {
                if self.embedder().should_finalize_incremental_marking() {
                    if completion == ForceCompletionAction::ForceCompletion
                        || self.idle_marking_delay_limit_reached()
                    {
                        if !self.finalize_marking_completed() {
                            self.finalize_marking(action);
                        } else {
                            self.marking_complete(action);
                        }
                    } else {
                        self.increment_idle_marking_delay_counter();
                    }
                } else {
                    self.embedder().notify_marking_worklist_empty();
                }
            }
        }

        if self.config().concurrent_marking {
            self.concurrent().reschedule_tasks_if_needed(&self.self_arc());
        }

        let duration = self.now_ms() - start;
        // Zero bytes is normal while sweeping or right after start.
        self.pacer.lock().record_step(bytes_processed, duration);
        trace!(
            "[marker] step {} {} bytes ({}) in {:.1} ms",
            match origin {
                StepOrigin::Mutator => "in mutator",
                StepOrigin::Task => "in task",
            },
            bytes_processed,
            bytes_to_process,
            duration
        );
        bytes_processed
    }

    // Paced entry points.

    /// Allocation-observer callback: pay for recent allocation with marking
    /// work, preferring ahead-of-schedule credit over synchronous scanning.
    pub fn advance_incremental_marking_on_allocation(&self) {
        // A scoped allocation override promises the GC state won't change,
        // which rules out marking steps.
        if self.heap().gc_state() != GcState::NotInGc
            || !self.config().incremental_marking
            || !matches!(self.state(), MarkingState::Sweeping | MarkingState::Marking)
            || self.heap().always_allocate()
        {
            return;
        }

        let bytes_to_process = {
            let mut pacer = self.pacer.lock();
            let keep_up =
                pacer.step_size_to_keep_up(self.heap().old_generation_allocation_counter());
            let close_to_oom = self
                .heap()
                .is_close_to_out_of_memory(self.heap().new_space().capacity() + OOM_SLACK_BYTES);
            let progress = pacer.step_size_to_make_progress(
                self.ms_since_start(),
                self.heap().promoted_space_size(),
                close_to_oom,
            );
            keep_up + progress
        };

        if bytes_to_process < ALLOCATED_THRESHOLD {
            return;
        }

        // The first step after a scavenge sees a burst of allocated bytes;
        // cap the step to keep the work spread out.
        let max_step =
            estimate_step_size(MAX_STEP_SIZE_MS, self.pacer.lock().marking_speed());
        let bytes_to_process = bytes_to_process.min(max_step);

        let bytes_processed = if self.try_spend_credit(bytes_to_process) {
            // Concurrent or idle tasks already did this work; shift the
            // marking time out of the mutator.
            bytes_to_process
        } else {
            self.step(
                bytes_to_process,
                CompletionAction::GcViaStackGuard,
                ForceCompletionAction::ForceCompletion,
                StepOrigin::Mutator,
            )
        };
        self.pacer.lock().charge_bytes_processed(bytes_processed);
    }

    /// Idle-time driver: alternate marking steps with embedder wrapper
    /// tracing until the deadline (monotonic ms, same scale as [`now_ms`])
    /// is closer than one step. Returns the remaining time.
    ///
    /// [`now_ms`]: IncrementalMarker::now_ms
    pub fn advance_incremental_marking(
        &self,
        deadline_ms: f64,
        action: CompletionAction,
        completion: ForceCompletionAction,
        origin: StepOrigin,
    ) -> f64 {
        debug_assert!(!self.is_stopped());

        let step_size = estimate_step_size(STEP_SIZE_MS, self.pacer.lock().marking_speed());
        let wrapper_tracing = self.state() == MarkingState::Marking
            && self.config().incremental_marking_wrappers
            && self.embedder().in_use();

        let mut remaining;
        loop {
            let tracing_turn = wrapper_tracing && self.trace_wrappers_toggle_flip();
            if tracing_turn {
                let wrapper_deadline = self.now_ms() + STEP_SIZE_MS;
                if !self.embedder().should_finalize_incremental_marking() {
                    self.embedder().trace(wrapper_deadline);
                }
            } else {
                self.step(step_size, action, completion, origin);
            }
            remaining = deadline_ms - self.now_ms();
            if remaining < STEP_SIZE_MS || self.is_complete() || self.worklist().is_empty() {
                break;
            }
        }
        remaining
    }

    // Black-allocation mutation hook.

    /// The mutator changed a black-allocated object in a way that may have
    /// introduced white outgoing pointers; rescan it.
    pub fn process_black_allocated_object(&self, obj: ObjectRef) {
        if self.is_marking() && self.heap().is_black(obj) {
            self.revisit_object(obj);
        }
    }

    fn revisit_object(&self, obj: ObjectRef) {
        debug_assert!(self.is_marking());
        debug_assert!(self.config().concurrent_marking || self.heap().is_black(obj));
        let page = self.heap().page_of_object(obj);
        if page.space() == SpaceId::Large {
            // A fresh scan must start from the front.
            page.reset_progress_bar();
        }
        let map = HeapObject::new(obj).map();
        self.white_to_grey_and_push(map.object());
        MarkingVisitor::new(self).visit(map, obj);
    }
}
