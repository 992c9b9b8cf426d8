//! Lifecycle transitions. Mutator-only: no worker ever runs these.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use log::{debug, info};

use crate::barrier::BarrierMode;
use crate::config::GcReason;
use crate::error::{GcError, GcResult};
use crate::marker::{
    CompletionAction, ForceCompletionAction, IncrementalMarker, MarkingObserver, MarkingState,
    RequestType,
};
use crate::object::{HeapObject, NATIVE_CONTEXT_CACHE_SLOT};
use crate::page::PageFlags;
use crate::space::AllocationObserver;

const MB: usize = 1024 * 1024;

impl IncrementalMarker {
    /// Begin a cycle. Enters `Sweeping` if the previous cycle's sweeper is
    /// still running, otherwise goes straight to `Marking`.
    pub fn start(&self, reason: GcReason) -> GcResult<()> {
        if !self.config().incremental_marking {
            return Err(GcError::Disabled);
        }
        if !self.is_stopped() {
            return Err(GcError::InvalidState(self.state()));
        }
        if self.heap().gc_state() != crate::heap::GcState::NotInGc {
            return Err(GcError::GcInProgress);
        }
        if !self.heap().deserialization_complete() {
            return Err(GcError::DeserializationIncomplete);
        }
        if self.heap().serializer_enabled() {
            return Err(GcError::SerializerActive);
        }

        if self.config().trace_incremental_marking {
            let old_generation_mb = self.heap().promoted_space_size() / MB;
            let limit_mb = self.heap().old_generation_allocation_limit() / MB;
            info!(
                "[marker] start ({}): old generation {}MB, limit {}MB, slack {}MB",
                reason.as_str(),
                old_generation_mb,
                limit_mb,
                limit_mb.saturating_sub(old_generation_mb)
            );
        }

        self.record_start_time();
        self.pacer.lock().start_cycle(
            self.heap().promoted_space_size(),
            self.heap().old_generation_allocation_counter(),
        );
        self.reset_schedule_credit();
        self.set_should_hurry(false);
        self.set_was_activated(true);

        if !self.compactor().sweeping_in_progress() {
            self.start_marking();
        } else {
            if self.config().trace_incremental_marking {
                info!("[marker] start sweeping");
            }
            self.set_state(MarkingState::Sweeping);
        }

        let observer: Arc<dyn AllocationObserver> =
            Arc::new(MarkingObserver::new(self.self_weak.clone()));
        self.heap().add_allocation_observer_everywhere(&observer);
        *self.observer.lock() = Some(observer);
        Ok(())
    }

    /// Switch the barrier on, grey the roots, and enter `Marking`.
    pub(crate) fn start_marking(&self) {
        if self.heap().serializer_enabled() {
            // Black allocation cannot start while deserializing; delay the
            // whole cycle instead.
            if self.config().trace_incremental_marking {
                info!("[marker] start delayed - serializer");
            }
            return;
        }
        if self.config().trace_incremental_marking {
            info!("[marker] start marking");
        }

        let compacting = !self.config().never_compact && self.compactor().start_compaction();
        self.set_is_compacting(compacting);
        self.set_state(MarkingState::Marking);

        self.embedder().trace_prologue();

        let mode = if compacting {
            BarrierMode::IncrementalCompaction
        } else {
            BarrierMode::Incremental
        };
        self.barrier().set_mode(mode);
        self.activate_incremental_write_barrier();

        if self.config().verify_heap {
            self.verify_mark_bits_clean();
        }

        if self.config().concurrent_marking
            && self.config().black_allocation
            && !self.black_allocator().is_active()
        {
            self.black_allocator()
                .activate(self.config().trace_incremental_marking);
        }

        self.mark_roots();

        if self.config().concurrent_marking {
            self.concurrent().schedule_tasks(&self.self_arc());
        }

        if self.config().trace_incremental_marking {
            info!("[marker] running");
        }
    }

    /// Mark every strong root's target grey and push it. Re-run during
    /// finalization to pick up root-set changes since the cycle began.
    pub(crate) fn mark_roots(&self) {
        debug_assert!(!self.finalize_marking_completed());
        debug_assert!(self.is_marking());
        self.heap().iterate_strong_roots(|root| {
            self.white_to_grey_and_push(root);
        });
    }

    /// Drain the previous cycle's sweeper, then start marking.
    pub(crate) fn finalize_sweeping(&self) {
        debug_assert!(self.state() == MarkingState::Sweeping);
        if self.compactor().sweeping_in_progress()
            && (!self.config().concurrent_sweeping || !self.compactor().sweeper_tasks_running())
        {
            self.compactor().ensure_sweeping_completed();
        }
        if !self.compactor().sweeping_in_progress() {
            self.start_marking();
        }
    }

    /// The mutator's answer to a finalization request: re-mark roots, run
    /// map retention once, and measure whether another round is worthwhile.
    pub fn finalize_incrementally(&self) {
        debug_assert!(!self.finalize_marking_completed());
        debug_assert!(self.is_marking());

        let round_start = self.now_ms();

        // Rescan roots to catch changes to the root set made since marking
        // started, then age and retain maps (once; retention is about
        // performance, not correctness).
        self.mark_roots();
        if self.finalization_rounds.load(Ordering::Relaxed) == 0 {
            self.retain_maps();
        }

        let marking_progress =
            self.worklist().len() + self.embedder().cached_wrappers_to_trace();

        let delta = self.now_ms() - round_start;
        let rounds = self.finalization_rounds.fetch_add(1, Ordering::Relaxed);
        if self.config().trace_incremental_marking {
            info!(
                "[marker] finalize incrementally round {}, spent {} ms, marking progress {}",
                rounds, delta as usize, marking_progress
            );
        }

        if rounds + 1 >= self.config().max_incremental_marking_finalization_rounds
            || marking_progress
                < self.config().min_progress_during_incremental_marking_finalization
        {
            self.finalize_marking_completed.store(true, Ordering::Release);
        }

        if self.config().black_allocation
            && !self.heap().should_reduce_memory()
            && !self.black_allocator().is_active()
        {
            self.black_allocator()
                .activate(self.config().trace_incremental_marking);
        }
    }

    /// First completion: ask the mutator to finalize incrementally.
    pub(crate) fn finalize_marking(&self, action: CompletionAction) {
        debug_assert!(!self.finalize_marking_completed());
        if self.config().trace_incremental_marking {
            info!("[marker] requesting finalization of incremental marking");
        }
        self.set_request_type(RequestType::Finalization);
        if action == CompletionAction::GcViaStackGuard {
            self.heap().stack_guard().request_gc();
        }
    }

    /// Second completion: marking is done; the full collection should run as
    /// soon as the mutator reaches a stack check.
    pub(crate) fn marking_complete(&self, action: CompletionAction) {
        self.set_state(MarkingState::Complete);
        // Anything allocated between now and the pause can only add a little
        // work; should_hurry tells the next GC entry not to stay incremental.
        self.set_should_hurry(true);
        if self.config().trace_incremental_marking {
            info!("[marker] complete (normal)");
        }
        self.set_request_type(RequestType::CompleteMarking);
        if action == CompletionAction::GcViaStackGuard {
            self.heap().stack_guard().request_gc();
        }
    }

    /// Drain the work-list to exhaustion and blacken the normalized-map
    /// caches of every native context.
    pub fn hurry(&self) {
        // A scavenge may have repopulated the work-list (black allocation)
        // even in Complete state.
        if !self.worklist().is_empty() {
            let start = self.now_ms();
            if self.config().trace_incremental_marking {
                info!("[marker] hurry");
            }
            self.process_marking_worklist(0, ForceCompletionAction::ForceCompletion);
            self.set_state(MarkingState::Complete);
            if self.config().trace_incremental_marking {
                let delta = self.now_ms() - start;
                info!("[marker] complete (hurry), spent {} ms", delta as usize);
            }
        }

        for context in self.heap().native_contexts() {
            let view = HeapObject::new(context);
            if let Some(cache) = view.element(NATIVE_CONTEXT_CACHE_SLOT) {
                let page = self.heap().page_of_object(cache);
                if page.is_grey(cache.to_address()) {
                    page.grey_to_black(cache.to_address());
                }
            }
        }
    }

    /// Tear the cycle down. Idempotent.
    pub fn stop(&self) {
        if self.is_stopped() {
            return;
        }
        if self.config().trace_incremental_marking {
            let old_generation_mb = self.heap().promoted_space_size() / MB;
            let limit_mb = self.heap().old_generation_allocation_limit() / MB;
            info!(
                "[marker] stopping: old generation {}MB, limit {}MB, overshoot {}MB",
                old_generation_mb,
                limit_mb,
                old_generation_mb.saturating_sub(limit_mb)
            );
        }

        if let Some(observer) = self.observer.lock().take() {
            self.heap().remove_allocation_observer_everywhere(&observer);
        }

        self.set_should_hurry(false);
        if self.is_marking() {
            self.barrier().set_mode(BarrierMode::StoreBufferOnly);
            self.deactivate_incremental_write_barrier();
        }
        self.heap().stack_guard().clear_gc();
        self.set_state(MarkingState::Stopped);
        self.set_request_type(RequestType::None);
        self.set_is_compacting(false);
        self.worklist().clear();
        self.black_allocator()
            .deactivate(self.config().trace_incremental_marking);
    }

    /// Synchronously finish the cycle: drain, then stop.
    pub fn finalize(&self) {
        self.hurry();
        self.stop();
    }

    /// Reset the per-cycle flags after the full GC consumed our output.
    pub fn epilogue(&self) {
        self.set_was_activated(false);
        self.finalize_marking_completed.store(false, Ordering::Release);
        self.finalization_rounds.store(0, Ordering::Relaxed);
        self.clear_idle_marking_delay_counter();
    }

    /// Abort the cycle without consuming its output.
    pub fn abort(&self) {
        self.stop();
        self.black_allocator()
            .abort(self.config().trace_incremental_marking);
    }

    pub fn black_allocation(&self) -> bool {
        self.black_allocator().is_active()
    }

    /// The scavenger moves allocation areas around; black allocation is
    /// suspended across the copy and re-enabled afterwards.
    pub fn pause_black_allocation(&self) {
        debug_assert!(self.is_marking());
        self.black_allocator()
            .pause(self.config().trace_incremental_marking);
    }

    pub fn resume_black_allocation(&self) {
        debug_assert!(self.is_marking());
        if self.config().black_allocation {
            self.black_allocator()
                .activate(self.config().trace_incremental_marking);
        }
    }

    /// The barrier noticed activity while the marker thought it was done;
    /// fall back into `Marking` so the new grey gets drained.
    pub(crate) fn restart_if_not_marking(&self) {
        let state = self.state();
        if matches!(state, MarkingState::Complete | MarkingState::Sweeping) {
            self.set_state(MarkingState::Marking);
            debug!("[marker] restarting marking from {state:?}");
        }
    }

    // Page-flag activation. Only runs while the mutator is quiesced in
    // start_marking/stop, which is what makes toggling the barrier mode and
    // the flags appear atomic to the fast path.

    fn activate_incremental_write_barrier(&self) {
        let marking_flags = PageFlags::POINTERS_TO_HERE_ARE_INTERESTING
            | PageFlags::POINTERS_FROM_HERE_ARE_INTERESTING;
        for space in self.heap().paged_old_spaces() {
            for page in space.pages() {
                page.set_flag(marking_flags);
            }
            space.set_new_page_flags(marking_flags);
        }
        for page in self.heap().large_space().pages() {
            page.set_flag(marking_flags);
        }
        self.heap().large_space().set_new_page_flags(marking_flags);
        for page in self.heap().new_space().pages() {
            page.set_flag(PageFlags::POINTERS_FROM_HERE_ARE_INTERESTING);
        }
    }

    fn deactivate_incremental_write_barrier(&self) {
        // Old-generation pages keep watching outgoing stores for the
        // generational barrier; only the incoming-pointer flag drops.
        for space in self.heap().paged_old_spaces() {
            for page in space.pages() {
                page.clear_flag(PageFlags::POINTERS_TO_HERE_ARE_INTERESTING);
            }
            space.set_new_page_flags(PageFlags::POINTERS_FROM_HERE_ARE_INTERESTING);
        }
        for page in self.heap().large_space().pages() {
            page.clear_flag(PageFlags::POINTERS_TO_HERE_ARE_INTERESTING);
        }
        self.heap()
            .large_space()
            .set_new_page_flags(PageFlags::POINTERS_FROM_HERE_ARE_INTERESTING);
        for page in self.heap().new_space().pages() {
            page.clear_flag(PageFlags::POINTERS_FROM_HERE_ARE_INTERESTING);
        }
    }

    fn verify_mark_bits_clean(&self) {
        self.heap().for_each_page(|page| {
            assert!(
                page.are_marks_clean(),
                "mark bits not clean on page {:?} at marking start",
                page.base()
            );
        });
    }
}
