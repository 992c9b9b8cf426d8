//! Seams to the external collaborators: the compacting collector/sweeper and
//! the embedder's wrapper tracer.
//!
//! The marker only ever talks to these traits. Production wires in the real
//! collector; tests use the recording and null implementations from
//! [`mocks`].

pub mod mocks;

use crate::types::{Address, ObjectRef};

/// The stop-the-world mark-compact collector and its sweeper, as seen from
/// the marker.
///
/// Guarantees required from implementations: `record_slot` /
/// `record_reloc_slot` must be callable from any marking thread, and
/// `ensure_sweeping_completed` must leave `sweeping_in_progress() == false`.
pub trait Compactor: Send + Sync {
    /// Decide whether this cycle will compact. Called once from
    /// `start_marking`; the answer is latched into the barrier mode.
    fn start_compaction(&self) -> bool;

    /// Whether sweeping from the previous cycle is still running.
    fn sweeping_in_progress(&self) -> bool;

    /// Whether sweeper tasks are actively executing right now.
    fn sweeper_tasks_running(&self) -> bool;

    /// Synchronously drain the sweeper.
    fn ensure_sweeping_completed(&self);

    /// Remember `host.slot = value` for pointer fix-up after evacuation.
    fn record_slot(&self, host: ObjectRef, slot: Address, value: ObjectRef);

    /// Remember a slot embedded in a code object's relocation info.
    fn record_reloc_slot(&self, host: ObjectRef, reloc: Address, value: ObjectRef);
}

/// The embedder's tracer for wrapper objects that reference foreign heaps.
pub trait EmbedderTracer: Send + Sync {
    /// Whether an embedder tracer is attached at all.
    fn in_use(&self) -> bool;

    /// Called once when marking starts.
    fn trace_prologue(&self);

    /// Trace cached wrappers until `deadline_ms` (monotonic milliseconds).
    fn trace(&self, deadline_ms: f64);

    /// Whether the embedder is ready for marking to finalize.
    fn should_finalize_incremental_marking(&self) -> bool;

    /// Hand all wrappers found by the marker over to the remote tracer.
    /// Called after every work-list drain, before control returns to the
    /// mutator.
    fn register_wrappers_with_remote_tracer(&self);

    /// Number of wrappers the embedder still has queued.
    fn cached_wrappers_to_trace(&self) -> usize;

    /// The marker's work-list ran dry but the embedder is not ready to
    /// finalize; the embedder should produce more work.
    fn notify_marking_worklist_empty(&self);
}
