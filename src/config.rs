//! Tunable knobs for the incremental marker.

/// Configuration for the incremental marking core.
///
/// Every field corresponds to a runtime flag of the collector. The defaults
/// are the shipping configuration; tests and embedders override individual
/// fields.
///
/// # Examples
///
/// ```
/// use greymark::config::MarkingConfig;
///
/// let config = MarkingConfig {
///     concurrent_marking: true,
///     ..MarkingConfig::default()
/// };
/// assert!(config.incremental_marking);
/// assert_eq!(config.retain_maps_for_n_gc, 2);
/// ```
#[derive(Debug, Clone)]
pub struct MarkingConfig {
    /// Master switch; with this off the marker refuses to start.
    pub incremental_marking: bool,
    /// Run the scanning loop on background worker tasks as well.
    pub concurrent_marking: bool,
    /// Whether the external sweeper runs its tasks off-thread.
    pub concurrent_sweeping: bool,
    /// Interleave embedder wrapper tracing with marking steps.
    pub incremental_marking_wrappers: bool,
    /// Color freshly allocated old-generation objects black while marking.
    pub black_allocation: bool,
    /// Never ask the compactor to start a compacting cycle.
    pub never_compact: bool,
    /// How many GC cycles an unused map survives before it may be dropped.
    pub retain_maps_for_n_gc: usize,
    /// Upper bound on incremental finalization rounds before giving up.
    pub max_incremental_marking_finalization_rounds: usize,
    /// Residual work below which finalization stops iterating.
    pub min_progress_during_incremental_marking_finalization: usize,
    /// Emit cycle progress through the `log` facade at info level.
    pub trace_incremental_marking: bool,
    /// Run the (external) heap verifier at phase boundaries.
    pub verify_heap: bool,
    /// Scan oversized arrays in chunks driven by a per-page progress bar.
    pub use_marking_progress_bar: bool,
    /// Worker count for the concurrent marking pool.
    pub parallel_workers: usize,
    /// Capacity of the main work-list channel.
    pub worklist_capacity: usize,
}

impl Default for MarkingConfig {
    fn default() -> Self {
        Self {
            incremental_marking: true,
            concurrent_marking: false,
            concurrent_sweeping: true,
            incremental_marking_wrappers: true,
            black_allocation: true,
            never_compact: false,
            retain_maps_for_n_gc: 2,
            max_incremental_marking_finalization_rounds: 3,
            min_progress_during_incremental_marking_finalization: 32,
            trace_incremental_marking: false,
            verify_heap: false,
            use_marking_progress_bar: true,
            parallel_workers: num_cpus::get(),
            worklist_capacity: 16 * 1024,
        }
    }
}

/// Why a marking cycle was started. Only used for tracing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcReason {
    Unknown,
    AllocationLimit,
    IdleTask,
    Testing,
    ExternalMemoryPressure,
    FinalizeMarkingViaStackGuard,
}

impl GcReason {
    pub fn as_str(self) -> &'static str {
        match self {
            GcReason::Unknown => "unknown",
            GcReason::AllocationLimit => "allocation limit",
            GcReason::IdleTask => "idle task",
            GcReason::Testing => "testing",
            GcReason::ExternalMemoryPressure => "external memory pressure",
            GcReason::FinalizeMarkingViaStackGuard => "finalize marking via stack guard",
        }
    }
}
