//! Pacing: converts allocation pressure and elapsed time into the byte
//! budget of each marking step.
//!
//! Three signals combine. The *keep-up* term pays for bytes the mutator
//! allocated since the last step. The *progress* term is a steady budget
//! sized so marking finishes in about `TARGET_STEP_COUNT` steps before the
//! old-generation limit, with a much more aggressive divisor near OOM and a
//! ramp-up window that leaves early work to standalone tasks. The *credit*
//! term (owned by the marker, not this struct) lets bytes marked by
//! concurrent tasks substitute for synchronous scanning.

pub use crate::space::ALLOCATION_OBSERVER_THRESHOLD as ALLOCATED_THRESHOLD;

/// Nominal length of an idle-time marking step.
pub const STEP_SIZE_MS: f64 = 50.0;
/// Cap applied to allocation-triggered steps, to smooth the burst right
/// after a scavenge.
pub const MAX_STEP_SIZE_MS: f64 = 5.0;
/// Extra old-generation headroom assumed before declaring near-OOM.
pub const OOM_SLACK_BYTES: usize = 64 * 1024 * 1024;

const TARGET_STEP_COUNT: usize = 128;
const TARGET_STEP_COUNT_AT_OOM: usize = 16;
const RAMP_UP_INTERVAL_MS: f64 = 300.0;
/// Assumed marking speed before the first measurement, in bytes per ms.
const INITIAL_CONSERVATIVE_MARKING_SPEED: f64 = 64.0 * 1024.0;

/// Estimate how many bytes fit into `step_ms` at the measured `speed`
/// (bytes per millisecond). Falls back to a conservative initial speed until
/// real samples exist.
pub fn estimate_step_size(step_ms: f64, speed: f64) -> usize {
    let speed = if speed > 0.0 {
        speed
    } else {
        INITIAL_CONSERVATIVE_MARKING_SPEED
    };
    (speed * step_ms) as usize
}

/// Mutator-only pacing state for one marking cycle.
#[derive(Debug, Default)]
pub struct Pacer {
    initial_old_generation_size: usize,
    old_generation_allocation_counter: usize,
    bytes_allocated: usize,
    bytes_processed: usize,
    marking_time_ms: f64,
}

impl Pacer {
    pub fn new() -> Pacer {
        Pacer::default()
    }

    /// Reset for a fresh cycle.
    pub fn start_cycle(&mut self, initial_old_generation_size: usize, allocation_counter: usize) {
        self.initial_old_generation_size = initial_old_generation_size;
        self.old_generation_allocation_counter = allocation_counter;
        self.bytes_allocated = 0;
        self.bytes_processed = 0;
        self.marking_time_ms = 0.0;
    }

    /// Fold newly allocated bytes into the outstanding debt and return it.
    pub fn step_size_to_keep_up(&mut self, current_allocation_counter: usize) -> usize {
        self.bytes_allocated += current_allocation_counter
            .saturating_sub(self.old_generation_allocation_counter);
        self.old_generation_allocation_counter = current_allocation_counter;
        self.bytes_allocated
    }

    /// The steady budget. `close_to_oom` switches to the aggressive divisor;
    /// the ramp-up factor grows linearly over the first 300 ms of the cycle.
    pub fn step_size_to_make_progress(
        &self,
        ms_since_start: f64,
        promoted_size: usize,
        close_to_oom: bool,
    ) -> usize {
        if close_to_oom {
            return promoted_size / TARGET_STEP_COUNT_AT_OOM;
        }
        let step = (self.initial_old_generation_size / TARGET_STEP_COUNT).max(ALLOCATED_THRESHOLD);
        let factor = (ms_since_start / RAMP_UP_INTERVAL_MS).min(1.0);
        (factor * step as f64) as usize
    }

    /// Record a completed scanning slice for the speed estimate.
    pub fn record_step(&mut self, bytes_processed: usize, duration_ms: f64) {
        self.bytes_processed += bytes_processed;
        self.marking_time_ms += duration_ms;
    }

    /// Measured marking speed in bytes per ms; zero before any sample.
    pub fn marking_speed(&self) -> f64 {
        if self.marking_time_ms > 0.0 {
            self.bytes_processed as f64 / self.marking_time_ms
        } else {
            0.0
        }
    }

    /// Pay down allocation debt with processed (or credited) bytes.
    pub fn charge_bytes_processed(&mut self, processed: usize) {
        self.bytes_allocated -= processed.min(self.bytes_allocated);
    }

    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated
    }

    pub fn bytes_processed(&self) -> usize {
        self.bytes_processed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keep_up_accumulates_allocation_deltas() {
        let mut pacer = Pacer::new();
        pacer.start_cycle(1024 * 1024, 1000);
        assert_eq!(pacer.step_size_to_keep_up(1000), 0);
        assert_eq!(pacer.step_size_to_keep_up(5000), 4000);
        assert_eq!(pacer.step_size_to_keep_up(6000), 5000);
        pacer.charge_bytes_processed(4500);
        assert_eq!(pacer.bytes_allocated(), 500);
        // Debt never goes negative.
        pacer.charge_bytes_processed(usize::MAX);
        assert_eq!(pacer.bytes_allocated(), 0);
    }

    #[test]
    fn progress_term_ramps_up_over_time() {
        let mut pacer = Pacer::new();
        let initial = 128 * ALLOCATED_THRESHOLD * 4;
        pacer.start_cycle(initial, 0);
        let full = pacer.step_size_to_make_progress(1000.0, initial, false);
        assert_eq!(full, initial / 128);
        let half = pacer.step_size_to_make_progress(150.0, initial, false);
        assert_eq!(half, full / 2);
        let zero = pacer.step_size_to_make_progress(0.0, initial, false);
        assert_eq!(zero, 0);
    }

    #[test]
    fn progress_term_floors_at_the_allocation_threshold() {
        let mut pacer = Pacer::new();
        pacer.start_cycle(1024, 0);
        let step = pacer.step_size_to_make_progress(1000.0, 1024, false);
        assert_eq!(step, ALLOCATED_THRESHOLD);
    }

    #[test]
    fn oom_divisor_overrides_the_baseline() {
        let mut pacer = Pacer::new();
        pacer.start_cycle(1024 * 1024, 0);
        let promoted = 64 * 1024 * 1024;
        let step = pacer.step_size_to_make_progress(10.0, promoted, true);
        assert_eq!(step, promoted / 16);
    }

    #[test]
    fn speed_estimate_has_a_conservative_floor() {
        assert_eq!(
            estimate_step_size(MAX_STEP_SIZE_MS, 0.0),
            (INITIAL_CONSERVATIVE_MARKING_SPEED * MAX_STEP_SIZE_MS) as usize
        );
        assert_eq!(estimate_step_size(2.0, 1000.0), 2000);

        let mut pacer = Pacer::new();
        pacer.start_cycle(0, 0);
        assert_eq!(pacer.marking_speed(), 0.0);
        pacer.record_step(10_000, 2.0);
        pacer.record_step(10_000, 2.0);
        assert_eq!(pacer.marking_speed(), 5_000.0);
    }
}
