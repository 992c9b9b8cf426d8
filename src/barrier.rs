//! Write-barrier mode selection and the fast-path filter.
//!
//! A runtime that compiles its barriers patches the record-write stubs when
//! marking starts and stops. Without runtime code patching, the mode lives in
//! one atomic byte read at the barrier entry; the extra load is the only
//! observable difference, and the mode still only changes while the mutator
//! is quiesced inside `start_marking` / `stop`.

use std::sync::atomic::{AtomicU8, Ordering};

use crate::heap::Heap;
use crate::page::PageFlags;
use crate::types::ObjectRef;

/// The three modes the record-write stubs are patched between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BarrierMode {
    /// Marking off: only the generational store buffer is maintained.
    StoreBufferOnly = 0,
    /// Marking on, not compacting.
    Incremental = 1,
    /// Marking on and the cycle will compact: slots are recorded too.
    IncrementalCompaction = 2,
}

impl BarrierMode {
    fn from_u8(raw: u8) -> BarrierMode {
        match raw {
            0 => BarrierMode::StoreBufferOnly,
            1 => BarrierMode::Incremental,
            2 => BarrierMode::IncrementalCompaction,
            _ => unreachable!("invalid barrier mode {raw}"),
        }
    }
}

/// The mutator-facing barrier state: the current mode and the page-flag fast
/// path.
pub struct WriteBarrier {
    mode: AtomicU8,
}

impl WriteBarrier {
    pub fn new() -> WriteBarrier {
        WriteBarrier {
            mode: AtomicU8::new(BarrierMode::StoreBufferOnly as u8),
        }
    }

    pub fn mode(&self) -> BarrierMode {
        BarrierMode::from_u8(self.mode.load(Ordering::Acquire))
    }

    /// "Patch the stubs": flip every barrier entry to `mode`.
    pub fn set_mode(&self, mode: BarrierMode) {
        self.mode.store(mode as u8, Ordering::Release);
    }

    /// The fast path taken on every pointer store. A store is interesting
    /// only if pointers *from* the host's page and pointers *to* the value's
    /// page are both flagged.
    pub fn store_needs_slow_path(&self, heap: &Heap, host: ObjectRef, value: ObjectRef) -> bool {
        if self.mode() == BarrierMode::StoreBufferOnly {
            return false;
        }
        let host_page = heap.page_of_object(host);
        if !host_page.is_flag_set(PageFlags::POINTERS_FROM_HERE_ARE_INTERESTING) {
            return false;
        }
        let value_page = heap.page_of_object(value);
        value_page.is_flag_set(PageFlags::POINTERS_TO_HERE_ARE_INTERESTING)
    }
}

impl Default for WriteBarrier {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::Heap;

    #[test]
    fn mode_round_trips() {
        let barrier = WriteBarrier::new();
        assert_eq!(barrier.mode(), BarrierMode::StoreBufferOnly);
        barrier.set_mode(BarrierMode::IncrementalCompaction);
        assert_eq!(barrier.mode(), BarrierMode::IncrementalCompaction);
        barrier.set_mode(BarrierMode::StoreBufferOnly);
        assert_eq!(barrier.mode(), BarrierMode::StoreBufferOnly);
    }

    #[test]
    fn fast_path_filters_on_page_flags() {
        let heap = Heap::new();
        let map = heap.new_plain_map(1);
        let host = heap.allocate_plain(map);
        let value = heap.allocate_plain(map);
        let barrier = WriteBarrier::new();

        // Mode off: never interesting, regardless of flags.
        heap.page_of_object(host)
            .set_flag(PageFlags::POINTERS_FROM_HERE_ARE_INTERESTING);
        heap.page_of_object(value)
            .set_flag(PageFlags::POINTERS_TO_HERE_ARE_INTERESTING);
        assert!(!barrier.store_needs_slow_path(&heap, host, value));

        barrier.set_mode(BarrierMode::Incremental);
        assert!(barrier.store_needs_slow_path(&heap, host, value));

        heap.page_of_object(host)
            .clear_flag(PageFlags::POINTERS_FROM_HERE_ARE_INTERESTING);
        assert!(!barrier.store_needs_slow_path(&heap, host, value));
    }
}
