//! Black allocation: objects born during marking come out of the allocator
//! already black, so the marker never has to visit them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::info;

use crate::heap::Heap;

/// Toggles the black-allocation mode of the old-generation spaces.
///
/// # Examples
///
/// ```
/// use greymark::black_allocation::BlackAllocator;
/// use greymark::heap::Heap;
///
/// let heap = Heap::new();
/// let allocator = BlackAllocator::new(&heap);
/// assert!(!allocator.is_active());
///
/// allocator.activate(false);
/// let map = heap.new_plain_map(1);
/// let obj = heap.allocate_plain(map);
/// assert!(heap.is_black(obj));
///
/// allocator.deactivate(false);
/// assert!(heap.is_white(heap.allocate_plain(map)));
/// ```
pub struct BlackAllocator {
    heap: Arc<Heap>,
    active: AtomicBool,
}

impl BlackAllocator {
    pub fn new(heap: &Arc<Heap>) -> BlackAllocator {
        BlackAllocator {
            heap: Arc::clone(heap),
            active: AtomicBool::new(false),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn activate(&self, trace: bool) {
        for space in self.heap.paged_old_spaces() {
            space.mark_allocation_info_black();
        }
        self.active.store(true, Ordering::Release);
        if trace {
            info!("[marker] black allocation started");
        }
    }

    /// Turn the mode off across a scavenge; the scavenger moves allocation
    /// areas around and must not inherit stale black ranges.
    pub fn pause(&self, trace: bool) {
        for space in self.heap.paged_old_spaces() {
            space.unmark_allocation_info();
        }
        self.active.store(false, Ordering::Release);
        if trace {
            info!("[marker] black allocation paused");
        }
    }

    pub fn deactivate(&self, trace: bool) {
        if self.is_active() {
            self.pause(false);
            if trace {
                info!("[marker] black allocation finished");
            }
        }
    }

    pub fn abort(&self, trace: bool) {
        self.deactivate(false);
        if trace {
            info!("[marker] black allocation aborted");
        }
    }
}
