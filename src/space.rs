//! Heap spaces: bump allocation, allocation observers, and the
//! black-allocation toggle consumed by the marker.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::page::{Page, PageFlags, PageRegistry, SpaceId, PAGE_SIZE};
use crate::types::{Address, ObjectRef, WORD_SIZE};

/// Stateful callback registered with a space. Fires after roughly
/// `ALLOCATION_OBSERVER_THRESHOLD` bytes of allocation with the accumulated
/// byte count, the address of the newest object, and its size.
pub trait AllocationObserver: Send + Sync {
    fn step(&self, bytes_allocated: usize, soon_object: Address, size: usize);
}

/// Observer batching granularity.
pub const ALLOCATION_OBSERVER_THRESHOLD: usize = 64 * 1024;

/// Allocation accounting shared by all space kinds: the monotonic byte
/// counter plus the observer list and its batching accumulator.
#[derive(Default)]
pub(crate) struct AllocationCounter {
    allocated: AtomicUsize,
    since_observer: AtomicUsize,
    observers: Mutex<Vec<Arc<dyn AllocationObserver>>>,
}

impl AllocationCounter {
    pub fn allocated_bytes(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }

    pub fn add_observer(&self, observer: Arc<dyn AllocationObserver>) {
        self.observers.lock().push(observer);
    }

    pub fn remove_observer(&self, observer: &Arc<dyn AllocationObserver>) {
        self.observers
            .lock()
            .retain(|existing| !Arc::ptr_eq(existing, observer));
    }

    /// Record an allocation and fire observers if the batch threshold was
    /// crossed. Called outside any allocation lock so observers may trigger
    /// marking steps.
    pub fn record(&self, addr: Address, size: usize) {
        self.allocated.fetch_add(size, Ordering::Relaxed);
        let since = self.since_observer.fetch_add(size, Ordering::Relaxed) + size;
        if since < ALLOCATION_OBSERVER_THRESHOLD {
            return;
        }
        self.since_observer.store(0, Ordering::Relaxed);
        let observers: Vec<_> = self.observers.lock().clone();
        for observer in observers {
            observer.step(since, addr, size);
        }
    }
}

struct BumpArea {
    page: Option<Arc<Page>>,
    top: Address,
    limit: Address,
}

/// A paged old-generation space (old, map, or code).
///
/// Allocation is a mutator-only bump pointer; pages are appended on demand.
/// The marker toggles `mark_allocation_info_black` so that objects born
/// during marking come out of the allocator already black.
pub struct Space {
    id: SpaceId,
    registry: Arc<PageRegistry>,
    pages: Mutex<Vec<Arc<Page>>>,
    bump: Mutex<BumpArea>,
    counter: AllocationCounter,
    allocating_black: AtomicBool,
    /// Flag template stamped onto pages created while the barrier is active.
    new_page_flags: AtomicU32,
}

impl Space {
    pub fn new(id: SpaceId, registry: Arc<PageRegistry>) -> Space {
        debug_assert!(id.is_old_generation() && id != SpaceId::Large);
        Space {
            id,
            registry,
            pages: Mutex::new(Vec::new()),
            bump: Mutex::new(BumpArea {
                page: None,
                top: Address::ZERO,
                limit: Address::ZERO,
            }),
            counter: AllocationCounter::default(),
            allocating_black: AtomicBool::new(false),
            // Old-generation pages always watch outgoing stores so the
            // generational barrier catches old-to-new pointers.
            new_page_flags: AtomicU32::new(PageFlags::POINTERS_FROM_HERE_ARE_INTERESTING.bits()),
        }
    }

    pub fn id(&self) -> SpaceId {
        self.id
    }

    pub fn pages(&self) -> Vec<Arc<Page>> {
        self.pages.lock().clone()
    }

    pub fn allocated_bytes(&self) -> usize {
        self.counter.allocated_bytes()
    }

    pub fn add_allocation_observer(&self, observer: Arc<dyn AllocationObserver>) {
        self.counter.add_observer(observer);
    }

    pub fn remove_allocation_observer(&self, observer: &Arc<dyn AllocationObserver>) {
        self.counter.remove_observer(observer);
    }

    /// Color everything allocated from now on black.
    pub fn mark_allocation_info_black(&self) {
        self.allocating_black.store(true, Ordering::Release);
    }

    pub fn unmark_allocation_info(&self) {
        self.allocating_black.store(false, Ordering::Release);
    }

    pub fn is_allocating_black(&self) -> bool {
        self.allocating_black.load(Ordering::Acquire)
    }

    /// Template flags applied to pages created while marking is active.
    pub fn set_new_page_flags(&self, flags: PageFlags) {
        self.new_page_flags.store(flags.bits(), Ordering::Release);
    }

    fn grow(&self) -> Arc<Page> {
        let page = Arc::new(Page::allocate(PAGE_SIZE, self.id));
        let template = PageFlags::from_bits_truncate(self.new_page_flags.load(Ordering::Acquire));
        if !template.is_empty() {
            page.set_flag(template);
        }
        self.registry.register(Arc::clone(&page));
        self.pages.lock().push(Arc::clone(&page));
        page
    }

    /// Bump-allocate `size` bytes (word aligned). Never fails short of OS
    /// exhaustion; paged spaces grow on demand.
    pub fn allocate_raw(&self, size: usize) -> Address {
        let size = round_up_to_word(size);
        assert!(size <= PAGE_SIZE, "oversized allocation belongs in large space");
        let (addr, page) = {
            let mut bump = self.bump.lock();
            if bump.page.is_none() || bump.top + size > bump.limit {
                let page = self.grow();
                bump.top = page.base();
                bump.limit = page.limit();
                bump.page = Some(page);
            }
            let addr = bump.top;
            bump.top = bump.top + size;
            (addr, Arc::clone(bump.page.as_ref().unwrap()))
        };
        if self.is_allocating_black() {
            page.white_to_black(addr);
        }
        self.counter.record(addr, size);
        addr
    }

    pub fn allocate(&self, size: usize) -> ObjectRef {
        ObjectRef::from_address(self.allocate_raw(size)).unwrap()
    }
}

/// The two-half semispace reclaimed by the external scavenger.
///
/// The marker only needs allocation, the from/to predicates (page flags), and
/// the capacity number feeding the pacer's near-OOM heuristic. Copying and
/// forwarding are the scavenger's business; `flip` models the semispace swap
/// so tests can stage post-scavenge states.
pub struct NewSpace {
    halves: [Arc<Page>; 2],
    active: AtomicUsize,
    top: Mutex<Address>,
    counter: AllocationCounter,
}

impl NewSpace {
    pub fn new(registry: &PageRegistry) -> NewSpace {
        let to = Arc::new(Page::allocate(PAGE_SIZE, SpaceId::New));
        let from = Arc::new(Page::allocate(PAGE_SIZE, SpaceId::New));
        to.set_flag(PageFlags::IN_TO_SPACE);
        from.set_flag(PageFlags::IN_FROM_SPACE);
        // Pointers into new space always interest the generational barrier.
        to.set_flag(PageFlags::POINTERS_TO_HERE_ARE_INTERESTING);
        from.set_flag(PageFlags::POINTERS_TO_HERE_ARE_INTERESTING);
        registry.register(Arc::clone(&to));
        registry.register(Arc::clone(&from));
        let top = to.base();
        NewSpace {
            halves: [to, from],
            active: AtomicUsize::new(0),
            top: Mutex::new(top),
            counter: AllocationCounter::default(),
        }
    }

    pub fn capacity(&self) -> usize {
        2 * PAGE_SIZE
    }

    pub fn allocated_bytes(&self) -> usize {
        self.counter.allocated_bytes()
    }

    pub fn to_space_page(&self) -> Arc<Page> {
        Arc::clone(&self.halves[self.active.load(Ordering::Acquire)])
    }

    pub fn from_space_page(&self) -> Arc<Page> {
        Arc::clone(&self.halves[1 - self.active.load(Ordering::Acquire)])
    }

    pub fn pages(&self) -> Vec<Arc<Page>> {
        vec![Arc::clone(&self.halves[0]), Arc::clone(&self.halves[1])]
    }

    pub fn add_allocation_observer(&self, observer: Arc<dyn AllocationObserver>) {
        self.counter.add_observer(observer);
    }

    pub fn remove_allocation_observer(&self, observer: &Arc<dyn AllocationObserver>) {
        self.counter.remove_observer(observer);
    }

    pub fn allocate_raw(&self, size: usize) -> Option<Address> {
        let size = round_up_to_word(size);
        let addr = {
            let mut top = self.top.lock();
            let page = self.to_space_page();
            if *top + size > page.limit() {
                return None;
            }
            let addr = *top;
            *top = *top + size;
            addr
        };
        self.counter.record(addr, size);
        Some(addr)
    }

    pub fn allocate(&self, size: usize) -> Option<ObjectRef> {
        self.allocate_raw(size).and_then(ObjectRef::from_address)
    }

    /// Swap the semispace halves, as the scavenger does at the start of a
    /// copy. Objects in the previously active half are now "in from space".
    pub fn flip(&self) {
        let old_active = self.active.load(Ordering::Acquire);
        let new_active = 1 - old_active;
        self.halves[old_active].clear_flag(PageFlags::IN_TO_SPACE);
        self.halves[old_active].set_flag(PageFlags::IN_FROM_SPACE);
        self.halves[new_active].clear_flag(PageFlags::IN_FROM_SPACE);
        self.halves[new_active].set_flag(PageFlags::IN_TO_SPACE);
        self.active.store(new_active, Ordering::Release);
        *self.top.lock() = self.halves[new_active].base();
    }
}

/// Large-object space: one aligned page per object.
pub struct LargeObjectSpace {
    registry: Arc<PageRegistry>,
    pages: Mutex<Vec<Arc<Page>>>,
    counter: AllocationCounter,
    new_page_flags: AtomicU32,
}

impl LargeObjectSpace {
    pub fn new(registry: Arc<PageRegistry>) -> LargeObjectSpace {
        LargeObjectSpace {
            registry,
            pages: Mutex::new(Vec::new()),
            counter: AllocationCounter::default(),
            new_page_flags: AtomicU32::new(PageFlags::POINTERS_FROM_HERE_ARE_INTERESTING.bits()),
        }
    }

    pub fn pages(&self) -> Vec<Arc<Page>> {
        self.pages.lock().clone()
    }

    pub fn allocated_bytes(&self) -> usize {
        self.counter.allocated_bytes()
    }

    pub fn add_allocation_observer(&self, observer: Arc<dyn AllocationObserver>) {
        self.counter.add_observer(observer);
    }

    pub fn remove_allocation_observer(&self, observer: &Arc<dyn AllocationObserver>) {
        self.counter.remove_observer(observer);
    }

    pub fn set_new_page_flags(&self, flags: PageFlags) {
        self.new_page_flags.store(flags.bits(), Ordering::Release);
    }

    /// Allocate a dedicated page for one object of `size` bytes.
    pub fn allocate(&self, size: usize, with_progress_bar: bool) -> ObjectRef {
        let page_bytes = round_up_to_word(size).div_ceil(PAGE_SIZE) * PAGE_SIZE;
        let page = Arc::new(Page::allocate(page_bytes, SpaceId::Large));
        page.set_flag(PageFlags::LARGE_PAGE);
        if with_progress_bar {
            page.set_flag(PageFlags::HAS_PROGRESS_BAR);
        }
        let template = PageFlags::from_bits_truncate(self.new_page_flags.load(Ordering::Acquire));
        if !template.is_empty() {
            page.set_flag(template);
        }
        self.registry.register(Arc::clone(&page));
        self.pages.lock().push(Arc::clone(&page));
        let addr = page.base();
        self.counter.record(addr, size);
        ObjectRef::from_address(addr).unwrap()
    }
}

#[inline]
fn round_up_to_word(size: usize) -> usize {
    (size + WORD_SIZE - 1) & !(WORD_SIZE - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CountingObserver {
        fired: AtomicUsize,
        bytes: AtomicUsize,
    }

    impl AllocationObserver for CountingObserver {
        fn step(&self, bytes_allocated: usize, _soon_object: Address, _size: usize) {
            self.fired.fetch_add(1, Ordering::Relaxed);
            self.bytes.fetch_add(bytes_allocated, Ordering::Relaxed);
        }
    }

    #[test]
    fn bump_allocation_is_word_aligned_and_monotonic() {
        let registry = Arc::new(PageRegistry::new());
        let space = Space::new(SpaceId::Old, Arc::clone(&registry));
        let a = space.allocate_raw(24);
        let b = space.allocate_raw(17);
        let c = space.allocate_raw(8);
        assert!(a.is_word_aligned() && b.is_word_aligned() && c.is_word_aligned());
        assert_eq!(b - a, 24);
        assert_eq!(c - b, 24); // 17 rounds up
        assert_eq!(space.allocated_bytes(), 24 + 24 + 8);
        assert!(registry.page_of(a).is_some());
    }

    #[test]
    fn observers_fire_on_threshold() {
        let registry = Arc::new(PageRegistry::new());
        let space = Space::new(SpaceId::Old, registry);
        let observer = Arc::new(CountingObserver {
            fired: AtomicUsize::new(0),
            bytes: AtomicUsize::new(0),
        });
        space.add_allocation_observer(observer.clone());

        for _ in 0..(ALLOCATION_OBSERVER_THRESHOLD / 1024) {
            space.allocate_raw(1024);
        }
        assert_eq!(observer.fired.load(Ordering::Relaxed), 1);
        assert!(observer.bytes.load(Ordering::Relaxed) >= ALLOCATION_OBSERVER_THRESHOLD);

        let handle: Arc<dyn AllocationObserver> = observer.clone();
        space.remove_allocation_observer(&handle);
        for _ in 0..(ALLOCATION_OBSERVER_THRESHOLD / 1024) {
            space.allocate_raw(1024);
        }
        assert_eq!(observer.fired.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn black_allocation_colors_fresh_objects() {
        let registry = Arc::new(PageRegistry::new());
        let space = Space::new(SpaceId::Old, Arc::clone(&registry));
        let white = space.allocate_raw(32);
        space.mark_allocation_info_black();
        let black = space.allocate_raw(32);
        space.unmark_allocation_info();
        let white_again = space.allocate_raw(32);

        let page = registry.page_of(white).unwrap();
        assert!(page.is_white(white));
        assert!(page.is_black(black));
        assert!(page.is_white(white_again));
    }

    #[test]
    fn new_space_flip_swaps_halves() {
        let registry = Arc::new(PageRegistry::new());
        let new_space = NewSpace::new(&registry);
        let obj = new_space.allocate_raw(64).unwrap();
        let page = registry.page_of(obj).unwrap();
        assert!(page.is_flag_set(PageFlags::IN_TO_SPACE));

        new_space.flip();
        assert!(page.is_flag_set(PageFlags::IN_FROM_SPACE));
        assert!(!page.is_flag_set(PageFlags::IN_TO_SPACE));
        // Allocation continues in the other half.
        let after = new_space.allocate_raw(64).unwrap();
        assert!(registry
            .page_of(after)
            .unwrap()
            .is_flag_set(PageFlags::IN_TO_SPACE));
    }

    #[test]
    fn large_space_registers_every_slot() {
        let registry = Arc::new(PageRegistry::new());
        let lo = LargeObjectSpace::new(Arc::clone(&registry));
        let obj = lo.allocate(3 * PAGE_SIZE + 128, true);
        let page = registry.page_of(obj.to_address()).unwrap();
        assert!(page.is_flag_set(PageFlags::LARGE_PAGE));
        assert!(page.is_flag_set(PageFlags::HAS_PROGRESS_BAR));
        // An interior address far past the first aligned slot still resolves.
        let interior = obj.to_address() + 3 * PAGE_SIZE;
        assert!(registry.page_of(interior).is_some());
        assert!(Arc::ptr_eq(&registry.page_of(interior).unwrap(), &page));
    }
}
