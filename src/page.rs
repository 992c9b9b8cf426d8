//! Fixed-size heap pages: backing memory, flag word, mark bitmap, progress
//! bar.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use bitflags::bitflags;

use crate::bitmap::{Color, MarkBitmap};
use crate::types::{Address, WORD_SIZE};

/// Pages are aligned to their size so the owning page of any address is a
/// single mask away.
pub const PAGE_SIZE: usize = 256 * 1024;

/// Objects larger than this go to the large-object space on a dedicated page.
pub const MAX_REGULAR_OBJECT_SIZE: usize = PAGE_SIZE / 2;

bitflags! {
    /// Per-page flag word. The two "interesting" flags drive the write
    /// barrier fast path; the rest support scavenge reconciliation and the
    /// large-array progress bar.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u32 {
        /// Stores of pointers *to* objects on this page are interesting.
        const POINTERS_TO_HERE_ARE_INTERESTING = 1 << 0;
        /// Stores of pointers *from* objects on this page are interesting.
        const POINTERS_FROM_HERE_ARE_INTERESTING = 1 << 1;
        /// Oversized array page scanned in chunks via the progress bar.
        const HAS_PROGRESS_BAR = 1 << 2;
        /// Page moved during scavenge; its mark state must be consulted when
        /// reconciling the work-list.
        const SWEEP_TO_ITERATE = 1 << 3;
        /// Semispace half currently being evacuated.
        const IN_FROM_SPACE = 1 << 4;
        /// Semispace half receiving allocations.
        const IN_TO_SPACE = 1 << 5;
        /// Dedicated large-object page (may span multiple aligned slots).
        const LARGE_PAGE = 1 << 6;
    }
}

/// Identity of the space a page belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SpaceId {
    New,
    Old,
    Map,
    Code,
    Large,
}

impl SpaceId {
    /// New-space objects are reclaimed by the scavenger, everything else by
    /// the mark phase this crate implements.
    pub fn is_old_generation(self) -> bool {
        !matches!(self, SpaceId::New)
    }
}

/// A fixed-size region of heap memory together with its marking metadata.
///
/// The page owns its backing allocation. Object memory is handed out by the
/// space's bump allocator; the marker only reads object words and mutates the
/// bitmap, flags, and progress bar.
pub struct Page {
    base: *mut u8,
    size: usize,
    space: SpaceId,
    flags: AtomicU32,
    /// Byte offset of the scan frontier for oversized arrays. Zero when no
    /// scan is in progress.
    progress_bar: AtomicUsize,
    bitmap: MarkBitmap,
    layout: Layout,
}

// The raw base pointer is only dereferenced through word-aligned atomic
// accesses; the page itself is shared behind Arc.
unsafe impl Send for Page {}
unsafe impl Sync for Page {}

impl Page {
    /// Allocate a page of `size` bytes (a multiple of `PAGE_SIZE`), aligned
    /// to `PAGE_SIZE` and zero-filled.
    pub fn allocate(size: usize, space: SpaceId) -> Page {
        assert!(size % PAGE_SIZE == 0 && size > 0);
        let layout = Layout::from_size_align(size, PAGE_SIZE).unwrap();
        let base = unsafe { alloc_zeroed(layout) };
        assert!(!base.is_null(), "page allocation failed");
        Page {
            base,
            size,
            space,
            flags: AtomicU32::new(0),
            progress_bar: AtomicUsize::new(0),
            bitmap: MarkBitmap::new(size / WORD_SIZE),
            layout,
        }
    }

    #[inline]
    pub fn base(&self) -> Address {
        Address::from_usize(self.base as usize)
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn space(&self) -> SpaceId {
        self.space
    }

    #[inline]
    pub fn limit(&self) -> Address {
        self.base() + self.size
    }

    #[inline]
    pub fn contains(&self, addr: Address) -> bool {
        addr >= self.base() && addr < self.limit()
    }

    // Flag word.

    pub fn set_flag(&self, flag: PageFlags) {
        self.flags.fetch_or(flag.bits(), Ordering::Release);
    }

    pub fn clear_flag(&self, flag: PageFlags) {
        self.flags.fetch_and(!flag.bits(), Ordering::Release);
    }

    pub fn is_flag_set(&self, flag: PageFlags) -> bool {
        self.flags.load(Ordering::Acquire) & flag.bits() != 0
    }

    // Progress bar.

    pub fn progress_bar(&self) -> usize {
        self.progress_bar.load(Ordering::Acquire)
    }

    pub fn set_progress_bar(&self, offset: usize) {
        self.progress_bar.store(offset, Ordering::Release);
    }

    pub fn reset_progress_bar(&self) {
        self.progress_bar.store(0, Ordering::Release);
    }

    // Mark bitmap, addressed by object start address.

    #[inline]
    fn word_index(&self, addr: Address) -> usize {
        debug_assert!(self.contains(addr), "{addr:?} outside page {:?}", self.base());
        debug_assert!(addr.is_word_aligned());
        (addr - self.base()) / WORD_SIZE
    }

    pub fn color(&self, addr: Address) -> Color {
        self.bitmap.color_checked(self.word_index(addr))
    }

    pub fn is_white(&self, addr: Address) -> bool {
        self.bitmap.is_white(self.word_index(addr))
    }

    pub fn is_grey(&self, addr: Address) -> bool {
        self.bitmap.is_grey(self.word_index(addr))
    }

    pub fn is_black(&self, addr: Address) -> bool {
        self.bitmap.is_black(self.word_index(addr))
    }

    pub fn white_to_grey(&self, addr: Address) -> bool {
        self.bitmap.white_to_grey(self.word_index(addr))
    }

    pub fn grey_to_black(&self, addr: Address) -> bool {
        self.bitmap.grey_to_black(self.word_index(addr))
    }

    pub fn white_to_black(&self, addr: Address) -> bool {
        self.bitmap.white_to_black(self.word_index(addr))
    }

    pub fn black_to_grey(&self, addr: Address) -> bool {
        self.bitmap.black_to_grey(self.word_index(addr))
    }

    pub fn set_first_mark_bit(&self, addr: Address) {
        self.bitmap.set_first_bit(self.word_index(addr));
    }

    pub fn set_second_mark_bit(&self, addr: Address) {
        self.bitmap.set_second_bit(self.word_index(addr));
    }

    pub fn second_mark_bit(&self, addr: Address) -> bool {
        self.bitmap.second_bit(self.word_index(addr))
    }

    pub fn clear_marks(&self) {
        self.bitmap.clear();
    }

    pub fn are_marks_clean(&self) -> bool {
        self.bitmap.is_clean()
    }

    // Object memory.

    /// Read a word of object memory.
    pub fn word_at(&self, addr: Address) -> usize {
        debug_assert!(self.contains(addr));
        unsafe { crate::types::atomic_word(addr).load(Ordering::Acquire) }
    }

    /// Write a word of object memory.
    pub fn set_word_at(&self, addr: Address, value: usize) {
        debug_assert!(self.contains(addr));
        unsafe { crate::types::atomic_word(addr).store(value, Ordering::Release) }
    }
}

impl Drop for Page {
    fn drop(&mut self) {
        unsafe { dealloc(self.base, self.layout) }
    }
}

/// Address-to-page lookup shared by every space.
///
/// Pages are size-aligned, so the owning slot of an address is
/// `addr & !(PAGE_SIZE - 1)`. Large pages cover several consecutive slots and
/// are registered under each of them.
#[derive(Default)]
pub struct PageRegistry {
    slots: dashmap::DashMap<usize, std::sync::Arc<Page>>,
}

impl PageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, page: std::sync::Arc<Page>) {
        let base = page.base().as_usize();
        for offset in (0..page.size()).step_by(PAGE_SIZE) {
            self.slots.insert(base + offset, std::sync::Arc::clone(&page));
        }
    }

    pub fn unregister(&self, page: &Page) {
        let base = page.base().as_usize();
        for offset in (0..page.size()).step_by(PAGE_SIZE) {
            self.slots.remove(&(base + offset));
        }
    }

    /// The page owning `addr`, if the address lies in the managed heap.
    pub fn page_of(&self, addr: Address) -> Option<std::sync::Arc<Page>> {
        self.slots
            .get(&addr.align_down(PAGE_SIZE).as_usize())
            .map(|entry| std::sync::Arc::clone(entry.value()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pages_are_size_aligned() {
        let page = Page::allocate(PAGE_SIZE, SpaceId::Old);
        assert!(page.base().is_aligned_to(PAGE_SIZE));
        assert_eq!(page.limit() - page.base(), PAGE_SIZE);
        let inner = page.base() + 4096;
        assert_eq!(inner.align_down(PAGE_SIZE), page.base());
    }

    #[test]
    fn flags_set_and_clear() {
        let page = Page::allocate(PAGE_SIZE, SpaceId::Old);
        assert!(!page.is_flag_set(PageFlags::POINTERS_TO_HERE_ARE_INTERESTING));
        page.set_flag(PageFlags::POINTERS_TO_HERE_ARE_INTERESTING);
        page.set_flag(PageFlags::POINTERS_FROM_HERE_ARE_INTERESTING);
        assert!(page.is_flag_set(PageFlags::POINTERS_TO_HERE_ARE_INTERESTING));
        page.clear_flag(PageFlags::POINTERS_FROM_HERE_ARE_INTERESTING);
        assert!(!page.is_flag_set(PageFlags::POINTERS_FROM_HERE_ARE_INTERESTING));
        assert!(page.is_flag_set(PageFlags::POINTERS_TO_HERE_ARE_INTERESTING));
    }

    #[test]
    fn colors_track_object_addresses() {
        let page = Page::allocate(PAGE_SIZE, SpaceId::Old);
        let a = page.base() + 64;
        let b = page.base() + 128;
        assert_eq!(page.color(a), Color::White);
        assert!(page.white_to_grey(a));
        assert!(page.white_to_black(b));
        assert_eq!(page.color(a), Color::Grey);
        assert_eq!(page.color(b), Color::Black);
        page.clear_marks();
        assert_eq!(page.color(a), Color::White);
        assert_eq!(page.color(b), Color::White);
    }

    #[test]
    fn memory_starts_zeroed_and_round_trips() {
        let page = Page::allocate(PAGE_SIZE, SpaceId::Old);
        let addr = page.base() + 512;
        assert_eq!(page.word_at(addr), 0);
        page.set_word_at(addr, 0xdead_beef);
        assert_eq!(page.word_at(addr), 0xdead_beef);
    }

    #[test]
    fn large_pages_span_multiple_slots() {
        let page = Page::allocate(4 * PAGE_SIZE, SpaceId::Large);
        page.set_flag(PageFlags::LARGE_PAGE);
        let far = page.base() + 3 * PAGE_SIZE + 64;
        assert!(page.contains(far));
        assert!(page.white_to_grey(far));
        assert_eq!(page.color(far), Color::Grey);
    }
}
