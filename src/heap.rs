//! The heap owner: spaces, well-known maps, roots, and the small pieces of
//! runtime state the marker's lifecycle guards consult.

use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::Mutex;

use crate::bitmap::Color;
use crate::object::{
    initialize_map, HeapObject, InstanceType, Map, MAP_SIZE_IN_WORDS,
};
use crate::page::{Page, PageFlags, PageRegistry, SpaceId};
use crate::retained_maps::RetainedMaps;
use crate::roots::GlobalRoots;
use crate::space::{AllocationObserver, LargeObjectSpace, NewSpace, Space};
use crate::types::{tag_scalar, Address, ObjectRef, WORD_SIZE};

/// What kind of collection the heap is currently inside, if any. The marker
/// only starts and steps while the heap is not in a GC pause.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum GcState {
    NotInGc = 0,
    Scavenge = 1,
    MarkCompact = 2,
}

impl GcState {
    fn from_u8(raw: u8) -> GcState {
        match raw {
            0 => GcState::NotInGc,
            1 => GcState::Scavenge,
            2 => GcState::MarkCompact,
            _ => unreachable!("invalid gc state {raw}"),
        }
    }
}

/// Interrupt line back to the mutator. The marker raises the GC bit when it
/// wants the runtime to come in through a stack check and finish the cycle.
#[derive(Default)]
pub struct StackGuard {
    gc_requested: AtomicBool,
}

impl StackGuard {
    pub fn request_gc(&self) {
        self.gc_requested.store(true, Ordering::Release);
    }

    pub fn clear_gc(&self) {
        self.gc_requested.store(false, Ordering::Release);
    }

    pub fn is_gc_requested(&self) -> bool {
        self.gc_requested.load(Ordering::Acquire)
    }
}

/// Maps every heap needs: the meta map plus one canonical map per
/// variable-size instance type and the two filler maps.
pub struct WellKnownMaps {
    pub meta_map: Map,
    pub array_map: Map,
    pub byte_data_map: Map,
    pub native_context_map: Map,
    pub code_map: Map,
    pub one_word_filler_map: Map,
    pub free_space_map: Map,
}

/// The managed heap. Owns pages, spaces, the root set, the retained-map
/// table, and the native-context list; the marker borrows all of it.
pub struct Heap {
    registry: Arc<PageRegistry>,
    new_space: NewSpace,
    old_space: Space,
    map_space: Space,
    code_space: Space,
    large_space: LargeObjectSpace,
    roots: ArcSwap<GlobalRoots>,
    retained_maps: Mutex<RetainedMaps>,
    native_contexts: Mutex<Vec<ObjectRef>>,
    stack_guard: StackGuard,
    well_known: WellKnownMaps,
    gc_state: AtomicU8,
    deserialization_complete: AtomicBool,
    serializer_enabled: AtomicBool,
    always_allocate_depth: AtomicUsize,
    old_generation_allocation_limit: AtomicUsize,
    should_reduce_memory: AtomicBool,
    abort_incremental_marking: AtomicBool,
}

const DEFAULT_OLD_GENERATION_LIMIT: usize = 256 * 1024 * 1024;

impl Heap {
    pub fn new() -> Arc<Heap> {
        let registry = Arc::new(PageRegistry::new());
        let new_space = NewSpace::new(&registry);
        let old_space = Space::new(SpaceId::Old, Arc::clone(&registry));
        let map_space = Space::new(SpaceId::Map, Arc::clone(&registry));
        let code_space = Space::new(SpaceId::Code, Arc::clone(&registry));
        let large_space = LargeObjectSpace::new(Arc::clone(&registry));

        let map_bytes = MAP_SIZE_IN_WORDS * WORD_SIZE;
        let meta_addr = map_space.allocate_raw(map_bytes);
        initialize_map(meta_addr, meta_addr.as_usize(), InstanceType::Map, map_bytes);
        let meta_map = Map::from_object(ObjectRef::from_address(meta_addr).unwrap());

        let bootstrap = |ty: InstanceType, size: usize| {
            let addr = map_space.allocate_raw(map_bytes);
            initialize_map(addr, meta_addr.as_usize(), ty, size);
            Map::from_object(ObjectRef::from_address(addr).unwrap())
        };
        let well_known = WellKnownMaps {
            meta_map,
            array_map: bootstrap(InstanceType::Array, 0),
            byte_data_map: bootstrap(InstanceType::ByteData, 0),
            native_context_map: bootstrap(InstanceType::NativeContext, 0),
            code_map: bootstrap(InstanceType::Code, 0),
            one_word_filler_map: bootstrap(InstanceType::Filler, WORD_SIZE),
            free_space_map: bootstrap(InstanceType::FreeSpace, 0),
        };

        Arc::new(Heap {
            registry,
            new_space,
            old_space,
            map_space,
            code_space,
            large_space,
            roots: ArcSwap::from_pointee(GlobalRoots::default()),
            retained_maps: Mutex::new(RetainedMaps::default()),
            native_contexts: Mutex::new(Vec::new()),
            stack_guard: StackGuard::default(),
            well_known,
            gc_state: AtomicU8::new(GcState::NotInGc as u8),
            deserialization_complete: AtomicBool::new(true),
            serializer_enabled: AtomicBool::new(false),
            always_allocate_depth: AtomicUsize::new(0),
            old_generation_allocation_limit: AtomicUsize::new(DEFAULT_OLD_GENERATION_LIMIT),
            should_reduce_memory: AtomicBool::new(false),
            abort_incremental_marking: AtomicBool::new(false),
        })
    }

    // Spaces and pages.

    pub fn registry(&self) -> &PageRegistry {
        &self.registry
    }

    pub fn new_space(&self) -> &NewSpace {
        &self.new_space
    }

    pub fn old_space(&self) -> &Space {
        &self.old_space
    }

    pub fn map_space(&self) -> &Space {
        &self.map_space
    }

    pub fn code_space(&self) -> &Space {
        &self.code_space
    }

    pub fn large_space(&self) -> &LargeObjectSpace {
        &self.large_space
    }

    pub fn paged_old_spaces(&self) -> [&Space; 3] {
        [&self.old_space, &self.map_space, &self.code_space]
    }

    pub fn page_of(&self, addr: Address) -> Option<Arc<Page>> {
        self.registry.page_of(addr)
    }

    pub fn page_of_object(&self, obj: ObjectRef) -> Arc<Page> {
        self.registry
            .page_of(obj.to_address())
            .expect("object outside the managed heap")
    }

    pub fn for_each_page<F: FnMut(&Arc<Page>)>(&self, mut f: F) {
        for page in self
            .old_space
            .pages()
            .iter()
            .chain(self.map_space.pages().iter())
            .chain(self.code_space.pages().iter())
            .chain(self.new_space.pages().iter())
            .chain(self.large_space.pages().iter())
        {
            f(page);
        }
    }

    // Color shorthand.

    pub fn color_of(&self, obj: ObjectRef) -> Color {
        self.page_of_object(obj).color(obj.to_address())
    }

    pub fn is_white(&self, obj: ObjectRef) -> bool {
        self.color_of(obj) == Color::White
    }

    pub fn is_grey(&self, obj: ObjectRef) -> bool {
        self.color_of(obj) == Color::Grey
    }

    pub fn is_black(&self, obj: ObjectRef) -> bool {
        self.color_of(obj) == Color::Black
    }

    // Space predicates.

    pub fn in_new_space(&self, obj: ObjectRef) -> bool {
        self.page_of_object(obj).space() == SpaceId::New
    }

    pub fn in_from_space(&self, obj: ObjectRef) -> bool {
        self.page_of_object(obj).is_flag_set(PageFlags::IN_FROM_SPACE)
    }

    pub fn in_to_space(&self, obj: ObjectRef) -> bool {
        self.page_of_object(obj).is_flag_set(PageFlags::IN_TO_SPACE)
    }

    // Well-known maps.

    pub fn well_known_maps(&self) -> &WellKnownMaps {
        &self.well_known
    }

    pub fn one_word_filler_map(&self) -> Map {
        self.well_known.one_word_filler_map
    }

    pub fn is_one_word_filler(&self, obj: ObjectRef) -> bool {
        HeapObject::new(obj).map_word() == self.well_known.one_word_filler_map.object().as_usize()
    }

    /// Any filler kind: the one-word trimming filler or a free-space block.
    pub fn is_filler(&self, obj: ObjectRef) -> bool {
        let map_word = HeapObject::new(obj).map_word();
        map_word == self.well_known.one_word_filler_map.object().as_usize()
            || map_word == self.well_known.free_space_map.object().as_usize()
    }

    // Allocation helpers. These write the header; callers fill the body.

    /// A fresh map describing a fixed-size all-pointer object with
    /// `field_count` body fields.
    pub fn new_plain_map(&self, field_count: usize) -> Map {
        let addr = self.map_space.allocate_raw(MAP_SIZE_IN_WORDS * WORD_SIZE);
        initialize_map(
            addr,
            self.well_known.meta_map.object().as_usize(),
            InstanceType::Plain,
            (1 + field_count) * WORD_SIZE,
        );
        Map::from_object(ObjectRef::from_address(addr).unwrap())
    }

    pub fn allocate_plain(&self, map: Map) -> ObjectRef {
        debug_assert_eq!(map.instance_type(), InstanceType::Plain);
        let obj = self.old_space.allocate(map.instance_size());
        HeapObject::new(obj).set_map(map);
        obj
    }

    fn init_array_like(&self, obj: ObjectRef, map: Map, len: usize) -> ObjectRef {
        let view = HeapObject::new(obj);
        view.set_map(map);
        view.set_raw_field(1, tag_scalar(len));
        obj
    }

    pub fn allocate_array(&self, len: usize) -> ObjectRef {
        let obj = self.old_space.allocate((2 + len) * WORD_SIZE);
        self.init_array_like(obj, self.well_known.array_map, len)
    }

    pub fn allocate_array_in_new_space(&self, len: usize) -> Option<ObjectRef> {
        let obj = self.new_space.allocate((2 + len) * WORD_SIZE)?;
        Some(self.init_array_like(obj, self.well_known.array_map, len))
    }

    pub fn allocate_large_array(&self, len: usize, with_progress_bar: bool) -> ObjectRef {
        let obj = self
            .large_space
            .allocate((2 + len) * WORD_SIZE, with_progress_bar);
        self.init_array_like(obj, self.well_known.array_map, len)
    }

    pub fn allocate_byte_data(&self, len_words: usize) -> ObjectRef {
        let obj = self.old_space.allocate((2 + len_words) * WORD_SIZE);
        self.init_array_like(obj, self.well_known.byte_data_map, len_words)
    }

    pub fn allocate_code(&self, len: usize) -> ObjectRef {
        let obj = self.code_space.allocate((2 + len) * WORD_SIZE);
        self.init_array_like(obj, self.well_known.code_map, len)
    }

    pub fn allocate_native_context(&self, slots: usize) -> ObjectRef {
        debug_assert!(slots >= 2, "context needs cache and link slots");
        let obj = self.old_space.allocate((2 + slots) * WORD_SIZE);
        self.init_array_like(obj, self.well_known.native_context_map, slots);
        self.native_contexts.lock().push(obj);
        obj
    }

    /// Overwrite the header at `addr` with a one-word filler, as left
    /// trimming does with the vacated prefix.
    pub fn write_one_word_filler(&self, addr: Address) {
        crate::object::write_word(addr, self.well_known.one_word_filler_map.object().as_usize());
    }

    // Roots.

    pub fn roots(&self) -> Arc<GlobalRoots> {
        self.roots.load_full()
    }

    pub fn add_root(&self, obj: ObjectRef) {
        self.roots.rcu(|roots| {
            let mut next = (**roots).clone();
            next.register(obj);
            next
        });
    }

    pub fn remove_root(&self, obj: ObjectRef) {
        self.roots.rcu(|roots| {
            let mut next = (**roots).clone();
            next.unregister(obj);
            next
        });
    }

    pub fn clear_roots(&self) {
        self.roots.store(Arc::new(GlobalRoots::default()));
    }

    pub fn iterate_strong_roots<F: FnMut(ObjectRef)>(&self, mut f: F) {
        for root in self.roots.load().iter() {
            f(root);
        }
    }

    // Retained maps and native contexts.

    pub fn retained_maps(&self) -> &Mutex<RetainedMaps> {
        &self.retained_maps
    }

    pub fn add_retained_map(&self, map: Map, age: usize) {
        self.retained_maps.lock().add(map, age);
    }

    pub fn native_contexts(&self) -> Vec<ObjectRef> {
        self.native_contexts.lock().clone()
    }

    // Runtime state consulted by the lifecycle guards.

    pub fn stack_guard(&self) -> &StackGuard {
        &self.stack_guard
    }

    pub fn gc_state(&self) -> GcState {
        GcState::from_u8(self.gc_state.load(Ordering::Acquire))
    }

    pub fn set_gc_state(&self, state: GcState) {
        self.gc_state.store(state as u8, Ordering::Release);
    }

    pub fn deserialization_complete(&self) -> bool {
        self.deserialization_complete.load(Ordering::Acquire)
    }

    pub fn set_deserialization_complete(&self, complete: bool) {
        self.deserialization_complete.store(complete, Ordering::Release);
    }

    pub fn serializer_enabled(&self) -> bool {
        self.serializer_enabled.load(Ordering::Acquire)
    }

    pub fn set_serializer_enabled(&self, enabled: bool) {
        self.serializer_enabled.store(enabled, Ordering::Release);
    }

    /// Scoped override: while any such scope is open, allocation must not
    /// trigger marking steps.
    pub fn enter_always_allocate_scope(&self) {
        self.always_allocate_depth.fetch_add(1, Ordering::AcqRel);
    }

    pub fn exit_always_allocate_scope(&self) {
        let prev = self.always_allocate_depth.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0);
    }

    pub fn always_allocate(&self) -> bool {
        self.always_allocate_depth.load(Ordering::Acquire) > 0
    }

    pub fn should_reduce_memory(&self) -> bool {
        self.should_reduce_memory.load(Ordering::Acquire)
    }

    pub fn set_should_reduce_memory(&self, value: bool) {
        self.should_reduce_memory.store(value, Ordering::Release);
    }

    pub fn should_abort_incremental_marking(&self) -> bool {
        self.abort_incremental_marking.load(Ordering::Acquire)
    }

    pub fn set_should_abort_incremental_marking(&self, value: bool) {
        self.abort_incremental_marking.store(value, Ordering::Release);
    }

    // Sizes feeding the pacer.

    pub fn promoted_space_size(&self) -> usize {
        self.old_space.allocated_bytes()
            + self.map_space.allocated_bytes()
            + self.code_space.allocated_bytes()
            + self.large_space.allocated_bytes()
    }

    pub fn old_generation_allocation_counter(&self) -> usize {
        self.promoted_space_size()
    }

    pub fn old_generation_allocation_limit(&self) -> usize {
        self.old_generation_allocation_limit.load(Ordering::Acquire)
    }

    pub fn set_old_generation_allocation_limit(&self, limit: usize) {
        self.old_generation_allocation_limit
            .store(limit, Ordering::Release);
    }

    pub fn is_close_to_out_of_memory(&self, slack: usize) -> bool {
        self.promoted_space_size() + slack >= self.old_generation_allocation_limit()
    }

    // Observer fan-out used by the marker lifecycle.

    pub fn add_allocation_observer_everywhere(&self, observer: &Arc<dyn AllocationObserver>) {
        self.new_space.add_allocation_observer(Arc::clone(observer));
        for space in self.paged_old_spaces() {
            space.add_allocation_observer(Arc::clone(observer));
        }
        self.large_space.add_allocation_observer(Arc::clone(observer));
    }

    pub fn remove_allocation_observer_everywhere(&self, observer: &Arc<dyn AllocationObserver>) {
        self.new_space.remove_allocation_observer(observer);
        for space in self.paged_old_spaces() {
            space.remove_allocation_observer(observer);
        }
        self.large_space.remove_allocation_observer(observer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bootstrap_maps_are_self_describing() {
        let heap = Heap::new();
        let maps = heap.well_known_maps();
        assert_eq!(maps.meta_map.instance_type(), InstanceType::Map);
        // The meta map's map is itself.
        let meta_obj = HeapObject::new(maps.meta_map.object());
        assert_eq!(meta_obj.map().object(), maps.meta_map.object());
        assert_eq!(maps.array_map.instance_type(), InstanceType::Array);
        assert_eq!(maps.one_word_filler_map.instance_type(), InstanceType::Filler);
    }

    #[test]
    fn plain_objects_report_their_size() {
        let heap = Heap::new();
        let map = heap.new_plain_map(3);
        let obj = heap.allocate_plain(map);
        assert_eq!(HeapObject::new(obj).size(), 4 * WORD_SIZE);
        assert!(heap.is_white(obj));
        assert!(!heap.in_new_space(obj));
    }

    #[test]
    fn filler_detection() {
        let heap = Heap::new();
        let arr = heap.allocate_array(4);
        assert!(!heap.is_one_word_filler(arr));
        heap.write_one_word_filler(arr.to_address());
        assert!(heap.is_one_word_filler(arr));
    }

    #[test]
    fn roots_rcu_updates() {
        let heap = Heap::new();
        let map = heap.new_plain_map(1);
        let a = heap.allocate_plain(map);
        let b = heap.allocate_plain(map);
        heap.add_root(a);
        heap.add_root(b);
        assert_eq!(heap.roots().len(), 2);
        heap.remove_root(a);
        assert_eq!(heap.roots().len(), 1);
    }

    #[test]
    fn native_contexts_are_tracked() {
        let heap = Heap::new();
        let ctx = heap.allocate_native_context(4);
        assert_eq!(heap.native_contexts(), vec![ctx]);
        assert_eq!(
            HeapObject::new(ctx).map().instance_type(),
            InstanceType::NativeContext
        );
    }

    #[test]
    fn oom_predicate_tracks_the_limit() {
        let heap = Heap::new();
        assert!(!heap.is_close_to_out_of_memory(0));
        heap.set_old_generation_allocation_limit(heap.promoted_space_size() + 1024);
        assert!(heap.is_close_to_out_of_memory(4096));
        assert!(!heap.is_close_to_out_of_memory(0));
    }
}
