//! Minimal object model: headers, maps, and typed views over raw heap words.
//!
//! Word 0 of every object is its map word: the address of the object's map,
//! or a forwarding address with the low bit set while the scavenger is
//! copying. Maps are themselves heap objects (in map space) and describe the
//! instance type and field layout of their instances.

use std::sync::atomic::Ordering;

use crate::types::{
    atomic_word, decode_ref, is_tagged_scalar, tag_scalar, untag_scalar, Address, ObjectRef,
    WORD_SIZE,
};

/// Read a word of object memory.
#[inline]
pub(crate) fn read_word(addr: Address) -> usize {
    unsafe { atomic_word(addr).load(Ordering::Acquire) }
}

/// Write a word of object memory.
#[inline]
pub(crate) fn write_word(addr: Address, value: usize) {
    unsafe { atomic_word(addr).store(value, Ordering::Release) }
}

/// Layout classes the visitor dispatches on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum InstanceType {
    /// Fixed-size object; every body word is a reference slot or a tagged
    /// scalar.
    Plain = 0,
    /// Variable-length pointer array: map, length, then elements.
    Array,
    /// Variable-length raw data (strings, byte buffers); no reference slots.
    ByteData,
    /// A map. Reference slots: constructor and prototype.
    Map,
    /// A native context: pointer array whose first element is the
    /// normalized-map cache and whose second links the context list.
    NativeContext,
    /// Code object: pointer array; stores into it are recorded as reloc
    /// slots by the write barrier.
    Code,
    /// One-word filler left behind by left-trimming.
    Filler,
    /// Free-space filler: map plus a size word.
    FreeSpace,
}

pub const INSTANCE_TYPE_COUNT: usize = 8;

impl InstanceType {
    pub fn from_usize(raw: usize) -> InstanceType {
        match raw {
            0 => InstanceType::Plain,
            1 => InstanceType::Array,
            2 => InstanceType::ByteData,
            3 => InstanceType::Map,
            4 => InstanceType::NativeContext,
            5 => InstanceType::Code,
            6 => InstanceType::Filler,
            7 => InstanceType::FreeSpace,
            _ => panic!("invalid instance type {raw}"),
        }
    }

    /// Whether instances carry the `[map, length, elements...]` layout.
    pub fn is_array_like(self) -> bool {
        matches!(
            self,
            InstanceType::Array | InstanceType::NativeContext | InstanceType::Code
        )
    }
}

// Map object layout, in words.
pub const MAP_INSTANCE_TYPE_INDEX: usize = 1;
pub const MAP_INSTANCE_SIZE_INDEX: usize = 2;
pub const MAP_CONSTRUCTOR_INDEX: usize = 3;
pub const MAP_PROTOTYPE_INDEX: usize = 4;
pub const MAP_SIZE_IN_WORDS: usize = 5;

/// Byte offset where array-like bodies start (map word + length word).
pub const ARRAY_BODY_START: usize = 2 * WORD_SIZE;

// Native-context body slots (element indexes).
pub const NATIVE_CONTEXT_CACHE_SLOT: usize = 0;
pub const NATIVE_CONTEXT_NEXT_LINK_SLOT: usize = 1;

/// Typed view of a map object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Map(ObjectRef);

impl Map {
    #[inline]
    pub fn from_object(obj: ObjectRef) -> Map {
        Map(obj)
    }

    #[inline]
    pub fn object(self) -> ObjectRef {
        self.0
    }

    #[inline]
    fn word(self, index: usize) -> usize {
        read_word(self.0.to_address() + index * WORD_SIZE)
    }

    pub fn instance_type(self) -> InstanceType {
        InstanceType::from_usize(untag_scalar(self.word(MAP_INSTANCE_TYPE_INDEX)))
    }

    /// Instance size in bytes for fixed-size instance types; zero for
    /// variable-length types.
    pub fn instance_size(self) -> usize {
        untag_scalar(self.word(MAP_INSTANCE_SIZE_INDEX))
    }

    pub fn constructor(self) -> Option<ObjectRef> {
        decode_ref(self.word(MAP_CONSTRUCTOR_INDEX))
    }

    pub fn prototype(self) -> Option<ObjectRef> {
        decode_ref(self.word(MAP_PROTOTYPE_INDEX))
    }

    pub fn set_constructor(self, value: Option<ObjectRef>) {
        write_word(
            self.0.to_address() + MAP_CONSTRUCTOR_INDEX * WORD_SIZE,
            value.map_or(0, ObjectRef::as_usize),
        );
    }

    pub fn set_prototype(self, value: Option<ObjectRef>) {
        write_word(
            self.0.to_address() + MAP_PROTOTYPE_INDEX * WORD_SIZE,
            value.map_or(0, ObjectRef::as_usize),
        );
    }
}

/// Untyped view of any heap object, keyed by its start address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapObject(ObjectRef);

impl HeapObject {
    #[inline]
    pub fn new(obj: ObjectRef) -> HeapObject {
        HeapObject(obj)
    }

    #[inline]
    pub fn object(self) -> ObjectRef {
        self.0
    }

    #[inline]
    pub fn address(self) -> Address {
        self.0.to_address()
    }

    #[inline]
    pub fn map_word(self) -> usize {
        read_word(self.address())
    }

    /// During scavenge the map word of a copied object holds the forwarding
    /// address, tagged with the low bit.
    pub fn is_forwarded(self) -> bool {
        self.map_word() & 1 == 1
    }

    pub fn forwarding_target(self) -> Option<ObjectRef> {
        let word = self.map_word();
        if word & 1 == 1 {
            ObjectRef::from_address(Address::from_usize(word & !1))
        } else {
            None
        }
    }

    pub fn set_forwarding(self, to: ObjectRef) {
        write_word(self.address(), to.as_usize() | 1);
    }

    pub fn map(self) -> Map {
        let word = self.map_word();
        debug_assert!(word & 1 == 0, "map read on forwarded object {:?}", self.0);
        Map(decode_ref(word).expect("object without a map"))
    }

    pub fn set_map(self, map: Map) {
        write_word(self.address(), map.object().as_usize());
    }

    #[inline]
    pub fn field_address(self, index: usize) -> Address {
        self.address() + index * WORD_SIZE
    }

    #[inline]
    pub fn raw_field(self, index: usize) -> usize {
        read_word(self.field_address(index))
    }

    #[inline]
    pub fn set_raw_field(self, index: usize, value: usize) {
        write_word(self.field_address(index), value);
    }

    pub fn ref_field(self, index: usize) -> Option<ObjectRef> {
        decode_ref(self.raw_field(index))
    }

    /// Length word of array-like objects.
    pub fn length(self) -> usize {
        debug_assert!(self.map().instance_type().is_array_like()
            || self.map().instance_type() == InstanceType::ByteData);
        untag_scalar(self.raw_field(1))
    }

    /// Element accessors for array-like objects (element 0 is word 2).
    pub fn element(self, index: usize) -> Option<ObjectRef> {
        self.ref_field(2 + index)
    }

    pub fn set_element(self, index: usize, value: Option<ObjectRef>) {
        self.set_raw_field(2 + index, value.map_or(0, ObjectRef::as_usize));
    }

    /// Size in bytes, as derived from the map.
    pub fn size_from_map(self, map: Map) -> usize {
        match map.instance_type() {
            InstanceType::Plain | InstanceType::Map => map.instance_size(),
            InstanceType::Array | InstanceType::NativeContext | InstanceType::Code => {
                (2 + untag_scalar(self.raw_field(1))) * WORD_SIZE
            }
            InstanceType::ByteData => (2 + untag_scalar(self.raw_field(1))) * WORD_SIZE,
            InstanceType::Filler => WORD_SIZE,
            InstanceType::FreeSpace => untag_scalar(self.raw_field(1)),
        }
    }

    pub fn size(self) -> usize {
        self.size_from_map(self.map())
    }
}

/// Initialize a freshly allocated map object in place.
pub(crate) fn initialize_map(
    addr: Address,
    meta_map: usize,
    instance_type: InstanceType,
    instance_size: usize,
) {
    write_word(addr, meta_map);
    write_word(
        addr + MAP_INSTANCE_TYPE_INDEX * WORD_SIZE,
        tag_scalar(instance_type as usize),
    );
    write_word(
        addr + MAP_INSTANCE_SIZE_INDEX * WORD_SIZE,
        tag_scalar(instance_size),
    );
    write_word(addr + MAP_CONSTRUCTOR_INDEX * WORD_SIZE, 0);
    write_word(addr + MAP_PROTOTYPE_INDEX * WORD_SIZE, 0);
}

/// True if the slot word holds something the marker must trace.
#[inline]
pub fn is_reference_word(word: usize) -> bool {
    word != 0 && !is_tagged_scalar(word)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::{Page, SpaceId, PAGE_SIZE};

    #[test]
    fn map_fields_round_trip() {
        let page = Page::allocate(PAGE_SIZE, SpaceId::Map);
        let meta = page.base() + 64;
        initialize_map(meta, meta.as_usize(), InstanceType::Map, MAP_SIZE_IN_WORDS * WORD_SIZE);
        let map_addr = page.base() + 128;
        initialize_map(map_addr, meta.as_usize(), InstanceType::Plain, 4 * WORD_SIZE);

        let map = Map::from_object(ObjectRef::from_address(map_addr).unwrap());
        assert_eq!(map.instance_type(), InstanceType::Plain);
        assert_eq!(map.instance_size(), 32);
        assert_eq!(map.constructor(), None);

        let ctor = ObjectRef::from_address(page.base() + 512).unwrap();
        map.set_constructor(Some(ctor));
        assert_eq!(map.constructor(), Some(ctor));
    }

    #[test]
    fn forwarding_tags_the_map_word() {
        let page = Page::allocate(PAGE_SIZE, SpaceId::Old);
        let meta = page.base() + 64;
        initialize_map(meta, meta.as_usize(), InstanceType::Map, MAP_SIZE_IN_WORDS * WORD_SIZE);
        let map_addr = page.base() + 128;
        initialize_map(map_addr, meta.as_usize(), InstanceType::Plain, 3 * WORD_SIZE);

        let obj_addr = page.base() + 256;
        write_word(obj_addr, map_addr.as_usize());
        let obj = HeapObject::new(ObjectRef::from_address(obj_addr).unwrap());
        assert!(!obj.is_forwarded());
        assert_eq!(obj.size(), 24);

        let target = ObjectRef::from_address(page.base() + 1024).unwrap();
        obj.set_forwarding(target);
        assert!(obj.is_forwarded());
        assert_eq!(obj.forwarding_target(), Some(target));
    }

    #[test]
    fn array_size_tracks_length() {
        let page = Page::allocate(PAGE_SIZE, SpaceId::Old);
        let meta = page.base() + 64;
        initialize_map(meta, meta.as_usize(), InstanceType::Map, MAP_SIZE_IN_WORDS * WORD_SIZE);
        let array_map = page.base() + 128;
        initialize_map(array_map, meta.as_usize(), InstanceType::Array, 0);

        let arr_addr = page.base() + 256;
        write_word(arr_addr, array_map.as_usize());
        write_word(arr_addr + WORD_SIZE, tag_scalar(3));
        let arr = HeapObject::new(ObjectRef::from_address(arr_addr).unwrap());
        assert_eq!(arr.length(), 3);
        assert_eq!(arr.size(), 5 * WORD_SIZE);

        let elem = ObjectRef::from_address(page.base() + 2048).unwrap();
        arr.set_element(1, Some(elem));
        assert_eq!(arr.element(0), None);
        assert_eq!(arr.element(1), Some(elem));
    }
}
