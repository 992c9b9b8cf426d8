//! Raw address and object-reference types shared by the whole crate.

use std::fmt;
use std::num::NonZeroUsize;
use std::sync::atomic::AtomicUsize;

/// Size of a heap word in bytes. The crate assumes a 64-bit target.
pub const WORD_SIZE: usize = std::mem::size_of::<usize>();

/// An untyped byte address inside (or just past) the managed heap.
///
/// `Address` is deliberately a plain value type: it carries no provenance and
/// no lifetime. Turning an address back into memory is the job of the page
/// layer and is always `unsafe` there.
///
/// # Examples
///
/// ```
/// use greymark::types::{Address, WORD_SIZE};
///
/// let a = Address::from_usize(0x1000);
/// assert_eq!((a + WORD_SIZE) - a, WORD_SIZE);
/// assert!(a.is_word_aligned());
/// ```
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Address(usize);

impl Address {
    pub const ZERO: Address = Address(0);

    #[inline]
    pub fn from_usize(raw: usize) -> Address {
        Address(raw)
    }

    #[inline]
    pub fn as_usize(self) -> usize {
        self.0
    }

    #[inline]
    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub fn is_word_aligned(self) -> bool {
        self.0 % WORD_SIZE == 0
    }

    #[inline]
    pub fn is_aligned_to(self, align: usize) -> bool {
        self.0 % align == 0
    }

    #[inline]
    pub fn align_down(self, align: usize) -> Address {
        debug_assert!(align.is_power_of_two());
        Address(self.0 & !(align - 1))
    }
}

impl std::ops::Add<usize> for Address {
    type Output = Address;

    #[inline]
    fn add(self, offset: usize) -> Address {
        Address(self.0 + offset)
    }
}

impl std::ops::Sub<usize> for Address {
    type Output = Address;

    #[inline]
    fn sub(self, offset: usize) -> Address {
        Address(self.0 - offset)
    }
}

impl std::ops::Sub<Address> for Address {
    type Output = usize;

    #[inline]
    fn sub(self, other: Address) -> usize {
        debug_assert!(self.0 >= other.0);
        self.0 - other.0
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// A non-null reference to the start of a heap object.
///
/// # Examples
///
/// ```
/// use greymark::types::{Address, ObjectRef};
///
/// assert!(ObjectRef::from_address(Address::ZERO).is_none());
/// let obj = ObjectRef::from_address(Address::from_usize(0x4000)).unwrap();
/// assert_eq!(obj.to_address().as_usize(), 0x4000);
/// ```
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectRef(NonZeroUsize);

impl ObjectRef {
    #[inline]
    pub fn from_address(addr: Address) -> Option<ObjectRef> {
        NonZeroUsize::new(addr.as_usize()).map(ObjectRef)
    }

    #[inline]
    pub fn to_address(self) -> Address {
        Address(self.0.get())
    }

    #[inline]
    pub fn as_usize(self) -> usize {
        self.0.get()
    }
}

impl fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "obj@{:#x}", self.0.get())
    }
}

/// Tagged small integers occupy the low bit so that every word in an object
/// body is self-describing: even words are references (or null), odd words
/// are scalars.
#[inline]
pub fn tag_scalar(value: usize) -> usize {
    (value << 1) | 1
}

#[inline]
pub fn untag_scalar(word: usize) -> usize {
    debug_assert!(is_tagged_scalar(word));
    word >> 1
}

#[inline]
pub fn is_tagged_scalar(word: usize) -> bool {
    word & 1 == 1
}

/// Decode a body word as a heap reference, if it is one.
///
/// Null slots and tagged scalars decode to `None`; anything else must be a
/// word-aligned object address.
#[inline]
pub fn decode_ref(word: usize) -> Option<ObjectRef> {
    if word == 0 || is_tagged_scalar(word) {
        return None;
    }
    debug_assert!(word % WORD_SIZE == 0, "unaligned reference word {word:#x}");
    ObjectRef::from_address(Address::from_usize(word))
}

/// View a heap word as an atomic cell.
///
/// All reads and writes of object memory go through this so that the mutator,
/// the incremental marker, and concurrent marking tasks never race with plain
/// accesses.
///
/// # Safety
///
/// `addr` must be word-aligned and point into memory owned by a live page.
#[inline]
pub unsafe fn atomic_word<'a>(addr: Address) -> &'a AtomicUsize {
    debug_assert!(addr.is_word_aligned());
    &*(addr.as_usize() as *const AtomicUsize)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_arithmetic() {
        let a = Address::from_usize(0x1008);
        assert_eq!((a + 8).as_usize(), 0x1010);
        assert_eq!((a - 8).as_usize(), 0x1000);
        assert_eq!(a - Address::from_usize(0x1000), 8);
        assert_eq!(a.align_down(0x1000).as_usize(), 0x1000);
    }

    #[test]
    fn scalar_tagging_round_trips() {
        for v in [0usize, 1, 42, 1 << 40] {
            let tagged = tag_scalar(v);
            assert!(is_tagged_scalar(tagged));
            assert_eq!(untag_scalar(tagged), v);
        }
    }

    #[test]
    fn decode_ref_filters_non_references() {
        assert_eq!(decode_ref(0), None);
        assert_eq!(decode_ref(tag_scalar(7)), None);
        let obj = decode_ref(0x8000).unwrap();
        assert_eq!(obj.as_usize(), 0x8000);
    }
}
