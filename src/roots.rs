//! Strong root set exposed to the marker.

use crate::types::ObjectRef;

/// Strong global root references.
///
/// The heap publishes the root set through an `ArcSwap` so the marker's root
/// scans read it lock-free while the embedder keeps registering handles.
///
/// # Examples
///
/// ```
/// use greymark::roots::GlobalRoots;
/// use greymark::types::{Address, ObjectRef};
///
/// let mut roots = GlobalRoots::default();
/// let obj = ObjectRef::from_address(Address::from_usize(0x1000)).unwrap();
/// roots.register(obj);
/// assert_eq!(roots.iter().count(), 1);
/// ```
#[derive(Default, Clone)]
pub struct GlobalRoots {
    handles: Vec<ObjectRef>,
}

impl GlobalRoots {
    pub fn register(&mut self, handle: ObjectRef) {
        self.handles.push(handle);
    }

    pub fn unregister(&mut self, handle: ObjectRef) {
        self.handles.retain(|existing| *existing != handle);
    }

    pub fn clear(&mut self) {
        self.handles.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = ObjectRef> + '_ {
        self.handles.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Address;

    fn obj(addr: usize) -> ObjectRef {
        ObjectRef::from_address(Address::from_usize(addr)).unwrap()
    }

    #[test]
    fn register_and_unregister() {
        let mut roots = GlobalRoots::default();
        roots.register(obj(0x1000));
        roots.register(obj(0x2000));
        roots.register(obj(0x1000));
        assert_eq!(roots.len(), 3);

        roots.unregister(obj(0x1000));
        assert_eq!(roots.len(), 1);
        assert_eq!(roots.iter().next(), Some(obj(0x2000)));

        roots.clear();
        assert!(roots.is_empty());
    }
}
