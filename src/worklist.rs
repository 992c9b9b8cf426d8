//! Grey-object work-list with a bailout side-channel.

use crossbeam::queue::{ArrayQueue, SegQueue};

use crate::types::ObjectRef;

/// Multi-producer/multi-consumer set of grey objects.
///
/// Two channels: the bounded **main** channel, whose `push` can fail when the
/// list is full, and the unbounded **bailout** channel used by concurrent
/// marking tasks and the progress-bar protocol to hand objects back to the
/// mutator. `pop` always drains bailout entries first, so a handed-back
/// object is reprocessed before any ordinary grey.
///
/// Every object on the list is grey. Callers that fail a main-channel push
/// must reverse their color transition (black back to grey); dropping the
/// object instead would leave a black object with unscanned fields.
///
/// # Examples
///
/// ```
/// use greymark::types::{Address, ObjectRef};
/// use greymark::worklist::MarkingWorklist;
///
/// let worklist = MarkingWorklist::new(16);
/// let a = ObjectRef::from_address(Address::from_usize(0x1000)).unwrap();
/// let b = ObjectRef::from_address(Address::from_usize(0x2000)).unwrap();
///
/// assert!(worklist.push(a));
/// worklist.push_bailout(b);
/// // Bailout drains first.
/// assert_eq!(worklist.pop(), Some(b));
/// assert_eq!(worklist.pop(), Some(a));
/// assert!(worklist.is_empty());
/// ```
pub struct MarkingWorklist {
    main: ArrayQueue<ObjectRef>,
    bailout: SegQueue<ObjectRef>,
}

impl MarkingWorklist {
    pub fn new(capacity: usize) -> Self {
        Self {
            main: ArrayQueue::new(capacity),
            bailout: SegQueue::new(),
        }
    }

    /// Push onto the main channel. Returns false when full; the caller owns
    /// the color fallback.
    #[must_use]
    pub fn push(&self, obj: ObjectRef) -> bool {
        self.main.push(obj).is_ok()
    }

    /// Push onto the bailout channel. Cannot fail; the channel is unbounded
    /// so a concurrent marker always has somewhere to hand an object back.
    pub fn push_bailout(&self, obj: ObjectRef) {
        self.bailout.push(obj);
    }

    /// Pop a grey object, draining the bailout channel first.
    pub fn pop(&self) -> Option<ObjectRef> {
        self.bailout.pop().or_else(|| self.main.pop())
    }

    /// Pop from the main channel only. Concurrent marking tasks use this so
    /// the bailout channel stays reserved for the mutator.
    pub fn pop_main(&self) -> Option<ObjectRef> {
        self.main.pop()
    }

    pub fn is_empty(&self) -> bool {
        self.bailout.is_empty() && self.main.is_empty()
    }

    /// Advisory: only the main channel has a capacity to exhaust.
    pub fn is_full(&self) -> bool {
        self.main.is_full()
    }

    pub fn len(&self) -> usize {
        self.bailout.len() + self.main.len()
    }

    /// Rewrite or drop every entry. Entries map through `f`: `Some(new)`
    /// keeps (possibly forwarded) entries in their original channel, `None`
    /// drops them.
    ///
    /// Callers must quiesce all producers and consumers first; scavenge
    /// reconciliation runs inside the scavenge pause, which does exactly
    /// that.
    pub fn update<F>(&self, mut f: F)
    where
        F: FnMut(ObjectRef) -> Option<ObjectRef>,
    {
        let mut kept_bailout = Vec::new();
        while let Some(obj) = self.bailout.pop() {
            if let Some(new) = f(obj) {
                kept_bailout.push(new);
            }
        }
        for obj in kept_bailout {
            self.bailout.push(obj);
        }

        let mut kept_main = Vec::new();
        while let Some(obj) = self.main.pop() {
            if let Some(new) = f(obj) {
                kept_main.push(new);
            }
        }
        for obj in kept_main {
            // The main channel cannot be full here: update never adds
            // entries, so everything popped fits back.
            let pushed = self.main.push(obj).is_ok();
            debug_assert!(pushed);
        }
    }

    /// Drop everything. Used when a cycle is aborted.
    pub fn clear(&self) {
        while self.pop().is_some() {}
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
    fn bailout_drains_before_main() {
        let worklist = MarkingWorklist::new(8);
        assert!(worklist.push(obj(0x1000)));
        assert!(worklist.push(obj(0x2000)));
        worklist.push_bailout(obj(0x3000));

        assert_eq!(worklist.pop(), Some(obj(0x3000)));
        assert_eq!(worklist.pop(), Some(obj(0x1000)));
        assert_eq!(worklist.pop(), Some(obj(0x2000)));
        assert_eq!(worklist.pop(), None);
    }

    #[test]
    fn main_channel_push_fails_when_full() {
        let worklist = MarkingWorklist::new(2);
        assert!(worklist.push(obj(0x1000)));
        assert!(worklist.push(obj(0x2000)));
        assert!(worklist.is_full());
        assert!(!worklist.push(obj(0x3000)));
        // The bailout channel is unaffected by main-channel pressure.
        worklist.push_bailout(obj(0x4000));
        assert_eq!(worklist.len(), 3);
    }

    #[test]
    fn update_rewrites_and_drops() {
        let worklist = MarkingWorklist::new(8);
        assert!(worklist.push(obj(0x1000)));
        assert!(worklist.push(obj(0x2000)));
        worklist.push_bailout(obj(0x3000));

        worklist.update(|o| match o.as_usize() {
            0x1000 => Some(obj(0x1008)),
            0x2000 => None,
            other => Some(obj(other)),
        });

        assert_eq!(worklist.len(), 2);
        assert_eq!(worklist.pop(), Some(obj(0x3000)));
        assert_eq!(worklist.pop(), Some(obj(0x1008)));
        assert_eq!(worklist.pop(), None);
    }

    #[test]
    fn pop_main_skips_bailout() {
        let worklist = MarkingWorklist::new(8);
        worklist.push_bailout(obj(0x3000));
        assert!(worklist.push(obj(0x1000)));
        assert_eq!(worklist.pop_main(), Some(obj(0x1000)));
        assert_eq!(worklist.pop_main(), None);
        assert_eq!(worklist.pop(), Some(obj(0x3000)));
    }
}
