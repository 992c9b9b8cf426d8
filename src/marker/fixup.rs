//! Mutator fix-ups: left-trimming color transfer, scavenge reconciliation
//! of the work-list, and the map-retention pass.

use crate::marker::IncrementalMarker;
use crate::object::{HeapObject, Map};
use crate::page::PageFlags;
use crate::types::{ObjectRef, WORD_SIZE};

impl IncrementalMarker {
    /// An array was trimmed from `from` to `to`; move its color with it.
    ///
    /// The mutator calls this before overwriting the old header, and the
    /// protocol drives `from` to black first under concurrent marking so no
    /// worker ever reads a half-overwritten header.
    pub fn notify_left_trimming(&self, from: ObjectRef, to: ObjectRef) {
        debug_assert!(self.is_marking());
        debug_assert!(from != to);
        let page = self.heap().page_of_object(from);
        debug_assert!(page.contains(to.to_address()));
        let from_addr = from.to_address();
        let to_addr = to.to_address();
        let overlapping = from_addr + WORD_SIZE == to_addr;

        if self.black_allocator().is_active() && page.is_black(to_addr) {
            // The object sits in a black-allocation area; nothing to move.
            return;
        }

        let mut marked_black_due_to_left_trimming = false;
        if self.config().concurrent_marking {
            // Blacken the old position before the header is rewritten so the
            // concurrent marker cannot scan the array through a stale map.
            page.white_to_grey(from_addr);
            if page.grey_to_black(from_addr) {
                // The workers will now skip the array; the new start must be
                // pushed so it still gets scanned.
                marked_black_due_to_left_trimming = true;
            }
            debug_assert!(page.is_black(from_addr));
        }

        if page.is_black(from_addr) && !marked_black_due_to_left_trimming {
            // Legitimately black before trimming: transfer black.
            if overlapping {
                // The mark-bit windows overlap; the new position already
                // reads grey through the old second bit, so completing it
                // only needs its own second bit.
                debug_assert!(page.is_grey(to_addr) || page.is_black(to_addr));
                page.set_second_mark_bit(to_addr);
            } else {
                let became_black = page.white_to_black(to_addr);
                debug_assert!(became_black);
            }
        } else if page.is_grey(from_addr) || marked_black_due_to_left_trimming {
            // Grey before trimming (or blackened only by this call): the new
            // position is published grey and re-enters the work-list.
            if overlapping {
                page.set_first_mark_bit(to_addr);
                debug_assert!(!page.second_mark_bit(to_addr));
            } else {
                let became_grey = page.white_to_grey(to_addr);
                debug_assert!(became_grey);
            }
            if !self.worklist().push(to) {
                self.worklist().push_bailout(to);
            }
            self.restart_if_not_marking();
        }
    }

    /// Rewrite the work-list after a young-generation copy.
    ///
    /// Entries may point at moved objects (follow the forwarding word), at
    /// dead objects (drop), or at survivors on moved pages (keep only if
    /// still grey). Dropping is safe: anything live is reachable from a
    /// surviving grey object or from the roots.
    pub fn update_marking_worklist_after_scavenge(&self) {
        if !self.is_marking() {
            return;
        }
        self.worklist().update(|obj| {
            let view = HeapObject::new(obj);
            if self.heap().in_from_space(obj) {
                match view.forwarding_target() {
                    Some(dest) => Some(dest),
                    // No forwarding word: dead at scavenge time (stale root,
                    // left-trimmed remainder); discard.
                    None => None,
                }
            } else if self.heap().in_to_space(obj) {
                let page = self.heap().page_of_object(obj);
                debug_assert!(page.is_flag_set(PageFlags::SWEEP_TO_ITERATE));
                if page.is_flag_set(PageFlags::SWEEP_TO_ITERATE)
                    && page.is_grey(obj.to_address())
                {
                    Some(obj)
                } else {
                    None
                }
            } else {
                // Old generation; the page may have just moved out of new
                // space.
                let page = self.heap().page_of_object(obj);
                if page.is_flag_set(PageFlags::SWEEP_TO_ITERATE) {
                    return if page.is_grey(obj.to_address()) {
                        Some(obj)
                    } else {
                        None
                    };
                }
                // In-place array shifts leave one-word fillers behind.
                if self.heap().is_one_word_filler(obj) {
                    None
                } else {
                    Some(obj)
                }
            }
        });
    }

    /// Age the retained-map table and keep recently used maps alive.
    ///
    /// Runs once per cycle, in the first finalization round. Maps whose
    /// constructor is dead are never retained; maps in the disposed-context
    /// prefix are never aged.
    pub(crate) fn retain_maps(&self) {
        // Retention is off under memory pressure, when the cycle is being
        // aborted, or by configuration.
        let retaining_disabled = self.heap().should_reduce_memory()
            || self.heap().should_abort_incremental_marking()
            || self.config().retain_maps_for_n_gc == 0;
        let reset_age = self.config().retain_maps_for_n_gc;

        let mut table = self.heap().retained_maps().lock();
        let disposed_prefix = table.disposed_prefix();
        for (index, entry) in table.entries_mut().iter_mut().enumerate() {
            let Some(map) = entry.cell.get() else {
                continue;
            };
            let age = entry.age;
            let new_age;
            if index >= disposed_prefix
                && !retaining_disabled
                && self.heap().is_white(map.object())
            {
                if self.should_retain_map(map, age) {
                    self.white_to_grey_and_push(map.object());
                }
                match map.prototype() {
                    Some(prototype) if age > 0 && self.heap().is_white(prototype) => {
                        // The prototype is unmarked: the map is only kept by
                        // retention, so it ages.
                        new_age = age - 1;
                    }
                    _ => {
                        // Constructor and prototype are live; the map keeps
                        // a transition tree alive, not objects. Do not age.
                        new_age = age;
                    }
                }
            } else {
                new_age = reset_age;
            }
            entry.age = new_age;
        }
    }

    fn should_retain_map(&self, map: Map, age: usize) -> bool {
        if age == 0 {
            // Aged out; no new objects with this map can appear fast enough
            // to matter.
            return false;
        }
        match map.constructor() {
            // A dead constructor cannot create instances; drop the map.
            Some(constructor) => !self.heap().is_white(constructor),
            None => false,
        }
    }
}
