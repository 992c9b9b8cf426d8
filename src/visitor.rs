//! Type-directed object scanning.
//!
//! The visitor is a table of per-instance-type scan functions. Each scan
//! walks the reference slots the map describes, records every slot for the
//! compactor, and greys the targets. Oversized arrays on progress-bar pages
//! are scanned one chunk at a time and re-enqueued until done.

use once_cell::sync::Lazy;

use crate::object::{
    HeapObject, InstanceType, Map, ARRAY_BODY_START, INSTANCE_TYPE_COUNT,
    MAP_CONSTRUCTOR_INDEX, MAP_PROTOTYPE_INDEX, NATIVE_CONTEXT_CACHE_SLOT,
};
use crate::page::PageFlags;
use crate::marker::IncrementalMarker;
use crate::types::{decode_ref, ObjectRef, WORD_SIZE};

/// How many bytes of an oversized array one visit scans before giving the
/// mutator back control.
pub const PROGRESS_BAR_SCAN_CHUNK: usize = 32 * 1024;

type ScanFn = fn(&MarkingVisitor<'_>, Map, ObjectRef, usize) -> usize;

static VISITOR_TABLE: Lazy<[ScanFn; INSTANCE_TYPE_COUNT]> = Lazy::new(|| {
    let mut table: [ScanFn; INSTANCE_TYPE_COUNT] = [scan_no_pointers; INSTANCE_TYPE_COUNT];
    table[InstanceType::Plain as usize] = scan_plain;
    table[InstanceType::Array as usize] = scan_array;
    table[InstanceType::ByteData as usize] = scan_no_pointers;
    table[InstanceType::Map as usize] = scan_map;
    table[InstanceType::NativeContext as usize] = scan_native_context;
    table[InstanceType::Code as usize] = scan_code;
    table[InstanceType::Filler as usize] = scan_no_pointers;
    table[InstanceType::FreeSpace as usize] = scan_no_pointers;
    table
});

/// One field-scanning pass over a single object.
pub struct MarkingVisitor<'a> {
    marker: &'a IncrementalMarker,
}

impl<'a> MarkingVisitor<'a> {
    pub fn new(marker: &'a IncrementalMarker) -> MarkingVisitor<'a> {
        MarkingVisitor { marker }
    }

    /// Scan `obj` according to `map`'s body descriptor. Returns the object
    /// size in bytes; an incomplete progress-bar scan additionally reports
    /// its unscanned remainder to the marker.
    pub fn visit(&self, map: Map, obj: ObjectRef) -> usize {
        let size = HeapObject::new(obj).size_from_map(map);
        (VISITOR_TABLE[map.instance_type() as usize])(self, map, obj, size)
    }

    /// Visit the reference slots in `[from_word, to_word)` of `obj`.
    fn visit_pointer_range(&self, obj: ObjectRef, from_word: usize, to_word: usize) {
        let host = HeapObject::new(obj);
        for index in from_word..to_word {
            let word = host.raw_field(index);
            if let Some(target) = decode_ref(word) {
                self.marker.record_slot(obj, host.field_address(index), target);
                self.marker.white_to_grey_and_push(target);
            }
        }
    }

    fn scan_with_progress_bar(&self, obj: ObjectRef, size: usize) {
        let page = self.marker.heap().page_of_object(obj);
        let mut start = ARRAY_BODY_START.max(page.progress_bar());
        if start >= size {
            return;
        }
        // Not finished in this visit: hand the array back to the work-list
        // before scanning so a full budget never strands it.
        self.marker.requeue_progress_bar_object(obj);

        let already_scanned = start;
        let mut end = size.min(start + PROGRESS_BAR_SCAN_CHUNK);
        loop {
            self.visit_pointer_range(obj, start / WORD_SIZE, end / WORD_SIZE);
            start = end;
            end = size.min(end + PROGRESS_BAR_SCAN_CHUNK);
            // Keep scanning synchronously only while the work-list is too
            // full to take the re-enqueued array.
            if !(self.marker.worklist().is_full() && start < size) {
                break;
            }
        }
        page.set_progress_bar(start);
        if start < size {
            self.marker
                .notify_incomplete_scan(size - (start - already_scanned));
        }
    }
}

fn scan_no_pointers(
    _visitor: &MarkingVisitor<'_>,
    _map: Map,
    _obj: ObjectRef,
    size: usize,
) -> usize {
    size
}

fn scan_plain(visitor: &MarkingVisitor<'_>, _map: Map, obj: ObjectRef, size: usize) -> usize {
    visitor.visit_pointer_range(obj, 1, size / WORD_SIZE);
    size
}

fn scan_map(visitor: &MarkingVisitor<'_>, _map: Map, obj: ObjectRef, size: usize) -> usize {
    visitor.visit_pointer_range(obj, MAP_CONSTRUCTOR_INDEX, MAP_PROTOTYPE_INDEX + 1);
    size
}

fn scan_array(visitor: &MarkingVisitor<'_>, _map: Map, obj: ObjectRef, size: usize) -> usize {
    let page = visitor.marker.heap().page_of_object(obj);
    if visitor.marker.config().use_marking_progress_bar
        && page.is_flag_set(PageFlags::HAS_PROGRESS_BAR)
    {
        visitor.scan_with_progress_bar(obj, size);
    } else {
        visitor.visit_pointer_range(obj, ARRAY_BODY_START / WORD_SIZE, size / WORD_SIZE);
    }
    size
}

fn scan_code(visitor: &MarkingVisitor<'_>, _map: Map, obj: ObjectRef, size: usize) -> usize {
    visitor.visit_pointer_range(obj, ARRAY_BODY_START / WORD_SIZE, size / WORD_SIZE);
    size
}

fn scan_native_context(
    visitor: &MarkingVisitor<'_>,
    _map: Map,
    obj: ObjectRef,
    size: usize,
) -> usize {
    // The normalized-map cache is marked grey without enqueueing; hurry
    // finalizes it to black. Greying it first keeps the slot scan below from
    // pushing it.
    if let Some(cache) = HeapObject::new(obj).element(NATIVE_CONTEXT_CACHE_SLOT) {
        visitor.marker.white_to_grey_without_push(cache);
    }
    visitor.visit_pointer_range(obj, ARRAY_BODY_START / WORD_SIZE, size / WORD_SIZE);
    size
}
