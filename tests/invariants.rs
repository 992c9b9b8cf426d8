//! Property-based invariants of the marking core.

mod common;

use std::collections::HashSet;

use common::run_to_complete;
use proptest::prelude::*;

use greymark::object::HeapObject;
use greymark::test_utils::TestFixture;
use greymark::types::{ObjectRef, WORD_SIZE};
use greymark::{Color, GcReason};

/// A small random object graph: `fields[i]` lists the objects object `i`
/// points at.
#[derive(Debug, Clone)]
struct GraphSpec {
    fields: Vec<Vec<usize>>,
    roots: Vec<usize>,
}

fn graph_strategy() -> impl Strategy<Value = GraphSpec> {
    (2usize..24).prop_flat_map(|n| {
        let edges = prop::collection::vec(prop::collection::vec(0..n, 0..4), n);
        let roots = prop::collection::vec(0..n, 1..4);
        (edges, roots).prop_map(|(fields, roots)| GraphSpec { fields, roots })
    })
}

fn build_graph(fixture: &TestFixture, spec: &GraphSpec) -> Vec<ObjectRef> {
    let heap = &fixture.heap;
    let objects: Vec<ObjectRef> = spec
        .fields
        .iter()
        .map(|targets| heap.allocate_array(targets.len().max(1)))
        .collect();
    for (index, targets) in spec.fields.iter().enumerate() {
        let view = HeapObject::new(objects[index]);
        for (slot, &target) in targets.iter().enumerate() {
            view.set_element(slot, Some(objects[target]));
        }
    }
    for &root in &spec.roots {
        heap.add_root(objects[root]);
    }
    objects
}

fn reachable(spec: &GraphSpec) -> HashSet<usize> {
    let mut seen: HashSet<usize> = HashSet::new();
    let mut stack: Vec<usize> = spec.roots.clone();
    while let Some(index) = stack.pop() {
        if seen.insert(index) {
            stack.extend(spec.fields[index].iter().copied());
        }
    }
    seen
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// After a full cycle: every reachable object is black, no black object
    /// points at a white one, and the work-list is empty.
    #[test]
    fn marking_reaches_a_consistent_fixpoint(spec in graph_strategy()) {
        let fixture = TestFixture::new();
        let objects = build_graph(&fixture, &spec);

        fixture.marker.start(GcReason::Testing).unwrap();
        run_to_complete(&fixture);

        let live = reachable(&spec);
        for (index, obj) in objects.iter().enumerate() {
            if live.contains(&index) {
                prop_assert_eq!(fixture.heap.color_of(*obj), Color::Black);
            } else {
                prop_assert_eq!(fixture.heap.color_of(*obj), Color::White);
            }
        }
        // No black-to-white edge anywhere.
        for (index, targets) in spec.fields.iter().enumerate() {
            if fixture.heap.color_of(objects[index]) == Color::Black {
                for &target in targets {
                    prop_assert_ne!(fixture.heap.color_of(objects[target]), Color::White);
                }
            }
        }
        prop_assert!(fixture.marker.worklist().is_empty());
        fixture.marker.finalize();
    }

    /// Barrier writes during marking never leave a black-to-white edge once
    /// the cycle completes.
    #[test]
    fn barrier_preserves_the_strong_invariant(
        spec in graph_strategy(),
        writes in prop::collection::vec((0usize..24, 0usize..4, 0usize..24), 0..12),
    ) {
        let fixture = TestFixture::new();
        let objects = build_graph(&fixture, &spec);

        fixture.marker.start(GcReason::Testing).unwrap();
        // Interleave mutation with small steps.
        for (host, slot, target) in writes {
            let host = host % objects.len();
            let target = target % objects.len();
            let slot = slot % spec.fields[host].len().max(1);
            fixture.marker.write_field(objects[host], 2 + slot, Some(objects[target]));
            fixture.marker.step(
                4 * 1024,
                greymark::marker::CompletionAction::NoGcViaStackGuard,
                greymark::marker::ForceCompletionAction::DoNotForceCompletion,
                greymark::marker::StepOrigin::Mutator,
            );
        }
        run_to_complete(&fixture);

        for obj in &objects {
            if fixture.heap.color_of(*obj) == Color::Black {
                let view = HeapObject::new(*obj);
                let len = view.length();
                for slot in 0..len {
                    if let Some(target) = view.element(slot) {
                        prop_assert_ne!(fixture.heap.color_of(target), Color::White);
                    }
                }
            }
        }
        fixture.marker.finalize();
    }

    /// Left trimming never lightens the color, and the new start is on the
    /// work-list exactly when it is grey.
    #[test]
    fn left_trimming_preserves_color(
        start_black in any::<bool>(),
        trim_words in 1usize..8,
    ) {
        let fixture = TestFixture::new();
        let heap = &fixture.heap;
        let map = heap.new_plain_map(1);
        heap.add_root(heap.allocate_plain(map));
        fixture.marker.start(GcReason::Testing).unwrap();

        let array = heap.allocate_array(16);
        let page = heap.page_of_object(array);
        if start_black {
            page.white_to_black(array.to_address());
        } else {
            page.white_to_grey(array.to_address());
        }
        let from_color = page.color(array.to_address());

        let to_addr = array.to_address() + trim_words * WORD_SIZE;
        let to = ObjectRef::from_address(to_addr).unwrap();
        fixture.marker.notify_left_trimming(array, to);

        let to_color = page.color(to_addr);
        match from_color {
            Color::Black => prop_assert_eq!(to_color, Color::Black),
            Color::Grey => prop_assert_eq!(to_color, Color::Grey),
            _ => prop_assert!(false, "unexpected source color"),
        }

        // Grey means on the list; black means not.
        let mut on_list = Vec::new();
        while let Some(entry) = fixture.marker.worklist().pop() {
            on_list.push(entry);
        }
        prop_assert_eq!(on_list.iter().filter(|o| **o == to).count() == 1,
                        to_color == Color::Grey);
        fixture.marker.stop();
    }
}

/// Legal transitions racing across threads never manufacture the impossible
/// pattern, and every object ends the race grey or black.
#[test]
fn racing_transitions_never_produce_impossible_colors() {
    use greymark::bitmap::MarkBitmap;
    use std::sync::Arc;

    let bitmap = Arc::new(MarkBitmap::new(4096));
    std::thread::scope(|scope| {
        for worker in 0..8 {
            let bitmap = Arc::clone(&bitmap);
            scope.spawn(move || {
                for word in (0..4096).step_by(2) {
                    if worker % 2 == 0 {
                        if bitmap.white_to_grey(word) {
                            bitmap.grey_to_black(word);
                        }
                    } else {
                        bitmap.white_to_black(word);
                    }
                }
            });
        }
    });
    for word in (0..4096).step_by(2) {
        let color = bitmap.color(word);
        assert!(
            matches!(color, Color::Grey | Color::Black),
            "word {word} ended as {color:?}"
        );
        assert_ne!(color, Color::Impossible);
    }
}

/// The pacer keeps marking ahead of allocation: a mutator that allocates
/// steadily sees the cycle finish well before the old-generation limit.
#[test]
fn observer_driven_marking_keeps_up_with_allocation() {
    let fixture = TestFixture::new();
    let heap = &fixture.heap;
    let map = heap.new_plain_map(8);
    let mut previous = heap.allocate_plain(map);
    heap.add_root(previous);
    // A chain long enough that marking cannot finish in one slice.
    for _ in 0..20_000 {
        let next = heap.allocate_plain(map);
        HeapObject::new(previous).set_raw_field(1, next.as_usize());
        previous = next;
    }

    let budget = 16 * 1024 * 1024;
    heap.set_old_generation_allocation_limit(heap.promoted_space_size() + budget);
    fixture.marker.start(GcReason::Testing).unwrap();

    let mut allocated = 0usize;
    while fixture.marker.request_type() == greymark::RequestType::None {
        heap.allocate_array(16);
        allocated += 18 * WORD_SIZE;
        assert!(
            allocated < budget,
            "marking fell behind allocation: {allocated} bytes allocated"
        );
    }
    fixture.marker.finalize();
}

/// Stopping twice looks exactly like stopping once.
#[test]
fn stop_is_idempotent_about_observable_state() {
    let fixture = TestFixture::new();
    let map = fixture.heap.new_plain_map(1);
    fixture.heap.add_root(fixture.heap.allocate_plain(map));
    fixture.marker.start(GcReason::Testing).unwrap();

    fixture.marker.stop();
    let state = fixture.marker.state();
    let compacting = fixture.marker.is_compacting();
    let hurry = fixture.marker.should_hurry();
    fixture.marker.stop();
    assert_eq!(fixture.marker.state(), state);
    assert_eq!(fixture.marker.is_compacting(), compacting);
    assert_eq!(fixture.marker.should_hurry(), hurry);
}
