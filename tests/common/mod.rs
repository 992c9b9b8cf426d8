//! Shared helpers for the integration tests.
#![allow(dead_code)]

use greymark::marker::{CompletionAction, ForceCompletionAction, StepOrigin};
use greymark::test_utils::TestFixture;
use greymark::{MarkingState, RequestType};

pub const BIG_BUDGET: usize = 64 * 1024 * 1024;

/// One forced step with an effectively unlimited budget.
pub fn drain(fixture: &TestFixture) -> usize {
    fixture.marker.step(
        BIG_BUDGET,
        CompletionAction::GcViaStackGuard,
        ForceCompletionAction::ForceCompletion,
        StepOrigin::Mutator,
    )
}

/// Drive the marker through the finalization handshake until `Complete`.
pub fn run_to_complete(fixture: &TestFixture) {
    for _ in 0..64 {
        drain(fixture);
        if fixture.marker.state() == MarkingState::Complete {
            return;
        }
        if fixture.marker.request_type() == RequestType::Finalization
            && !fixture.marker.finalize_marking_completed()
        {
            fixture.marker.finalize_incrementally();
        }
    }
    panic!("marking did not complete");
}
