//! Shared wiring for tests and examples: a heap plus a marker with
//! recording collaborators.

use std::sync::Arc;

use crate::config::MarkingConfig;
use crate::heap::Heap;
use crate::interfaces::mocks::{NullEmbedderTracer, RecordingCompactor};
use crate::interfaces::{Compactor, EmbedderTracer};
use crate::marker::IncrementalMarker;

/// A heap and marker wired to recording mocks.
///
/// # Examples
///
/// ```
/// use greymark::test_utils::TestFixture;
///
/// let fixture = TestFixture::new();
/// assert!(fixture.marker.is_stopped());
/// assert!(fixture.compactor.recorded_slots().is_empty());
/// ```
pub struct TestFixture {
    pub heap: Arc<Heap>,
    pub marker: Arc<IncrementalMarker>,
    pub compactor: Arc<RecordingCompactor>,
    pub embedder: Arc<NullEmbedderTracer>,
}

impl TestFixture {
    pub fn new() -> TestFixture {
        TestFixture::with_config(MarkingConfig::default())
    }

    pub fn with_config(config: MarkingConfig) -> TestFixture {
        let heap = Heap::new();
        let compactor = Arc::new(RecordingCompactor::default());
        let embedder = Arc::new(NullEmbedderTracer::default());
        let marker = IncrementalMarker::new(
            &heap,
            config,
            Arc::clone(&compactor) as Arc<dyn Compactor>,
            Arc::clone(&embedder) as Arc<dyn EmbedderTracer>,
        );
        TestFixture {
            heap,
            marker,
            compactor,
            embedder,
        }
    }

    /// Build a fixture with a custom embedder tracer. The caller keeps its
    /// own handle to the tracer; the `embedder` field of the returned
    /// fixture is an unused placeholder.
    pub fn with_embedder(config: MarkingConfig, embedder: Arc<dyn EmbedderTracer>) -> TestFixture {
        let heap = Heap::new();
        let compactor = Arc::new(RecordingCompactor::default());
        let marker = IncrementalMarker::new(
            &heap,
            config,
            Arc::clone(&compactor) as Arc<dyn Compactor>,
            embedder,
        );
        TestFixture {
            heap,
            marker,
            compactor,
            embedder: Arc::new(NullEmbedderTracer::default()),
        }
    }

    /// What the sweeper would do between cycles: reset every mark bit.
    pub fn clear_all_marks(&self) {
        self.heap.for_each_page(|page| page.clear_marks());
    }
}

impl Default for TestFixture {
    fn default() -> Self {
        Self::new()
    }
}
