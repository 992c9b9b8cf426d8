//! Incremental tri-color marking for a generational managed-object heap.
//!
//! The crate traverses the reachable object graph in many small slices
//! interleaved with mutator execution, so a compacting sweep can reclaim
//! memory without a long pause. The pieces: atomic per-page color bitmaps, a
//! grey work-list with a bailout side-channel, a write barrier that keeps
//! the no-black-to-white invariant alive under mutation, and a pacer that
//! sizes each slice so marking finishes before the heap hits its allocation
//! limit.
//!
//! The sweeper and the compacting collector are external; they appear here
//! only as the [`interfaces::Compactor`] seam. The embedder's wrapper tracer
//! is the [`interfaces::EmbedderTracer`] seam.

pub mod barrier;
pub mod bitmap;
pub mod black_allocation;
pub mod concurrent;
pub mod config;
pub mod error;
pub mod heap;
pub mod interfaces;
pub mod marker;
pub mod object;
pub mod page;
pub mod pacer;
pub mod retained_maps;
pub mod roots;
pub mod space;
pub mod test_utils;
pub mod types;
pub mod visitor;
pub mod worklist;

pub use barrier::{BarrierMode, WriteBarrier};
pub use bitmap::Color;
pub use config::{GcReason, MarkingConfig};
pub use error::{GcError, GcResult};
pub use heap::Heap;
pub use marker::{
    CompletionAction, ForceCompletionAction, IncrementalMarker, MarkingState, RequestType,
    StepOrigin,
};
pub use types::{Address, ObjectRef};
pub use worklist::MarkingWorklist;
