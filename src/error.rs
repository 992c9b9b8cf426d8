//! Error types for the marking core.
//!
//! The marker has no recoverable errors in steady state: steps either make
//! progress or defer, and internal invariant violations are fatal panics.
//! The only fallible API surface is cycle start-up, where the lifecycle
//! guards can reject the request.

use thiserror::Error;

use crate::marker::MarkingState;

/// Errors surfaced by the lifecycle entry points.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GcError {
    #[error("incremental marking is disabled by configuration")]
    Disabled,
    #[error("cannot start marking from state {0:?}")]
    InvalidState(MarkingState),
    #[error("heap is already inside a garbage collection")]
    GcInProgress,
    #[error("heap deserialization has not completed")]
    DeserializationIncomplete,
    #[error("a serializer is active")]
    SerializerActive,
}

/// Result type for GC lifecycle operations.
pub type GcResult<T> = Result<T, GcError>;
