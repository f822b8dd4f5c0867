//! Error types for the reactive engine.
//!
//! Only caller bugs surface as errors. Failures inside user computations are
//! not caught here; they unwind through whatever scheduled the run.

use thiserror::Error;

use crate::value::ContainerKind;

/// Errors returned by reactive handles.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReactiveError {
    /// A computed without a setter was assigned.
    #[error("computed value is readonly")]
    ReadonlyComputed,

    /// A getter-derived reference was assigned.
    #[error("getter-derived reference cannot be assigned")]
    GetterRefReadonly,

    /// A ref holding a primitive was assigned a container.
    #[error("not allowed to change primitive to object")]
    PrimitiveToObject,

    /// The container kind does not support this operation.
    #[error("`{op}` is not supported on {kind} containers")]
    Unsupported {
        /// Name of the rejected operation.
        op: &'static str,
        /// Kind of the container it was attempted on.
        kind: ContainerKind,
    },

    /// The key cannot address a slot in this container.
    #[error("invalid key `{key}` for {kind} container")]
    InvalidKey {
        /// Debug rendering of the offending key.
        key: String,
        /// Kind of the container.
        kind: ContainerKind,
    },

    /// Weak collections only accept object keys.
    #[error("weak collections only accept object keys")]
    InvalidWeakKey,

    /// A positional list operation addressed a slot past the end.
    #[error("index {index} out of bounds for length {len}")]
    IndexOutOfBounds {
        /// Requested index.
        index: usize,
        /// Length of the list at the time of the call.
        len: usize,
    },
}

/// Result alias used across the crate.
pub type Result<T, E = ReactiveError> = std::result::Result<T, E>;
