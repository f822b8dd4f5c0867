//! Reactive Primitives
//!
//! This module implements the reactive system on top of the dependency
//! graph: cells, computeds, watchers and render bindings.
//!
//! # Concepts
//!
//! ## Cells
//!
//! A cell ([`Signal`], [`Ref`]) holds mutable state. Reading it within a
//! context registers the context as a reader; writing a different value
//! marks every reader dirty.
//!
//! ## Computeds
//!
//! A [`Computed`] is a derived value that caches its result and re-evaluates
//! only when read after one of its dependencies really changed.
//!
//! ## Watchers
//!
//! A watcher ([`Runtime::watch`], [`Runtime::watch_effect`]) is an eager
//! computation that is scheduled whenever anything it read changes. Render
//! bindings ([`Context::bind_to`]) are scheduled the same way but always
//! after every watcher has settled.
//!
//! # Implementation Notes
//!
//! Each [`Runtime`] keeps an explicit stack of active contexts. A read
//! checks the top of the stack and, if a context is running, records the
//! dependency on both sides of the graph. Nothing is thread-local or global,
//! so independent runtimes never see each other's reads.

mod computed;
mod context;
mod observer;
mod runtime;
mod signal;
mod watch;

pub use computed::Computed;
pub use context::{Context, ContextGuard};
pub use observer::{ListenerId, Mutation, PropChange, WatcherId};
pub use runtime::{Runtime, SuspendGuard};
pub use signal::{GetterRef, Ref, Signal};
pub use watch::{Traverse, WatchHandle, WatchOptions, WatchSource};

pub(crate) use observer::Prop;
