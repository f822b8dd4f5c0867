//! Ripple Core
//!
//! This crate provides a fine-grained reactive dependency-tracking engine.
//! Computed values and side-effect callbacks re-run exactly when the data
//! they read last time has changed, with no bookkeeping by the caller.
//! It implements:
//!
//! - Reactive primitives (cells, computeds, watchers, render bindings)
//! - Tracked handles over dynamic containers (objects, lists, maps, sets)
//! - Lazy multi-level invalidation with batched scheduling
//! - A structural differ that tells which list items are still fresh
//!
//! How a UI re-renders is left to the caller: the engine only decides
//! whether something changed and who must be told.
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - `reactive`: the runtime, contexts and the reactive primitives
//! - `graph`: arena storage for the dependency graph and the batch queue
//! - `value`: the dynamic value model and per-kind container handlers
//! - `diff`: the structural differ
//!
//! # Example
//!
//! ```
//! use ripple_core::{Raw, Runtime, WatchOptions};
//! use std::{cell::RefCell, rc::Rc};
//!
//! let rt = Runtime::new();
//! let state = rt.reactive(Raw::object([("count", 0)]));
//!
//! // A derived value
//! let double = {
//!     let state = state.clone();
//!     rt.computed(move |_| state.get("count").ok().and_then(|v| v.as_f64()).unwrap_or(0.0) * 2.0)
//! };
//!
//! // A watcher on it
//! let calls = Rc::new(RefCell::new(Vec::new()));
//! let _watch = {
//!     let calls = calls.clone();
//!     rt.watch(&double, move |new: &f64, old: Option<&f64>| {
//!         calls.borrow_mut().push((*new, old.copied()));
//!     }, WatchOptions::default())
//! };
//!
//! state.set("count", 5).unwrap();
//! assert_eq!(double.get(), 10.0);
//! assert_eq!(*calls.borrow(), vec![(10.0, Some(0.0))]);
//! ```

pub mod config;
pub mod diff;
pub mod error;
pub mod graph;
pub mod reactive;
pub mod value;

pub use config::{RuntimeBuilder, RuntimeConfig};
pub use diff::{DiffAction, DiffOp, DiffResult, Freshness};
pub use error::{ReactiveError, Result};
pub use graph::{ContextId, ContextKind, DirtyLevel, ObserverId};
pub use reactive::{
    Computed, Context, ContextGuard, GetterRef, ListenerId, Mutation, PropChange, Ref, Runtime,
    Signal, SuspendGuard, Traverse, WatchHandle, WatchOptions, WatchSource, WatcherId,
};
pub use value::{ContainerKind, Key, PropRef, Raw, Reactive, Value};
