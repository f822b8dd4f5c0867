//! Computed Values
//!
//! A computed is a cached derived value that re-evaluates only when its
//! dependencies change.
//!
//! # How Computeds Work
//!
//! 1. On first read, the getter runs inside the computed's context and the
//!    result is cached.
//!
//! 2. A write to a direct dependency marks the computed dirty. The computed
//!    does not re-run; it marks its own readers "maybe dirty" instead.
//!
//! 3. On the next read (or when a downstream reader resolves its own maybe
//!    dirty state), the computed re-runs if needed. Only when the new value
//!    differs are its readers escalated to dirty.
//!
//! # Why This Matters
//!
//! - A cell changes and ten computeds depend on it
//! - Only the computeds actually read recompute
//! - A computed whose value comes out the same stops the wave there, so
//!   downstream watchers and renders never run for a no-op
//!
//! # Side Effects
//!
//! A getter that writes to one of its own inputs leaves the computed dirty
//! right after it ran. That is reported with a warning and readers are told
//! the value may be stale.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use tracing::warn;

use super::context::Context;
use super::observer::{Observer, Prop};
use super::runtime::{Runtime, WeakRuntime};
use crate::error::{ReactiveError, Result};
use crate::graph::{ContextId, ContextKind, DirtyLevel, ObserverId};

type Getter<T> = Box<dyn Fn(Option<&T>) -> T>;
type Setter<T> = Box<dyn Fn(T)>;

struct ComputedInner<T> {
    rt: WeakRuntime,
    context: ContextId,
    output: ObserverId,
    getter: Getter<T>,
    setter: Option<Setter<T>>,
    value: RefCell<Option<T>>,
}

impl<T> Drop for ComputedInner<T> {
    fn drop(&mut self) {
        if let Some(rt) = self.rt.upgrade() {
            rt.release_context(self.context);
            rt.release_observer(self.output);
        }
    }
}

impl<T: Clone + PartialEq + 'static> ComputedInner<T> {
    /// Bring the cached value up to date and return it.
    fn evaluate(&self, rt: &Runtime) -> T {
        let cached = self.value.borrow().clone();
        if let Some(value) = cached {
            if !rt.is_dirty(self.context) {
                return value;
            }
        }

        let previous = self.value.borrow().clone();
        let next = rt.run_context(self.context, || (self.getter)(previous.as_ref()));
        let changed = previous.as_ref() != Some(&next);
        *self.value.borrow_mut() = Some(next.clone());
        if changed {
            rt.trigger(self.output, &Prop::Value, DirtyLevel::Dirty);
        }
        next
    }
}

/// A lazily evaluated, cached derived value.
///
/// # Example
///
/// ```
/// use ripple_core::Runtime;
///
/// let rt = Runtime::new();
/// let count = rt.signal(2);
/// let squared = {
///     let count = count.clone();
///     rt.computed(move |_| count.get() * count.get())
/// };
///
/// assert_eq!(squared.get(), 4);
/// count.set(3);
/// assert_eq!(squared.get(), 9);
/// ```
pub struct Computed<T> {
    rt: Runtime,
    inner: Rc<ComputedInner<T>>,
}

impl<T> Clone for Computed<T> {
    fn clone(&self) -> Self {
        Self {
            rt: self.rt.clone(),
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<T: Clone + PartialEq + 'static> Computed<T> {
    fn build(rt: &Runtime, getter: Getter<T>, setter: Option<Setter<T>>) -> Self {
        let context = rt.create_context(ContextKind::Computed);
        let output = rt.create_observer(Observer::output(context));
        let inner = Rc::new(ComputedInner {
            rt: rt.downgrade(),
            context,
            output,
            getter,
            setter,
            value: RefCell::new(None),
        });

        let refresh: Rc<dyn Fn()> = {
            let weak = Rc::downgrade(&inner);
            let rt = rt.downgrade();
            Rc::new(move || {
                if let (Some(inner), Some(rt)) = (weak.upgrade(), rt.upgrade()) {
                    inner.evaluate(&rt);
                }
            })
        };
        rt.with_context(context, |node| {
            node.output = Some(output);
            node.refresh = Some(refresh);
        });

        Self {
            rt: rt.clone(),
            inner,
        }
    }

    /// Get the current value, recomputing if needed.
    ///
    /// If called within a context, this also records the read.
    pub fn get(&self) -> T {
        let value = self.inner.evaluate(&self.rt);
        self.rt.use_prop(self.inner.output, Prop::Value);

        let level = self.rt.dirty_level(self.inner.context);
        if level.is_some_and(|l| l >= DirtyLevel::MaybeDirtyComputedSideEffect) {
            warn!(
                context = ?self.inner.context,
                "computed is still dirty after its getter ran; \
                 the getter may be mutating its own dependencies"
            );
            self.rt.trigger(
                self.inner.output,
                &Prop::Value,
                DirtyLevel::MaybeDirtyComputedSideEffect,
            );
        }
        value
    }

    /// The cached value, without recomputing or tracking.
    pub fn peek(&self) -> Option<T> {
        self.inner.value.borrow().clone()
    }

    /// Assign through the setter.
    pub fn set(&self, value: T) -> Result<()> {
        match &self.inner.setter {
            Some(setter) => {
                setter(value);
                Ok(())
            }
            None => Err(ReactiveError::ReadonlyComputed),
        }
    }

    pub fn is_readonly(&self) -> bool {
        self.inner.setter.is_none()
    }
}

impl<T> Computed<T> {
    /// Handle of the computed's context.
    pub fn id(&self) -> ContextId {
        self.inner.context
    }

    /// The computed's context.
    pub fn context(&self) -> Context {
        Context::from_id(&self.rt, self.inner.context)
    }

    /// Current dirty level, `None` once stopped.
    pub fn dirty_level(&self) -> Option<DirtyLevel> {
        self.rt.dirty_level(self.inner.context)
    }

    /// Detach the computed from the graph. The cached value is frozen.
    pub fn stop(&self) {
        self.rt.stop_context(self.inner.context);
    }

    /// Number of contexts that read this computed during their latest run.
    pub fn subscriber_count(&self) -> usize {
        self.rt.reader_count(self.inner.output, &Prop::Value)
    }
}

impl<T: fmt::Debug> fmt::Debug for Computed<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Computed")
            .field("id", &self.inner.context)
            .field("dirty", &self.rt.dirty_level(self.inner.context))
            .field("value", &self.inner.value.borrow())
            .finish()
    }
}

impl Runtime {
    /// Create a read-only computed. The getter receives the previous value.
    pub fn computed<T, F>(&self, getter: F) -> Computed<T>
    where
        T: Clone + PartialEq + 'static,
        F: Fn(Option<&T>) -> T + 'static,
    {
        Computed::build(self, Box::new(getter), None)
    }

    /// Create a writable computed.
    pub fn computed_with_setter<T, F, S>(&self, getter: F, setter: S) -> Computed<T>
    where
        T: Clone + PartialEq + 'static,
        F: Fn(Option<&T>) -> T + 'static,
        S: Fn(T) + 'static,
    {
        Computed::build(self, Box::new(getter), Some(Box::new(setter)))
    }
}
