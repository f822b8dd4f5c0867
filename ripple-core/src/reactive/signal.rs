//! Cells
//!
//! A cell holds one value and tracks which contexts read it.
//!
//! # How Cells Work
//!
//! 1. When a cell is read within a context (computed, watcher, render
//!    binding), the cell's observer records that context as a reader.
//!
//! 2. When the cell is written with a value that differs from the current
//!    one, every reader is marked dirty and scheduled.
//!
//! 3. Writing an identical value is a no-op.
//!
//! [`Signal`] is the typed cell. [`Ref`] is the dynamic cell over [`Value`]
//! that containers unwrap transparently, and [`GetterRef`] is a read-only
//! cell backed by a closure.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use super::observer::{Observer, Prop};
use super::runtime::{Runtime, WeakRuntime};
use crate::error::{ReactiveError, Result};
use crate::graph::{DirtyLevel, ObserverId};
use crate::value::Value;

struct SignalInner<T> {
    value: RefCell<T>,
    observer: ObserverId,
    rt: WeakRuntime,
}

impl<T> Drop for SignalInner<T> {
    fn drop(&mut self) {
        if let Some(rt) = self.rt.upgrade() {
            rt.release_observer(self.observer);
        }
    }
}

/// A reactive cell holding a value of type `T`.
///
/// Clones share the same cell.
///
/// # Example
///
/// ```
/// use ripple_core::Runtime;
///
/// let rt = Runtime::new();
/// let count = rt.signal(0);
///
/// count.set(5);
/// count.update(|n| n + 1);
/// assert_eq!(count.get(), 6);
/// ```
pub struct Signal<T> {
    rt: Runtime,
    inner: Rc<SignalInner<T>>,
}

impl<T> Clone for Signal<T> {
    fn clone(&self) -> Self {
        Self {
            rt: self.rt.clone(),
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<T: 'static> Signal<T> {
    /// Create a cell on `rt`.
    pub fn new(rt: &Runtime, value: T) -> Self {
        let observer = rt.create_observer(Observer::cell());
        Self {
            rt: rt.clone(),
            inner: Rc::new(SignalInner {
                value: RefCell::new(value),
                observer,
                rt: rt.downgrade(),
            }),
        }
    }

    /// Handle of the cell's observer.
    pub fn id(&self) -> ObserverId {
        self.inner.observer
    }

    /// The runtime this cell belongs to.
    pub fn runtime(&self) -> &Runtime {
        &self.rt
    }

    /// Record a read by the active context without touching the value.
    pub fn track(&self) {
        self.rt.use_prop(self.inner.observer, Prop::Value);
    }

    /// Mark every reader dirty without changing the value.
    ///
    /// Use this after mutating the value in place through [`Signal::with_mut`].
    pub fn notify(&self) {
        self.rt
            .set_prop(self.inner.observer, Prop::Value, None, DirtyLevel::Dirty);
    }

    /// Borrow the value, tracking the read.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        self.track();
        f(&self.inner.value.borrow())
    }

    /// Mutate the value in place. Readers are not notified.
    pub fn with_mut<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        f(&mut self.inner.value.borrow_mut())
    }

    /// Number of contexts that read this cell during their latest run.
    pub fn subscriber_count(&self) -> usize {
        self.rt.reader_count(self.inner.observer, &Prop::Value)
    }
}

impl<T: Clone + 'static> Signal<T> {
    /// Get the current value.
    ///
    /// If called within a context, this also records the read.
    pub fn get(&self) -> T {
        self.track();
        self.inner.value.borrow().clone()
    }

    /// Get the current value without recording the read.
    pub fn get_untracked(&self) -> T {
        self.inner.value.borrow().clone()
    }
}

impl<T: PartialEq + 'static> Signal<T> {
    /// Set a new value. Readers are notified only if it differs.
    pub fn set(&self, value: T) {
        {
            let mut slot = self.inner.value.borrow_mut();
            if *slot == value {
                return;
            }
            *slot = value;
        }
        self.notify();
    }

    /// Replace the value with `f(current)`.
    pub fn update(&self, f: impl FnOnce(&T) -> T) {
        let next = f(&self.inner.value.borrow());
        self.set(next);
    }
}

impl<T: fmt::Debug> fmt::Debug for Signal<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signal")
            .field("id", &self.inner.observer)
            .field("value", &self.inner.value.borrow())
            .finish()
    }
}

/// A dynamic reactive cell over [`Value`].
///
/// A container assigned into a `Ref` is stored raw and comes back wrapped,
/// and a `Ref` stored in a plain object slot is read and written through
/// transparently.
#[derive(Clone)]
pub struct Ref {
    cell: Signal<Value>,
}

impl Ref {
    /// Create a cell holding `value`.
    pub fn new(rt: &Runtime, value: impl Into<Value>) -> Self {
        Self {
            cell: Signal::new(rt, value.into().into_raw()),
        }
    }

    /// The current value, with containers wrapped. Tracks the read.
    pub fn get(&self) -> Value {
        let value = self.cell.get();
        self.cell.runtime().wrap(value)
    }

    /// The stored value, unwrapped and untracked.
    pub fn get_untracked(&self) -> Value {
        self.cell.get_untracked()
    }

    /// Assign a new value.
    ///
    /// Replacing a primitive with a container is rejected.
    pub fn set(&self, value: impl Into<Value>) -> Result<()> {
        let value = value.into().into_raw();
        if value.is_container() && self.cell.with_mut(|current| current.is_primitive()) {
            return Err(ReactiveError::PrimitiveToObject);
        }
        self.cell.set(value);
        Ok(())
    }

    /// Mark readers dirty without changing the value.
    pub fn notify(&self) {
        self.cell.notify();
    }

    pub fn id(&self) -> ObserverId {
        self.cell.id()
    }

    pub fn runtime(&self) -> &Runtime {
        self.cell.runtime()
    }

    /// Whether both handles share one cell.
    pub fn ptr_eq(&self, other: &Ref) -> bool {
        Rc::ptr_eq(&self.cell.inner, &other.cell.inner)
    }

    /// Address of the cell, stable for its lifetime.
    pub fn addr(&self) -> usize {
        Rc::as_ptr(&self.cell.inner) as *const () as usize
    }
}

impl fmt::Debug for Ref {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Ref").field(&self.get_untracked()).finish()
    }
}

/// A read-only cell whose value comes from a closure.
///
/// Reads are tracked through whatever the closure reads.
pub struct GetterRef<T> {
    getter: Rc<dyn Fn() -> T>,
}

impl<T> Clone for GetterRef<T> {
    fn clone(&self) -> Self {
        Self {
            getter: Rc::clone(&self.getter),
        }
    }
}

impl<T: 'static> GetterRef<T> {
    pub fn new(getter: impl Fn() -> T + 'static) -> Self {
        Self {
            getter: Rc::new(getter),
        }
    }

    pub fn get(&self) -> T {
        (self.getter)()
    }

    /// Always fails: a getter cell cannot be assigned.
    pub fn set(&self, _value: T) -> Result<()> {
        Err(ReactiveError::GetterRefReadonly)
    }
}

impl Runtime {
    /// Create a typed cell.
    pub fn signal<T: 'static>(&self, value: T) -> Signal<T> {
        Signal::new(self, value)
    }

    /// Create a dynamic cell.
    pub fn new_ref(&self, value: impl Into<Value>) -> Ref {
        Ref::new(self, value)
    }

    /// Create a read-only cell backed by `getter`.
    pub fn getter_ref<T: 'static>(&self, getter: impl Fn() -> T + 'static) -> GetterRef<T> {
        GetterRef::new(getter)
    }
}
