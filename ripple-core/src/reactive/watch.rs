//! Watchers
//!
//! A watcher is an eager computation: when anything it read changes it is
//! scheduled on the batch queue and re-runs as part of the flush.
//!
//! # How Watchers Work
//!
//! 1. The source getter runs immediately, inside the watcher's context, to
//!    establish its dependencies and capture a baseline value.
//!
//! 2. When a dependency changes, the watcher's job is queued. Jobs run in
//!    the pure lane, before any render binding.
//!
//! 3. The job first resolves whether the watcher is really dirty. If so it
//!    re-runs the getter and calls the callback with the new and previous
//!    value, unless the value is unchanged.
//!
//! # Differences from Computed
//!
//! - Computeds return a cached value; watchers call back.
//! - Computeds are lazy (evaluated on read); watchers are eager.
//!
//! A watcher lives until [`WatchHandle::stop`] is called. Dropping the handle
//! does not stop it.

use std::cell::RefCell;
use std::collections::HashSet;
use std::rc::Rc;

use tracing::warn;

use super::computed::Computed;
use super::context::Context;
use super::runtime::Runtime;
use super::signal::{GetterRef, Ref, Signal};
use crate::graph::ContextKind;
use crate::value::{ContainerKind, Reactive, Value};

/// Options for [`Runtime::watch`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WatchOptions {
    /// Read every nested slot of the source value, so that a write anywhere
    /// inside it triggers the watcher.
    pub deep: bool,
    /// Call the callback right away with no previous value.
    pub immediate: bool,
    /// Stop after the first callback.
    pub once: bool,
}

impl WatchOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn deep(mut self, deep: bool) -> Self {
        self.deep = deep;
        self
    }

    pub fn immediate(mut self, immediate: bool) -> Self {
        self.immediate = immediate;
        self
    }

    pub fn once(mut self, once: bool) -> Self {
        self.once = once;
        self
    }
}

/// Something a watcher can observe.
///
/// Cells, computeds, getter cells and reactive containers convert into a
/// source; any other reads go through [`WatchSource::getter`]. A reactive
/// container is always watched deeply.
pub struct WatchSource<T> {
    getter: Rc<dyn Fn() -> T>,
    deep: bool,
}

impl<T> Clone for WatchSource<T> {
    fn clone(&self) -> Self {
        Self {
            getter: Rc::clone(&self.getter),
            deep: self.deep,
        }
    }
}

impl<T: 'static> WatchSource<T> {
    /// Watch whatever `getter` reads.
    pub fn getter(getter: impl Fn() -> T + 'static) -> Self {
        Self {
            getter: Rc::new(getter),
            deep: false,
        }
    }

    /// Watch several sources at once. The value is the list of their values.
    pub fn many(sources: impl IntoIterator<Item = WatchSource<T>>) -> WatchSource<Vec<T>> {
        let sources: Vec<WatchSource<T>> = sources.into_iter().collect();
        let deep = sources.iter().any(|source| source.deep);
        WatchSource {
            getter: Rc::new(move || {
                sources
                    .iter()
                    .map(|source| (source.getter)())
                    .collect::<Vec<T>>()
            }),
            deep,
        }
    }

    /// Whether this source is traversed deeply regardless of options.
    pub fn is_deep(&self) -> bool {
        self.deep
    }
}

impl WatchSource<Value> {
    /// Watch a dynamic value.
    ///
    /// Proxies and cells are accepted. Anything else cannot be observed: a
    /// warning is logged and the watcher never fires.
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Proxy(proxy) => proxy.into(),
            Value::Ref(cell) => cell.into(),
            other => {
                warn!(source = ?other, "invalid watch source; expected a proxy, a ref or a getter");
                Self::getter(|| Value::Null)
            }
        }
    }
}

impl<T: Clone + 'static> From<Signal<T>> for WatchSource<T> {
    fn from(signal: Signal<T>) -> Self {
        Self::getter(move || signal.get())
    }
}

impl<T: Clone + 'static> From<&Signal<T>> for WatchSource<T> {
    fn from(signal: &Signal<T>) -> Self {
        signal.clone().into()
    }
}

impl<T: Clone + PartialEq + 'static> From<Computed<T>> for WatchSource<T> {
    fn from(computed: Computed<T>) -> Self {
        Self::getter(move || computed.get())
    }
}

impl<T: Clone + PartialEq + 'static> From<&Computed<T>> for WatchSource<T> {
    fn from(computed: &Computed<T>) -> Self {
        computed.clone().into()
    }
}

impl<T: 'static> From<GetterRef<T>> for WatchSource<T> {
    fn from(cell: GetterRef<T>) -> Self {
        Self::getter(move || cell.get())
    }
}

impl From<Ref> for WatchSource<Value> {
    fn from(cell: Ref) -> Self {
        Self::getter(move || cell.get())
    }
}

impl From<&Ref> for WatchSource<Value> {
    fn from(cell: &Ref) -> Self {
        cell.clone().into()
    }
}

impl From<Reactive> for WatchSource<Value> {
    fn from(proxy: Reactive) -> Self {
        Self {
            getter: Rc::new(move || Value::Proxy(proxy.clone())),
            deep: true,
        }
    }
}

impl From<&Reactive> for WatchSource<Value> {
    fn from(proxy: &Reactive) -> Self {
        proxy.clone().into()
    }
}

/// Deep read of a watched value, used by `deep` watchers.
///
/// Reading every nested slot through the tracked API binds the watcher to
/// all of them.
pub trait Traverse {
    fn traverse(&self);
}

impl Traverse for Value {
    fn traverse(&self) {
        traverse_value(self, &mut HashSet::new());
    }
}

fn traverse_value(value: &Value, seen: &mut HashSet<usize>) {
    match value {
        Value::Ref(cell) => traverse_value(&cell.get(), seen),
        Value::Proxy(proxy) => {
            if !seen.insert(proxy.raw().addr()) {
                return;
            }
            if matches!(proxy.kind(), ContainerKind::WeakMap | ContainerKind::WeakSet) {
                return;
            }
            if let Ok(entries) = proxy.entries() {
                for (_, item) in entries {
                    traverse_value(&item, seen);
                }
            }
        }
        _ => {}
    }
}

macro_rules! traverse_leaf {
    ($($ty:ty),*) => {
        $(impl Traverse for $ty {
            fn traverse(&self) {}
        })*
    };
}

traverse_leaf!((), bool, i32, i64, u32, u64, usize, f32, f64, String, &'static str, Rc<str>);

impl<T: Traverse> Traverse for Vec<T> {
    fn traverse(&self) {
        self.iter().for_each(Traverse::traverse);
    }
}

impl<T: Traverse> Traverse for Option<T> {
    fn traverse(&self) {
        if let Some(value) = self {
            value.traverse();
        }
    }
}

impl<A: Traverse, B: Traverse> Traverse for (A, B) {
    fn traverse(&self) {
        self.0.traverse();
        self.1.traverse();
    }
}

/// Handle to a running watcher.
#[must_use = "dropping the handle leaves the watcher running with no way to stop it"]
#[derive(Debug, Clone)]
pub struct WatchHandle {
    context: Context,
}

impl WatchHandle {
    /// Stop the watcher. Stopping twice is a no-op.
    pub fn stop(&self) {
        self.context.stop();
    }

    pub fn is_stopped(&self) -> bool {
        self.context.is_stopped()
    }

    pub fn context(&self) -> &Context {
        &self.context
    }
}

struct WatchState<T, C> {
    old: RefCell<Option<T>>,
    callback: RefCell<C>,
}

impl Runtime {
    /// Call `callback` with the new and previous value whenever the source
    /// changes.
    ///
    /// Reactive container sources and `deep` watchers call back on every
    /// trigger, even when the top-level value is the same container.
    ///
    /// ```
    /// use ripple_core::{Runtime, WatchOptions};
    /// use std::{cell::RefCell, rc::Rc};
    ///
    /// let rt = Runtime::new();
    /// let count = rt.signal(0);
    /// let seen = Rc::new(RefCell::new(Vec::new()));
    ///
    /// let _watch = {
    ///     let seen = seen.clone();
    ///     rt.watch(&count, move |new: &i32, old: Option<&i32>| {
    ///         seen.borrow_mut().push((*new, old.copied()));
    ///     }, WatchOptions::default())
    /// };
    ///
    /// count.set(10);
    /// assert_eq!(*seen.borrow(), vec![(10, Some(0))]);
    /// ```
    pub fn watch<T, C>(
        &self,
        source: impl Into<WatchSource<T>>,
        callback: C,
        options: WatchOptions,
    ) -> WatchHandle
    where
        T: Clone + PartialEq + Traverse + 'static,
        C: FnMut(&T, Option<&T>) + 'static,
    {
        let source = source.into();
        let deep = options.deep || source.deep;
        let getter: Rc<dyn Fn() -> T> = if deep {
            let inner = source.getter;
            Rc::new(move || {
                let value = inner();
                value.traverse();
                value
            })
        } else {
            source.getter
        };

        let context = Context::new(self, ContextKind::Watch);
        let state = Rc::new(WatchState {
            old: RefCell::new(None),
            callback: RefCell::new(callback),
        });

        let job: Rc<dyn Fn()> = {
            let rt = self.downgrade();
            let id = context.id();
            let getter = Rc::clone(&getter);
            let state = Rc::clone(&state);
            let once = options.once;
            Rc::new(move || {
                let Some(rt) = rt.upgrade() else {
                    return;
                };
                if !rt.is_dirty(id) {
                    return;
                }
                let new = rt.run_context(id, || getter());
                let changed = deep || state.old.borrow().as_ref() != Some(&new);
                if !changed {
                    return;
                }
                let old = state.old.replace(Some(new.clone()));
                (state.callback.borrow_mut())(&new, old.as_ref());
                if once {
                    rt.stop_context(id);
                }
            })
        };
        self.with_context(context.id(), |node| node.job = Some(Rc::clone(&job)));

        if options.immediate {
            self.batch(|| job());
        } else {
            let baseline = context.run_with(|| getter());
            *state.old.borrow_mut() = Some(baseline);
        }

        WatchHandle { context }
    }

    /// Run `effect` now and again whenever anything it read changes.
    pub fn watch_effect(&self, effect: impl Fn() + 'static) -> WatchHandle {
        let context = Context::new(self, ContextKind::Watch);
        let job: Rc<dyn Fn()> = {
            let rt = self.downgrade();
            let id = context.id();
            Rc::new(move || {
                if let Some(rt) = rt.upgrade() {
                    if rt.is_dirty(id) {
                        Context::from_id(&rt, id).run();
                    }
                }
            })
        };
        let body: Rc<dyn Fn()> = Rc::new(effect);
        self.with_context(context.id(), |node| {
            node.body = Some(body);
            node.job = Some(job);
        });
        context.run();
        WatchHandle { context }
    }
}
