//! Reactive Runtime
//!
//! The runtime is the central coordinator that connects cells, computeds,
//! watchers and render bindings. It owns the dependency graph and schedules
//! updates when observed state changes.
//!
//! # How It Works
//!
//! 1. Every re-runnable computation is a context node in an arena. Every
//!    reactive container or cell has an observer in a second arena.
//!
//! 2. While a context runs it sits on top of the runtime's context stack, and
//!    every tracked read binds it to the observer key that was read.
//!
//! 3. A write raises the dirty level of the key's current readers. Computeds
//!    pass a "maybe dirty" mark on to their own readers immediately; other
//!    contexts queue their job on the batch queue.
//!
//! 4. The outermost batch end drains the queue. Each job first resolves
//!    "maybe dirty" by pulling upstream computeds, and only re-runs if one
//!    of them really changed.
//!
//! # Isolation
//!
//! There is no global state. Each `Runtime` owns its own stack, arenas and
//! queue, and handles created from it only ever talk to it. The runtime is
//! `!Send`: a tracking scope can never migrate across threads.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::rc::{Rc, Weak};

use smallvec::SmallVec;
use tracing::{debug, error, trace};

use super::observer::{Observer, Prop};
use crate::config::{RuntimeBuilder, RuntimeConfig};
use crate::graph::{
    Arena, BatchQueue, ContextId, ContextKind, ContextNode, DirtyLevel, ObserverId, Pending,
};
use crate::value::Raw;

pub(crate) struct RuntimeInner {
    pub(crate) config: RuntimeConfig,
    pub(crate) contexts: RefCell<Arena<ContextNode>>,
    pub(crate) observers: RefCell<Arena<Observer>>,
    registry: RefCell<HashMap<usize, ObserverId>>,
    stack: RefCell<Vec<Option<ContextId>>>,
    pub(crate) queue: RefCell<BatchQueue>,
    graveyard: RefCell<Vec<Released>>,
    next_handle: Cell<u64>,
    sweep_at: Cell<usize>,
}

enum Released {
    Context(ContextId),
    Observer(ObserverId),
}

/// Handle to a reactive graph.
///
/// This is cheap to clone; clones share the same graph.
///
/// # Example
///
/// ```
/// use ripple_core::{Raw, Runtime, WatchOptions};
///
/// let rt = Runtime::new();
/// let state = rt.reactive(Raw::object([("count", 0)]));
///
/// let doubled = {
///     let state = state.clone();
///     rt.computed(move |_| state.get("count").unwrap().as_f64().unwrap_or(0.0) * 2.0)
/// };
///
/// state.set("count", 5).unwrap();
/// assert_eq!(doubled.get(), 10.0);
/// ```
#[derive(Clone)]
pub struct Runtime {
    pub(crate) inner: Rc<RuntimeInner>,
}

#[derive(Clone)]
pub(crate) struct WeakRuntime(Weak<RuntimeInner>);

impl WeakRuntime {
    pub fn upgrade(&self) -> Option<Runtime> {
        self.0.upgrade().map(|inner| Runtime { inner })
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("contexts", &self.context_count())
            .field("observers", &self.observer_count())
            .field("pending_jobs", &self.pending_jobs())
            .finish()
    }
}

impl Runtime {
    /// Create a runtime with the default configuration.
    pub fn new() -> Self {
        Self::with_config(RuntimeConfig::default())
    }

    /// Configure a runtime.
    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::new()
    }

    /// Create a runtime with the given configuration.
    pub fn with_config(config: RuntimeConfig) -> Self {
        Self {
            inner: Rc::new(RuntimeInner {
                config,
                contexts: RefCell::new(Arena::default()),
                observers: RefCell::new(Arena::default()),
                registry: RefCell::new(HashMap::new()),
                stack: RefCell::new(Vec::new()),
                queue: RefCell::new(BatchQueue::default()),
                graveyard: RefCell::new(Vec::new()),
                next_handle: Cell::new(0),
                sweep_at: Cell::new(config.sweep_threshold),
            }),
        }
    }

    /// The configuration this runtime was built with.
    pub fn config(&self) -> RuntimeConfig {
        self.inner.config
    }

    /// Whether both handles refer to the same graph.
    pub fn ptr_eq(&self, other: &Runtime) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn downgrade(&self) -> WeakRuntime {
        WeakRuntime(Rc::downgrade(&self.inner))
    }

    pub(crate) fn next_handle(&self) -> u64 {
        let id = self.inner.next_handle.get();
        self.inner.next_handle.set(id + 1);
        id
    }

    // ------------------------------------------------------------------
    // Context stack
    // ------------------------------------------------------------------

    /// The context currently collecting dependencies, if any.
    pub fn active_context(&self) -> Option<ContextId> {
        self.inner.stack.borrow().last().copied().flatten()
    }

    /// Whether reads right now are tracked.
    pub fn is_tracking(&self) -> bool {
        self.active_context().is_some()
    }

    /// Run `f` with tracking paused. Reads inside bind nothing.
    pub fn untracked<R>(&self, f: impl FnOnce() -> R) -> R {
        self.inner.stack.borrow_mut().push(None);
        let _pop = PopGuard { rt: self };
        f()
    }

    /// Detach the whole active-context stack until the guard drops.
    ///
    /// Hold this across any suspension point (an `.await`, a deferred
    /// callback) so that work resumed later is never attributed to whatever
    /// context happened to be running when it was scheduled.
    pub fn suspend(&self) -> SuspendGuard<'_> {
        let saved = std::mem::take(&mut *self.inner.stack.borrow_mut());
        SuspendGuard { rt: self, saved }
    }

    fn push_context(&self, id: Option<ContextId>) {
        self.inner.stack.borrow_mut().push(id);
    }

    fn pop_context(&self, expected: Option<ContextId>) {
        let popped = self.inner.stack.borrow_mut().pop();
        debug_assert_eq!(
            popped,
            Some(expected),
            "context stack mismatch: expected {:?}, got {:?}",
            expected,
            popped
        );
    }

    // ------------------------------------------------------------------
    // Arenas
    // ------------------------------------------------------------------

    pub(crate) fn create_context(&self, kind: ContextKind) -> ContextId {
        self.collect_released();
        self.inner.contexts.borrow_mut().insert(ContextNode::new(kind))
    }

    pub(crate) fn create_observer(&self, observer: Observer) -> ObserverId {
        self.inner.observers.borrow_mut().insert(observer)
    }

    pub(crate) fn with_context<R>(
        &self,
        id: ContextId,
        f: impl FnOnce(&mut ContextNode) -> R,
    ) -> Option<R> {
        self.inner.contexts.borrow_mut().get_mut(id).map(f)
    }

    /// Number of live contexts.
    pub fn context_count(&self) -> usize {
        self.inner.contexts.borrow().len()
    }

    /// Number of live observers.
    pub fn observer_count(&self) -> usize {
        self.inner.observers.borrow().len()
    }

    /// Number of queued jobs and listener notices.
    pub fn pending_jobs(&self) -> usize {
        self.inner.queue.borrow().len()
    }

    /// The observer bound to a raw container, created on first use.
    ///
    /// One raw container maps to exactly one observer per runtime.
    pub(crate) fn observer_for_raw(&self, raw: &Raw) -> ObserverId {
        let addr = raw.addr();
        let existing = self.inner.registry.borrow().get(&addr).copied();
        if let Some(id) = existing {
            let live = self
                .inner
                .observers
                .borrow()
                .get(id)
                .is_some_and(|observer| observer.is_bound_to(raw));
            if live {
                return id;
            }
            // Same address, new allocation: the previous container is gone.
            self.release_observer(id);
        }

        let id = self.create_observer(Observer::for_raw(raw));
        self.inner.registry.borrow_mut().insert(addr, id);
        if self.inner.registry.borrow().len() >= self.inner.sweep_at.get() {
            self.sweep();
        }
        id
    }

    /// The observer of a raw container, if it was ever wrapped.
    pub(crate) fn existing_observer(&self, raw: &Raw) -> Option<ObserverId> {
        let id = self.inner.registry.borrow().get(&raw.addr()).copied()?;
        self.inner
            .observers
            .borrow()
            .get(id)
            .filter(|observer| observer.is_bound_to(raw))
            .map(|_| id)
    }

    /// Free observers whose raw container has been dropped.
    pub fn sweep(&self) {
        let dead: Vec<(usize, ObserverId)> = {
            let registry = self.inner.registry.borrow();
            let observers = self.inner.observers.borrow();
            registry
                .iter()
                .filter(|(_, id)| observers.get(**id).map_or(true, |o| !o.is_alive()))
                .map(|(addr, id)| (*addr, *id))
                .collect()
        };
        {
            let mut registry = self.inner.registry.borrow_mut();
            for (addr, _) in &dead {
                registry.remove(addr);
            }
        }
        for (_, id) in &dead {
            self.release_observer(*id);
        }
        let live = self.inner.registry.borrow().len();
        self.inner
            .sweep_at
            .set(self.inner.config.sweep_threshold.max(live * 2));
        debug!(freed = dead.len(), live, "swept observer registry");
    }

    /// Free an observer slot, deferring if the arena is busy.
    pub(crate) fn release_observer(&self, id: ObserverId) {
        let removed = match self.inner.observers.try_borrow_mut() {
            Ok(mut observers) => observers.remove(id),
            Err(_) => {
                self.defer(Released::Observer(id));
                return;
            }
        };
        drop(removed);
    }

    /// Stop a context from a destructor, deferring if the graph is busy.
    pub(crate) fn release_context(&self, id: ContextId) {
        let idle = self.inner.contexts.try_borrow_mut().is_ok()
            && self.inner.observers.try_borrow_mut().is_ok()
            && self.inner.queue.try_borrow_mut().is_ok();
        if idle {
            self.stop_context(id);
        } else {
            self.defer(Released::Context(id));
        }
    }

    fn defer(&self, released: Released) {
        if let Ok(mut graveyard) = self.inner.graveyard.try_borrow_mut() {
            graveyard.push(released);
        }
    }

    fn collect_released(&self) {
        let released = match self.inner.graveyard.try_borrow_mut() {
            Ok(mut graveyard) if !graveyard.is_empty() => std::mem::take(&mut *graveyard),
            _ => return,
        };
        for item in released {
            match item {
                Released::Context(id) => self.stop_context(id),
                Released::Observer(id) => self.release_observer(id),
            }
        }
    }

    // ------------------------------------------------------------------
    // Context lifecycle
    // ------------------------------------------------------------------

    /// Begin a run: bump the track id, drop every binding from the previous
    /// run, reset to clean and make the context active.
    ///
    /// Returns `false` for a stopped context, which is then run untracked.
    pub(crate) fn start(&self, id: ContextId) -> bool {
        let deps = self.with_context(id, |node| {
            node.track_id += 1;
            node.running += 1;
            node.dirty = DirtyLevel::NotDirty;
            node.take_deps()
        });
        match deps {
            Some(deps) => {
                self.unsubscribe(id, deps.into_iter());
                self.push_context(Some(id));
                trace!(context = ?id, "context started");
                true
            }
            None => {
                self.push_context(None);
                false
            }
        }
    }

    /// End a run started with [`Runtime::start`].
    pub(crate) fn end(&self, id: ContextId, tracked: bool) {
        self.pop_context(tracked.then_some(id));
        if tracked {
            self.with_context(id, |node| node.running = node.running.saturating_sub(1));
        }
    }

    /// Run `f` as context `id`, rebuilding its dependency set.
    pub(crate) fn run_context<R>(&self, id: ContextId, f: impl FnOnce() -> R) -> R {
        let tracked = self.start(id);
        let _end = EndGuard {
            rt: self,
            id,
            tracked,
        };
        f()
    }

    /// Remove a context's subscriptions from the observers it read.
    pub(crate) fn unsubscribe(
        &self,
        id: ContextId,
        deps: impl Iterator<Item = (ObserverId, SmallVec<[Prop; 2]>)>,
    ) {
        let mut observers = self.inner.observers.borrow_mut();
        for (observer_id, props) in deps {
            if let Some(observer) = observers.get_mut(observer_id) {
                for prop in &props {
                    observer.unsubscribe(prop, id);
                }
            }
        }
    }

    /// Permanently sever a context from the graph and free its slot.
    ///
    /// Stopping a stopped context is a no-op.
    pub(crate) fn stop_context(&self, id: ContextId) {
        let node = self.inner.contexts.borrow_mut().remove(id);
        let Some(mut node) = node else {
            return;
        };
        self.unsubscribe(id, node.take_deps().into_iter());
        self.inner.queue.borrow_mut().cancel(id);
        trace!(context = ?id, kind = ?node.kind, "context stopped");
        // Closures may own handles whose destructors call back into the
        // runtime; drop them with no borrow held.
        drop(node);
    }

    /// The current dirty level, or `None` once stopped.
    pub(crate) fn dirty_level(&self, id: ContextId) -> Option<DirtyLevel> {
        self.inner.contexts.borrow().get(id).map(|node| node.dirty)
    }

    /// Whether the context must re-run, resolving "maybe dirty" by pulling.
    ///
    /// Each upstream computed is refreshed in read order; the first one that
    /// really changes escalates this context to dirty and ends the walk. If
    /// none changed the context is clean again.
    pub(crate) fn is_dirty(&self, id: ContextId) -> bool {
        let upstream = self.with_context(id, |node| {
            if node.dirty.is_maybe() {
                node.dirty = DirtyLevel::QueryingDirty;
                Some(node.deps.keys().copied().collect::<SmallVec<[ObserverId; 8]>>())
            } else {
                None
            }
        });
        let Some(upstream) = upstream else {
            return false;
        };

        if let Some(upstream) = upstream {
            self.untracked(|| {
                for observer in upstream {
                    if let Some(refresh) = self.computed_refresh(observer) {
                        refresh();
                    }
                    if self.dirty_level(id).map_or(true, |l| l >= DirtyLevel::Dirty) {
                        break;
                    }
                }
            });
            self.with_context(id, |node| {
                if node.dirty == DirtyLevel::QueryingDirty {
                    node.dirty = DirtyLevel::NotDirty;
                }
            });
        }

        self.dirty_level(id).is_some_and(|l| l >= DirtyLevel::Dirty)
    }

    fn computed_refresh(&self, observer: ObserverId) -> Option<Rc<dyn Fn()>> {
        let owner = self.inner.observers.borrow().get(observer)?.computed?;
        self.inner.contexts.borrow().get(owner)?.refresh.clone()
    }

    // ------------------------------------------------------------------
    // Batching
    // ------------------------------------------------------------------

    /// Open a batch. Batches nest; only the outermost end flushes.
    pub fn start_batch(&self) {
        self.inner.queue.borrow_mut().start();
    }

    /// Close a batch, flushing if it was the outermost one.
    pub fn end_batch(&self) {
        let flush = self.inner.queue.borrow_mut().end();
        if flush {
            self.flush();
        }
    }

    /// Run `f` inside a batch.
    ///
    /// ```
    /// use ripple_core::Runtime;
    /// use std::{cell::Cell, rc::Rc};
    ///
    /// let rt = Runtime::new();
    /// let a = rt.signal(1);
    /// let b = rt.signal(2);
    /// let runs = Rc::new(Cell::new(0));
    ///
    /// let _effect = {
    ///     let (a, b, runs) = (a.clone(), b.clone(), runs.clone());
    ///     rt.watch_effect(move || {
    ///         let _ = a.get() + b.get();
    ///         runs.set(runs.get() + 1);
    ///     })
    /// };
    ///
    /// rt.batch(|| {
    ///     a.set(10);
    ///     b.set(20);
    /// });
    /// assert_eq!(runs.get(), 2);
    /// ```
    pub fn batch<R>(&self, f: impl FnOnce() -> R) -> R {
        self.start_batch();
        let _end = BatchGuard { rt: self };
        f()
    }

    /// Whether a batch is currently open.
    pub fn in_batch(&self) -> bool {
        self.inner.queue.borrow().depth() > 0
    }

    fn flush(&self) {
        self.inner.queue.borrow_mut().set_flushing(true);
        let _reset = FlushGuard { rt: self };

        let limit = self.inner.config.recursion_limit;
        let mut runs: HashMap<ContextId, usize> = HashMap::new();
        let mut executed = 0usize;

        loop {
            let next = self.inner.queue.borrow_mut().next();
            match next {
                None => break,
                Some(Pending::Job(job)) => {
                    let count = runs.entry(job.context).or_default();
                    *count += 1;
                    if *count > limit {
                        let dropped = self.pending_jobs();
                        let mut stranded = self.inner.queue.borrow_mut().clear();
                        stranded.push(job.context);
                        // Dropped contexts stay dirty; the next write must queue them again.
                        for id in stranded {
                            self.with_context(id, |node| node.should_schedule = true);
                        }
                        error!(
                            context = ?job.context,
                            limit,
                            dropped,
                            "maximum recursive updates exceeded; dropping remaining jobs"
                        );
                        break;
                    }
                    trace!(context = ?job.context, "running job");
                    (job.run)();
                    executed += 1;
                }
                Some(Pending::Listener(notice)) => {
                    trace!(observer = ?notice.source, changes = notice.changes.len(), "notifying listener");
                    (notice.listener)(&notice.changes);
                    executed += 1;
                }
            }
        }

        debug!(executed, "flushed batch");
        self.collect_released();
    }
}

/// Restores the active-context stack captured by [`Runtime::suspend`].
#[must_use = "the stack is restored when the guard drops"]
pub struct SuspendGuard<'a> {
    rt: &'a Runtime,
    saved: Vec<Option<ContextId>>,
}

impl Drop for SuspendGuard<'_> {
    fn drop(&mut self) {
        let mut stack = self.rt.inner.stack.borrow_mut();
        debug_assert!(stack.is_empty(), "context left open across a suspension");
        *stack = std::mem::take(&mut self.saved);
    }
}

struct PopGuard<'a> {
    rt: &'a Runtime,
}

impl Drop for PopGuard<'_> {
    fn drop(&mut self) {
        self.rt.pop_context(None);
    }
}

struct EndGuard<'a> {
    rt: &'a Runtime,
    id: ContextId,
    tracked: bool,
}

impl Drop for EndGuard<'_> {
    fn drop(&mut self) {
        self.rt.end(self.id, self.tracked);
    }
}

struct BatchGuard<'a> {
    rt: &'a Runtime,
}

impl Drop for BatchGuard<'_> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.rt.inner.queue.borrow_mut().end();
        } else {
            self.rt.end_batch();
        }
    }
}

struct FlushGuard<'a> {
    rt: &'a Runtime,
}

impl Drop for FlushGuard<'_> {
    fn drop(&mut self) {
        self.rt.inner.queue.borrow_mut().set_flushing(false);
    }
}
