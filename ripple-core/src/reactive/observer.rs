//! Observers
//!
//! An observer is the bookkeeping attached to one reactive container or cell.
//! For every property key it records which contexts read it (stamped with
//! the reader's track id), plus any explicit key watchers and whole-container
//! listeners registered by the embedding layer.
//!
//! Reads go through [`Runtime::use_prop`] and writes through
//! [`Runtime::set_prop`]; [`Runtime::trigger`] is the propagation step both
//! containers and computeds share.

use std::collections::HashMap;
use std::rc::{Rc, Weak};

use indexmap::IndexMap;
use serde::Serialize;
use smallvec::SmallVec;
use tracing::trace;

use super::runtime::Runtime;
use crate::graph::{ContextId, ContextKind, DirtyLevel, Job, ObserverId};
use crate::value::{Key, Raw, RawInner, Value};

/// Key under which reads and writes are tracked on an observer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) enum Prop {
    /// The value of a cell or computed.
    Value,
    /// The length of a list.
    Length,
    /// The key set of a container, read by iteration and size queries.
    Iterate,
    /// A property, index, map key or set element.
    Key(Key),
    /// An entry of a weak collection, by key identity.
    Addr(usize),
}

/// Kind of write recorded in a [`PropChange`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Mutation {
    /// An existing key got a new value.
    Set,
    /// A key was added.
    Add,
    /// A key was removed.
    Delete,
    /// The container was emptied.
    Clear,
    /// A list's length changed.
    Length,
}

/// A single change delivered to key watchers and container listeners.
#[derive(Debug, Clone)]
pub struct PropChange {
    pub key: Value,
    pub mutation: Mutation,
    pub old: Value,
    pub new: Value,
}

/// Handle returned by [`crate::Reactive::watch_key`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WatcherId(pub(crate) u64);

/// Handle returned by [`crate::Reactive::add_listener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(pub(crate) u64);

type KeyWatcher = (WatcherId, Rc<dyn Fn(&PropChange)>);
type Listener = (ListenerId, Rc<dyn Fn(&[PropChange])>);

pub(crate) struct Observer {
    raw: Option<Weak<RawInner>>,
    subscribers: HashMap<Prop, IndexMap<ContextId, u64>>,
    watchers: HashMap<Prop, Vec<KeyWatcher>>,
    listeners: Vec<Listener>,
    /// Set when this observer carries a computed's output value.
    pub computed: Option<ContextId>,
}

impl Observer {
    /// Observer of a cell.
    pub fn cell() -> Self {
        Self {
            raw: None,
            subscribers: HashMap::new(),
            watchers: HashMap::new(),
            listeners: Vec::new(),
            computed: None,
        }
    }

    /// Observer of a computed's output, owned by context `owner`.
    pub fn output(owner: ContextId) -> Self {
        Self {
            computed: Some(owner),
            ..Self::cell()
        }
    }

    /// Observer of a raw container.
    pub fn for_raw(raw: &Raw) -> Self {
        Self {
            raw: Some(raw.downgrade()),
            ..Self::cell()
        }
    }

    pub fn is_bound_to(&self, raw: &Raw) -> bool {
        self.raw.as_ref().is_some_and(|weak| {
            weak.strong_count() > 0 && weak.as_ptr() as *const () as usize == raw.addr()
        })
    }

    pub fn is_alive(&self) -> bool {
        self.raw.as_ref().map_or(true, |weak| weak.strong_count() > 0)
    }

    pub fn unsubscribe(&mut self, prop: &Prop, context: ContextId) {
        if let Some(readers) = self.subscribers.get_mut(prop) {
            readers.shift_remove(&context);
            if readers.is_empty() {
                self.subscribers.remove(prop);
            }
        }
    }

    fn readers(&self, prop: &Prop) -> SmallVec<[(ContextId, u64); 8]> {
        self.subscribers
            .get(prop)
            .map(|readers| readers.iter().map(|(id, stamp)| (*id, *stamp)).collect())
            .unwrap_or_default()
    }
}

impl Runtime {
    /// Record a read of `prop` on `observer` by the active context.
    pub(crate) fn use_prop(&self, observer: ObserverId, prop: Prop) {
        let Some(context) = self.active_context() else {
            return;
        };
        let stamp = self.with_context(context, |node| {
            node.record_dep(observer, &prop).then_some(node.track_id)
        });
        if let Some(Some(stamp)) = stamp {
            if let Some(obs) = self.inner.observers.borrow_mut().get_mut(observer) {
                obs.subscribers.entry(prop).or_default().insert(context, stamp);
            }
        }
    }

    /// Record a write of `prop` on `observer`.
    ///
    /// Key watchers fire synchronously, listeners are queued on the current
    /// batch, and readers are triggered at `level`. A `change` of `None`
    /// marks a derived notification (such as an iteration key) that wakes
    /// readers only.
    pub(crate) fn set_prop(
        &self,
        observer: ObserverId,
        prop: Prop,
        change: Option<PropChange>,
        level: DirtyLevel,
    ) {
        self.batch(|| {
            if let Some(change) = change {
                let (watchers, listeners) = {
                    let observers = self.inner.observers.borrow();
                    match observers.get(observer) {
                        Some(obs) => (
                            obs.watchers
                                .get(&prop)
                                .map(|w| w.iter().map(|(_, f)| Rc::clone(f)).collect())
                                .unwrap_or_else(Vec::new),
                            obs.listeners.iter().map(|(_, f)| Rc::clone(f)).collect::<Vec<_>>(),
                        ),
                        None => (Vec::new(), Vec::new()),
                    }
                };
                for watcher in watchers {
                    watcher(&change);
                }
                if !listeners.is_empty() {
                    let mut queue = self.inner.queue.borrow_mut();
                    for listener in &listeners {
                        queue.push_listener(listener, observer, change.clone());
                    }
                }
            }
            self.trigger(observer, &prop, level);
        });
    }

    /// Raise every current reader of `prop` to `level`.
    ///
    /// Computed readers pass a maybe-dirty mark on to their own readers;
    /// other readers queue their job.
    pub(crate) fn trigger(&self, observer: ObserverId, prop: &Prop, level: DirtyLevel) {
        let readers = match self.inner.observers.borrow().get(observer) {
            Some(obs) => obs.readers(prop),
            None => return,
        };
        if readers.is_empty() {
            return;
        }
        trace!(?observer, ?prop, ?level, readers = readers.len(), "trigger");

        self.start_batch();
        for (context, stamp) in readers {
            self.notify_context(context, stamp, level);
        }
        self.end_batch();
    }

    fn notify_context(&self, context: ContextId, stamp: u64, level: DirtyLevel) {
        enum Next {
            Propagate(ObserverId, DirtyLevel),
            Queue(ContextKind, Job),
        }

        let next = self.with_context(context, |node| {
            if node.track_id != stamp || !node.raise(level) {
                return None;
            }
            if node.kind == ContextKind::Computed {
                node.should_schedule = false;
                let level = if node.dirty == DirtyLevel::MaybeDirtyComputedSideEffect {
                    DirtyLevel::MaybeDirtyComputedSideEffect
                } else {
                    DirtyLevel::MaybeDirty
                };
                return node.output.map(|output| Next::Propagate(output, level));
            }
            if !node.can_queue() {
                return None;
            }
            node.should_schedule = false;
            node.job.clone().map(|run| {
                Next::Queue(
                    node.kind,
                    Job {
                        context,
                        run,
                    },
                )
            })
        });

        match next.flatten() {
            Some(Next::Propagate(output, level)) => self.trigger(output, &Prop::Value, level),
            Some(Next::Queue(kind, job)) => {
                self.inner.queue.borrow_mut().push_job(kind, job);
            }
            None => {}
        }
    }

    /// Whether any context read `prop` on `observer` during its latest run.
    pub(crate) fn is_observed(&self, observer: ObserverId, prop: &Prop) -> bool {
        let readers = match self.inner.observers.borrow().get(observer) {
            Some(obs) => obs.readers(prop),
            None => return false,
        };
        let contexts = self.inner.contexts.borrow();
        readers.iter().any(|(context, stamp)| {
            contexts
                .get(*context)
                .is_some_and(|node| node.track_id == *stamp)
        })
    }

    /// Number of live readers of `prop` on `observer`.
    pub(crate) fn reader_count(&self, observer: ObserverId, prop: &Prop) -> usize {
        self.inner
            .observers
            .borrow()
            .get(observer)
            .map_or(0, |obs| obs.readers(prop).len())
    }

    pub(crate) fn add_key_watcher(
        &self,
        observer: ObserverId,
        prop: Prop,
        watcher: Rc<dyn Fn(&PropChange)>,
    ) -> WatcherId {
        let id = WatcherId(self.next_handle());
        if let Some(obs) = self.inner.observers.borrow_mut().get_mut(observer) {
            obs.watchers.entry(prop).or_default().push((id, watcher));
        }
        id
    }

    pub(crate) fn remove_key_watcher(&self, observer: ObserverId, id: WatcherId) -> bool {
        let removed = {
            let mut observers = self.inner.observers.borrow_mut();
            let Some(obs) = observers.get_mut(observer) else {
                return false;
            };
            let mut removed = None;
            obs.watchers.retain(|_, list| {
                if let Some(pos) = list.iter().position(|(w, _)| *w == id) {
                    removed = Some(list.remove(pos));
                }
                !list.is_empty()
            });
            removed
        };
        removed.is_some()
    }

    pub(crate) fn add_listener(
        &self,
        observer: ObserverId,
        listener: Rc<dyn Fn(&[PropChange])>,
    ) -> ListenerId {
        let id = ListenerId(self.next_handle());
        if let Some(obs) = self.inner.observers.borrow_mut().get_mut(observer) {
            obs.listeners.push((id, listener));
        }
        id
    }

    pub(crate) fn remove_listener(&self, observer: ObserverId, id: ListenerId) -> bool {
        let removed = {
            let mut observers = self.inner.observers.borrow_mut();
            let Some(obs) = observers.get_mut(observer) else {
                return false;
            };
            obs.listeners
                .iter()
                .position(|(l, _)| *l == id)
                .map(|pos| obs.listeners.remove(pos))
        };
        removed.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_outside_a_context_bind_nothing() {
        let rt = Runtime::new();
        let observer = rt.create_observer(Observer::cell());
        rt.use_prop(observer, Prop::Value);
        assert_eq!(rt.reader_count(observer, &Prop::Value), 0);
    }

    #[test]
    fn reads_bind_once_per_run() {
        let rt = Runtime::new();
        let observer = rt.create_observer(Observer::cell());
        let ctx = rt.create_context(ContextKind::Watch);

        rt.run_context(ctx, || {
            rt.use_prop(observer, Prop::Value);
            rt.use_prop(observer, Prop::Value);
        });
        assert_eq!(rt.reader_count(observer, &Prop::Value), 1);
        assert!(rt.is_observed(observer, &Prop::Value));

        // A run that no longer reads drops the binding.
        rt.run_context(ctx, || {});
        assert_eq!(rt.reader_count(observer, &Prop::Value), 0);
    }

    #[test]
    fn trigger_queues_and_flushes_the_job() {
        use std::cell::Cell;

        let rt = Runtime::new();
        let observer = rt.create_observer(Observer::cell());
        let ctx = rt.create_context(ContextKind::Watch);
        let runs = Rc::new(Cell::new(0));
        {
            let runs = runs.clone();
            rt.with_context(ctx, |node| node.job = Some(Rc::new(move || runs.set(runs.get() + 1))));
        }
        rt.run_context(ctx, || rt.use_prop(observer, Prop::Value));

        rt.trigger(observer, &Prop::Value, DirtyLevel::Dirty);
        assert_eq!(runs.get(), 1);
        assert_eq!(rt.dirty_level(ctx), Some(DirtyLevel::Dirty));
    }

    #[test]
    fn stale_stamps_are_ignored() {
        let rt = Runtime::new();
        let observer = rt.create_observer(Observer::cell());
        let ctx = rt.create_context(ContextKind::Watch);
        rt.run_context(ctx, || rt.use_prop(observer, Prop::Value));

        // Re-stamp the node without cleaning the observer.
        rt.with_context(ctx, |node| {
            node.track_id += 1;
            node.dirty = DirtyLevel::NotDirty;
        });
        rt.trigger(observer, &Prop::Value, DirtyLevel::Dirty);
        assert_eq!(rt.dirty_level(ctx), Some(DirtyLevel::NotDirty));
        assert!(!rt.is_observed(observer, &Prop::Value));
    }

    #[test]
    fn key_watchers_fire_synchronously() {
        use std::cell::RefCell;

        let rt = Runtime::new();
        let observer = rt.create_observer(Observer::cell());
        let seen = Rc::new(RefCell::new(Vec::new()));
        let id = {
            let seen = seen.clone();
            rt.add_key_watcher(
                observer,
                Prop::Value,
                Rc::new(move |change: &PropChange| seen.borrow_mut().push(change.mutation)),
            )
        };
        let change = PropChange {
            key: Value::Null,
            mutation: Mutation::Set,
            old: Value::from(1),
            new: Value::from(2),
        };
        rt.set_prop(observer, Prop::Value, Some(change.clone()), DirtyLevel::Dirty);
        assert_eq!(*seen.borrow(), vec![Mutation::Set]);

        assert!(rt.remove_key_watcher(observer, id));
        assert!(!rt.remove_key_watcher(observer, id));
        rt.set_prop(observer, Prop::Value, Some(change), DirtyLevel::Dirty);
        assert_eq!(seen.borrow().len(), 1);
    }
}
