//! Graph Nodes
//!
//! This module defines the context nodes that live in the dependency graph.

use std::rc::Rc;

use indexmap::IndexMap;
use smallvec::SmallVec;

use super::ObserverId;
use crate::reactive::Prop;

/// Graded staleness of a context.
///
/// The order is total and meaningful: propagation only ever raises a level,
/// and anything at or above [`DirtyLevel::Dirty`] must re-run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum DirtyLevel {
    /// Bindings reflect the last run and nothing upstream changed.
    #[default]
    NotDirty,

    /// Transient guard while resolving a maybe-dirty context. A context in
    /// this state is never re-queried, which stops recursion on cyclic
    /// computed graphs.
    QueryingDirty,

    /// An upstream computed re-notified after its own getter dirtied it.
    MaybeDirtyComputedSideEffect,

    /// An upstream computed may have changed; resolve by pulling.
    MaybeDirty,

    /// A direct dependency changed.
    Dirty,
}

impl DirtyLevel {
    /// Levels that need a pull before the context can be trusted.
    pub fn is_maybe(self) -> bool {
        matches!(
            self,
            DirtyLevel::MaybeDirty | DirtyLevel::MaybeDirtyComputedSideEffect
        )
    }
}

/// What a context computes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContextKind {
    /// A cached derived value. Propagates instead of scheduling.
    Computed,

    /// A watcher or watch effect. Scheduled as a pure job.
    Watch,

    /// A component render binding. Scheduled after all pure jobs.
    Render,
}

/// A context in the dependency graph.
pub(crate) struct ContextNode {
    pub kind: ContextKind,
    pub dirty: DirtyLevel,

    /// Incremented on every start. Subscriptions stamped with an older value
    /// belong to a previous run and are ignored.
    pub track_id: u64,

    /// Reverse index: every observer (and the keys on it) read during the
    /// current run, in first-read order.
    pub deps: IndexMap<ObserverId, SmallVec<[Prop; 2]>>,

    /// Re-entrancy depth of the body.
    pub running: u32,

    pub should_schedule: bool,
    pub allow_recurse: bool,

    /// Body re-executed by `Context::run`.
    pub body: Option<Rc<dyn Fn()>>,

    /// Scheduler entry pushed onto the batch queue.
    pub job: Option<Rc<dyn Fn()>>,

    /// For computeds: recompute if dirty, notify if the value changed.
    pub refresh: Option<Rc<dyn Fn()>>,

    /// For computeds: the observer carrying the output value.
    pub output: Option<ObserverId>,
}

impl ContextNode {
    /// Create a node. New nodes start dirty so their first read runs them.
    pub fn new(kind: ContextKind) -> Self {
        Self {
            kind,
            dirty: DirtyLevel::Dirty,
            track_id: 0,
            deps: IndexMap::new(),
            running: 0,
            should_schedule: false,
            allow_recurse: false,
            body: None,
            job: None,
            refresh: None,
            output: None,
        }
    }

    /// Raise the dirty level. Returns `true` when the node should be
    /// scheduled or propagated as a result of this or an earlier raise.
    pub fn raise(&mut self, level: DirtyLevel) -> bool {
        if self.dirty < level {
            self.should_schedule |= self.dirty == DirtyLevel::NotDirty;
            self.dirty = level;
        }
        self.should_schedule
    }

    /// Whether a scheduled job may be queued right now.
    pub fn can_queue(&self) -> bool {
        (self.running == 0 || self.allow_recurse)
            && self.dirty != DirtyLevel::MaybeDirtyComputedSideEffect
    }

    /// Record that `prop` on `observer` was read during the current run.
    /// Returns `false` if the read was already recorded.
    pub fn record_dep(&mut self, observer: ObserverId, prop: &Prop) -> bool {
        let props = self.deps.entry(observer).or_default();
        if props.contains(prop) {
            return false;
        }
        props.push(prop.clone());
        true
    }

    /// Take the reverse index, leaving the node with no dependencies.
    pub fn take_deps(&mut self) -> IndexMap<ObserverId, SmallVec<[Prop; 2]>> {
        std::mem::take(&mut self.deps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn levels_are_totally_ordered() {
        assert!(DirtyLevel::NotDirty < DirtyLevel::QueryingDirty);
        assert!(DirtyLevel::QueryingDirty < DirtyLevel::MaybeDirtyComputedSideEffect);
        assert!(DirtyLevel::MaybeDirtyComputedSideEffect < DirtyLevel::MaybeDirty);
        assert!(DirtyLevel::MaybeDirty < DirtyLevel::Dirty);
    }

    #[test]
    fn new_node_starts_dirty() {
        let node = ContextNode::new(ContextKind::Computed);
        assert_eq!(node.dirty, DirtyLevel::Dirty);
        assert!(!node.should_schedule);
    }

    #[test]
    fn raise_from_clean_requests_scheduling() {
        let mut node = ContextNode::new(ContextKind::Watch);
        node.dirty = DirtyLevel::NotDirty;

        assert!(node.raise(DirtyLevel::MaybeDirty));
        assert_eq!(node.dirty, DirtyLevel::MaybeDirty);

        // Escalation keeps the pending request but never lowers the level.
        node.should_schedule = false;
        assert!(!node.raise(DirtyLevel::Dirty));
        assert_eq!(node.dirty, DirtyLevel::Dirty);
        assert!(!node.raise(DirtyLevel::MaybeDirty));
        assert_eq!(node.dirty, DirtyLevel::Dirty);
    }

    #[test]
    fn running_nodes_do_not_queue_unless_recursive() {
        let mut node = ContextNode::new(ContextKind::Watch);
        node.dirty = DirtyLevel::Dirty;
        node.running = 1;
        assert!(!node.can_queue());
        node.allow_recurse = true;
        assert!(node.can_queue());
    }

    #[test]
    fn record_dep_deduplicates() {
        let mut node = ContextNode::new(ContextKind::Watch);
        let observer = ObserverId::from((3, 0));
        assert!(node.record_dep(observer, &Prop::Value));
        assert!(!node.record_dep(observer, &Prop::Value));
        assert!(node.record_dep(observer, &Prop::Length));
        assert_eq!(node.deps[&observer].len(), 2);
        assert_eq!(node.take_deps().len(), 1);
        assert!(node.deps.is_empty());
    }
}
