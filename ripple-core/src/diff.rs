//! Structural Diff
//!
//! Compares two snapshots of a list or plain object and reports, per
//! position, whether the entry was kept, inserted or deleted, and whether a
//! kept entry is still fresh for whatever read it.
//!
//! # Algorithm
//!
//! For lists:
//!
//! 1. Trim the common prefix and suffix, comparing entries by identity.
//! 2. Pair the remaining middle positionally. Paired entries are kept; their
//!    freshness is decided recursively (below).
//! 3. Unpaired old entries are deleted, unpaired new entries inserted.
//!
//! For plain objects every key of either side gets one op: kept when present
//! on both sides, otherwise inserted or deleted.
//!
//! # Freshness
//!
//! A kept entry whose old and new values differ can still be fresh: if the
//! old value is a container that nobody read through, or if only slots that
//! nobody currently reads changed, nothing derived from it is stale. The
//! check walks the old container's observer and only looks at keys with live
//! readers. A primitive that changed, or a container replaced by a primitive
//! (or by a container of another kind) is never fresh.

use std::collections::HashSet;

use serde::Serialize;

use crate::graph::ObserverId;
use crate::reactive::{Prop, Runtime};
use crate::value::{ContainerKind, Key, Raw, Value};

/// What happened to one position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum DiffAction {
    Nop,
    Insert,
    Delete,
}

/// Whether a position still holds what its readers saw.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Freshness {
    Fresh,
    NotFresh,
}

/// One entry of a diff.
///
/// `index` is the old position for `Nop` and `Delete` and the new position
/// for `Insert`. `target` is the new position, absent for deletions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DiffOp {
    pub action: DiffAction,
    pub index: usize,
    pub target: Option<usize>,
}

impl DiffOp {
    fn nop(index: usize, target: usize) -> Self {
        Self {
            action: DiffAction::Nop,
            index,
            target: Some(target),
        }
    }

    fn insert(index: usize) -> Self {
        Self {
            action: DiffAction::Insert,
            index,
            target: Some(index),
        }
    }

    fn delete(index: usize) -> Self {
        Self {
            action: DiffAction::Delete,
            index,
            target: None,
        }
    }
}

/// Result of [`Runtime::diff`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiffResult {
    pub ops: Vec<DiffOp>,
    /// Freshness of each op, in the same order.
    pub states: Vec<Freshness>,
    /// For plain objects, the property each op refers to.
    pub keys: Vec<String>,
    /// Every op is `Nop` and every state is `Fresh`.
    pub is_only_nop: bool,
}

impl DiffResult {
    fn new(ops: Vec<DiffOp>, states: Vec<Freshness>, keys: Vec<String>) -> Self {
        let is_only_nop = ops.iter().all(|op| op.action == DiffAction::Nop)
            && states.iter().all(|state| *state == Freshness::Fresh);
        Self {
            ops,
            states,
            keys,
            is_only_nop,
        }
    }

    /// Old position to new position for every kept entry.
    pub fn old_to_new(&self) -> Vec<(usize, usize)> {
        self.ops
            .iter()
            .filter(|op| op.action == DiffAction::Nop)
            .filter_map(|op| op.target.map(|target| (op.index, target)))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

fn fresh(yes: bool) -> Freshness {
    if yes {
        Freshness::Fresh
    } else {
        Freshness::NotFresh
    }
}

struct Differ<'a> {
    rt: &'a Runtime,
    visited: HashSet<(usize, usize)>,
}

impl Differ<'_> {
    fn diff(&mut self, old: &Value, new: &Value) -> DiffResult {
        match (old.as_raw(), new.as_raw()) {
            (Some(old), Some(new)) if old.kind() == new.kind() => match old.kind() {
                ContainerKind::List => self.diff_list(&old, &new),
                ContainerKind::Plain => self.diff_plain(&old, &new),
                _ => Self::rebuild(&old, &new),
            },
            (Some(old), Some(new)) => Self::rebuild(&old, &new),
            (Some(old), None) => Self::rebuild(&old, &Raw::list(Vec::<Value>::new())),
            (None, Some(new)) => Self::rebuild(&Raw::list(Vec::<Value>::new()), &new),
            (None, None) => DiffResult::new(Vec::new(), Vec::new(), Vec::new()),
        }
    }

    /// Everything old deleted, everything new inserted.
    fn rebuild(old: &Raw, new: &Raw) -> DiffResult {
        let mut ops: Vec<DiffOp> = (0..old.len()).map(DiffOp::delete).collect();
        ops.extend((0..new.len()).map(DiffOp::insert));
        let states = vec![Freshness::NotFresh; ops.len()];
        DiffResult::new(ops, states, Vec::new())
    }

    fn diff_list(&mut self, old: &Raw, new: &Raw) -> DiffResult {
        let old_items = old.items();
        let new_items = new.items();
        let (old_len, new_len) = (old_items.len(), new_items.len());
        let shortest = old_len.min(new_len);

        let prefix = old_items
            .iter()
            .zip(&new_items)
            .take_while(|(a, b)| a.is_same(b))
            .count();
        let suffix = old_items[prefix..]
            .iter()
            .rev()
            .zip(new_items[prefix..].iter().rev())
            .take(shortest - prefix)
            .take_while(|(a, b)| a.is_same(b))
            .count();

        let mut ops = Vec::with_capacity(old_len.max(new_len));
        let mut states = Vec::with_capacity(ops.capacity());

        for index in 0..prefix {
            ops.push(DiffOp::nop(index, index));
            states.push(Freshness::Fresh);
        }

        let old_middle = prefix..old_len - suffix;
        let new_middle = prefix..new_len - suffix;
        let paired = old_middle.len().min(new_middle.len());
        for offset in 0..paired {
            let index = prefix + offset;
            ops.push(DiffOp::nop(index, index));
            states.push(fresh(self.child_fresh(&old_items[index], &new_items[index])));
        }
        for index in old_middle.start + paired..old_middle.end {
            ops.push(DiffOp::delete(index));
            states.push(Freshness::NotFresh);
        }
        for index in new_middle.start + paired..new_middle.end {
            ops.push(DiffOp::insert(index));
            states.push(Freshness::NotFresh);
        }

        for offset in 0..suffix {
            ops.push(DiffOp::nop(old_len - suffix + offset, new_len - suffix + offset));
            states.push(Freshness::Fresh);
        }

        DiffResult::new(ops, states, Vec::new())
    }

    fn diff_plain(&mut self, old: &Raw, new: &Raw) -> DiffResult {
        let old_props = old.properties();
        let new_props = new.properties();

        let mut ops = Vec::new();
        let mut states = Vec::new();
        let mut keys = Vec::new();

        for (index, (name, old_value)) in old_props.iter().enumerate() {
            match new_props.iter().position(|(n, _)| n == name) {
                Some(target) => {
                    ops.push(DiffOp::nop(index, target));
                    states.push(fresh(self.child_fresh(old_value, &new_props[target].1)));
                }
                None => {
                    ops.push(DiffOp::delete(index));
                    states.push(Freshness::NotFresh);
                }
            }
            keys.push(name.to_string());
        }
        for (index, (name, _)) in new_props.iter().enumerate() {
            if !old_props.iter().any(|(n, _)| n == name) {
                ops.push(DiffOp::insert(index));
                states.push(Freshness::NotFresh);
                keys.push(name.to_string());
            }
        }

        DiffResult::new(ops, states, keys)
    }

    /// Whether everything read through `old` still holds in `new`.
    fn child_fresh(&mut self, old: &Value, new: &Value) -> bool {
        if old.is_same(new) {
            return true;
        }
        let (Some(old), Some(new)) = (old.as_raw(), new.as_raw()) else {
            return false;
        };
        if old.kind() != new.kind() {
            return false;
        }
        let Some(observer) = self.rt.existing_observer(&old) else {
            return true;
        };
        if !self.visited.insert((old.addr(), new.addr())) {
            return true;
        }
        match old.kind() {
            ContainerKind::List => self.list_fresh(&old, &new, observer),
            ContainerKind::Plain => self.plain_fresh(&old, &new, observer),
            _ => false,
        }
    }

    fn list_fresh(&mut self, old: &Raw, new: &Raw, observer: ObserverId) -> bool {
        let old_items = old.items();
        let new_items = new.items();
        if old_items.len() != new_items.len() && self.rt.is_observed(observer, &Prop::Length) {
            return false;
        }
        for index in 0..old_items.len().max(new_items.len()) {
            let prop = Prop::Key(Key::from(index));
            if !self.rt.is_observed(observer, &prop) {
                continue;
            }
            match (old_items.get(index), new_items.get(index)) {
                (Some(a), Some(b)) => {
                    if !self.child_fresh(a, b) {
                        return false;
                    }
                }
                _ => return false,
            }
        }
        true
    }

    fn plain_fresh(&mut self, old: &Raw, new: &Raw, observer: ObserverId) -> bool {
        let old_props = old.properties();
        let new_props = new.properties();

        let same_keys = old_props.len() == new_props.len()
            && old_props
                .iter()
                .all(|(name, _)| new_props.iter().any(|(n, _)| n == name));
        if !same_keys && self.rt.is_observed(observer, &Prop::Iterate) {
            return false;
        }

        let mut names: Vec<_> = old_props.iter().map(|(name, _)| name.clone()).collect();
        for (name, _) in &new_props {
            if !names.contains(name) {
                names.push(name.clone());
            }
        }

        for name in names {
            let prop = Prop::Key(Key::Str(name.clone()));
            if !self.rt.is_observed(observer, &prop) {
                continue;
            }
            let old_value = old_props.iter().find(|(n, _)| *n == name).map(|(_, v)| v);
            let new_value = new_props.iter().find(|(n, _)| *n == name).map(|(_, v)| v);
            match (old_value, new_value) {
                (Some(a), Some(b)) => {
                    if !self.child_fresh(a, b) {
                        return false;
                    }
                }
                (None, None) => {}
                _ => return false,
            }
        }
        true
    }
}

impl Runtime {
    /// Diff two snapshots of a list or plain object.
    ///
    /// ```
    /// use ripple_core::{DiffAction, Runtime, Value};
    ///
    /// let rt = Runtime::new();
    /// let (a, b, c) = (Value::object([("id", 1)]), Value::object([("id", 2)]), Value::object([("id", 3)]));
    ///
    /// let old = Value::list([a.clone(), b, c.clone()]);
    /// let new = Value::list([a, c]);
    /// let actions: Vec<_> = rt.diff(&old, &new).ops.iter().map(|op| (op.action, op.index)).collect();
    /// assert_eq!(
    ///     actions,
    ///     [(DiffAction::Nop, 0), (DiffAction::Delete, 1), (DiffAction::Nop, 2)]
    /// );
    /// ```
    pub fn diff(&self, old: &Value, new: &Value) -> DiffResult {
        Differ {
            rt: self,
            visited: HashSet::new(),
        }
        .diff(old, new)
    }
}
