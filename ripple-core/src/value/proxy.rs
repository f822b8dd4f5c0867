//! Reactive Handles
//!
//! A [`Reactive`] is a tracked view onto a raw container. Reads through it
//! bind the active context to the key read; writes notify only the contexts
//! that read the affected keys.
//!
//! Behaviour differs per container kind, so every operation is dispatched
//! to a handler chosen once, when the handle is created:
//!
//! | kind      | keys tracked                      | iteration tracks |
//! |-----------|-----------------------------------|------------------|
//! | plain     | property name                     | key set          |
//! | list      | index, `length`                   | `length`         |
//! | map       | key                               | key set, values  |
//! | set       | element                           | key set          |
//! | weak      | key identity                      | not iterable     |
//!
//! Nested containers are wrapped lazily: a read that returns a container
//! hands back a `Reactive` for it, created on first access. Writes always
//! store the raw container, so wrapping never leaks into stored state.

use std::cell::{Ref as CellRef, RefMut};
use std::fmt;
use std::rc::Rc;

use indexmap::IndexMap;

use super::{ContainerKind, Key, Raw, RawData, Value};
use crate::error::{ReactiveError, Result};
use crate::graph::{DirtyLevel, ObserverId};
use crate::reactive::{ListenerId, Mutation, Prop, PropChange, Runtime, WatcherId};

/// A tracked handle onto a raw container.
///
/// Handles are cheap to clone. Two handles are equal when they wrap the
/// same container in the same runtime.
///
/// ```
/// use ripple_core::{Raw, Runtime, Value};
///
/// let rt = Runtime::new();
/// let todos = rt.reactive(Raw::list([Value::from("write"), Value::from("test")]));
///
/// todos.push("ship").unwrap();
/// assert_eq!(todos.len().unwrap(), 3);
/// assert_eq!(todos.get(2).unwrap().as_str(), Some("ship"));
/// ```
#[derive(Clone)]
pub struct Reactive {
    rt: Runtime,
    raw: Raw,
    observer: ObserverId,
    handler: &'static dyn ContainerHandler,
}

impl Reactive {
    /// The wrapped container.
    pub fn raw(&self) -> Raw {
        self.raw.clone()
    }

    pub fn kind(&self) -> ContainerKind {
        self.raw.kind()
    }

    /// Handle of the container's observer.
    pub fn id(&self) -> ObserverId {
        self.observer
    }

    pub fn runtime(&self) -> &Runtime {
        &self.rt
    }

    /// Read a slot. Containers come back wrapped.
    pub fn get(&self, key: impl Into<Key>) -> Result<Value> {
        self.handler.get(self, &key.into())
    }

    /// Write a slot. A write of the identical value notifies nobody.
    pub fn set(&self, key: impl Into<Key>, value: impl Into<Value>) -> Result<()> {
        self.handler.set(self, key.into(), value.into().into_raw())
    }

    pub fn has(&self, key: impl Into<Key>) -> Result<bool> {
        self.handler.has(self, &key.into())
    }

    /// Remove a slot. Returns whether anything was removed.
    pub fn delete(&self, key: impl Into<Key>) -> Result<bool> {
        self.handler.delete(self, &key.into())
    }

    /// Number of entries. Tracks the key set (the length, for lists).
    pub fn len(&self) -> Result<usize> {
        self.handler.len(self)
    }

    pub fn is_empty(&self) -> Result<bool> {
        self.len().map(|len| len == 0)
    }

    /// Keys in order: property names, indices, map keys or set elements.
    pub fn keys(&self) -> Result<Vec<Value>> {
        Ok(self.entries()?.into_iter().map(|(key, _)| key).collect())
    }

    pub fn values(&self) -> Result<Vec<Value>> {
        Ok(self.entries()?.into_iter().map(|(_, value)| value).collect())
    }

    /// Key and value pairs in order. Sets yield each element twice.
    pub fn entries(&self) -> Result<Vec<(Value, Value)>> {
        self.handler.entries(self)
    }

    pub fn for_each(&self, mut f: impl FnMut(&Value, &Value)) -> Result<()> {
        for (key, value) in self.entries()? {
            f(&value, &key);
        }
        Ok(())
    }

    pub fn clear(&self) -> Result<()> {
        self.handler.clear(self)
    }

    /// Append to a list. Returns the new length.
    pub fn push(&self, value: impl Into<Value>) -> Result<usize> {
        self.handler.push(self, value.into().into_raw())
    }

    /// Remove the last list item. Returns `Null` on an empty list.
    pub fn pop(&self) -> Result<Value> {
        self.handler.pop(self)
    }

    /// Insert into a list, shifting later items up.
    pub fn insert(&self, index: usize, value: impl Into<Value>) -> Result<()> {
        self.handler.insert(self, index, value.into().into_raw())
    }

    /// Remove from a list, shifting later items down.
    pub fn remove(&self, index: usize) -> Result<Value> {
        self.handler.remove(self, index)
    }

    /// Resize a list, padding with `Null`.
    pub fn set_len(&self, len: usize) -> Result<()> {
        self.handler.set_len(self, len)
    }

    /// Add an element to a set or weak set.
    pub fn add(&self, value: impl Into<Value>) -> Result<()> {
        self.handler.add(self, value.into().into_raw())
    }

    /// Call `watcher` synchronously on every write to `key`.
    pub fn watch_key(
        &self,
        key: impl Into<Key>,
        watcher: impl Fn(&PropChange) + 'static,
    ) -> Result<WatcherId> {
        let prop = self.handler.prop(self, &key.into())?;
        Ok(self.rt.add_key_watcher(self.observer, prop, Rc::new(watcher)))
    }

    pub fn unwatch_key(&self, id: WatcherId) -> bool {
        self.rt.remove_key_watcher(self.observer, id)
    }

    /// Call `listener` once per batch with every change made to this
    /// container during the batch.
    pub fn add_listener(&self, listener: impl Fn(&[PropChange]) + 'static) -> ListenerId {
        self.rt.add_listener(self.observer, Rc::new(listener))
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.rt.remove_listener(self.observer, id)
    }

    /// A cell-like view onto one slot.
    pub fn to_ref(&self, key: impl Into<Key>) -> PropRef {
        PropRef {
            target: self.clone(),
            key: key.into(),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        Value::Object(self.raw.clone()).to_json()
    }

    fn data(&self) -> CellRef<'_, RawData> {
        self.raw.0.data.borrow()
    }

    fn data_mut(&self) -> RefMut<'_, RawData> {
        self.raw.0.data.borrow_mut()
    }

    fn track(&self, prop: Prop) {
        self.rt.use_prop(self.observer, prop);
    }

    fn notify(&self, prop: Prop, change: Option<PropChange>) {
        self.rt.set_prop(self.observer, prop, change, DirtyLevel::Dirty);
    }

    fn wrap(&self, value: Value) -> Value {
        self.rt.wrap(value)
    }

    fn unsupported(&self, op: &'static str) -> ReactiveError {
        ReactiveError::Unsupported {
            op,
            kind: self.kind(),
        }
    }

    fn invalid_key(&self, key: &Key) -> ReactiveError {
        ReactiveError::InvalidKey {
            key: key.to_string(),
            kind: self.kind(),
        }
    }
}

impl PartialEq for Reactive {
    fn eq(&self, other: &Self) -> bool {
        self.observer == other.observer && self.rt.ptr_eq(&other.rt)
    }
}

impl fmt::Debug for Reactive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reactive")
            .field("raw", &self.raw)
            .field("observer", &self.observer)
            .finish()
    }
}

/// One slot of a reactive container, usable like a cell.
#[derive(Debug, Clone)]
pub struct PropRef {
    target: Reactive,
    key: Key,
}

impl PropRef {
    pub fn get(&self) -> Result<Value> {
        self.target.get(self.key.clone())
    }

    pub fn set(&self, value: impl Into<Value>) -> Result<()> {
        self.target.set(self.key.clone(), value)
    }

    pub fn key(&self) -> &Key {
        &self.key
    }

    pub fn target(&self) -> &Reactive {
        &self.target
    }
}

impl Runtime {
    /// Wrap a raw container in a tracked handle.
    ///
    /// Every handle onto the same container shares one observer.
    pub fn reactive(&self, raw: Raw) -> Reactive {
        let observer = self.observer_for_raw(&raw);
        Reactive {
            rt: self.clone(),
            handler: handler_for(raw.kind()),
            raw,
            observer,
        }
    }

    /// Wrap a value if it is an unwrapped container.
    ///
    /// Primitives, cells and containers marked with [`Raw::mark_skip`] pass
    /// through unchanged.
    pub fn wrap(&self, value: impl Into<Value>) -> Value {
        match value.into() {
            Value::Object(raw) if !raw.is_skipped() => Value::Proxy(self.reactive(raw)),
            Value::Proxy(proxy) if !proxy.rt.ptr_eq(self) => {
                Value::Proxy(self.reactive(proxy.raw))
            }
            other => other,
        }
    }
}

fn change(key: Value, mutation: Mutation, old: Value, new: Value) -> PropChange {
    PropChange {
        key,
        mutation,
        old,
        new,
    }
}

fn length_change(old: usize, new: usize) -> PropChange {
    change(
        Value::from("length"),
        Mutation::Length,
        Value::from(old),
        Value::from(new),
    )
}

/// Per-kind behaviour behind a [`Reactive`].
///
/// Every operation defaults to [`ReactiveError::Unsupported`].
pub(crate) trait ContainerHandler {
    /// The observer key a user key maps to.
    fn prop(&self, p: &Reactive, key: &Key) -> Result<Prop>;

    fn get(&self, p: &Reactive, _key: &Key) -> Result<Value> {
        Err(p.unsupported("get"))
    }

    fn set(&self, p: &Reactive, _key: Key, _value: Value) -> Result<()> {
        Err(p.unsupported("set"))
    }

    fn has(&self, p: &Reactive, key: &Key) -> Result<bool>;

    fn delete(&self, p: &Reactive, key: &Key) -> Result<bool>;

    fn len(&self, p: &Reactive) -> Result<usize> {
        Err(p.unsupported("len"))
    }

    fn entries(&self, p: &Reactive) -> Result<Vec<(Value, Value)>> {
        Err(p.unsupported("entries"))
    }

    fn clear(&self, p: &Reactive) -> Result<()> {
        Err(p.unsupported("clear"))
    }

    fn add(&self, p: &Reactive, _value: Value) -> Result<()> {
        Err(p.unsupported("add"))
    }

    fn push(&self, p: &Reactive, _value: Value) -> Result<usize> {
        Err(p.unsupported("push"))
    }

    fn pop(&self, p: &Reactive) -> Result<Value> {
        Err(p.unsupported("pop"))
    }

    fn insert(&self, p: &Reactive, _index: usize, _value: Value) -> Result<()> {
        Err(p.unsupported("insert"))
    }

    fn remove(&self, p: &Reactive, _index: usize) -> Result<Value> {
        Err(p.unsupported("remove"))
    }

    fn set_len(&self, p: &Reactive, _len: usize) -> Result<()> {
        Err(p.unsupported("set_len"))
    }
}

pub(crate) fn handler_for(kind: ContainerKind) -> &'static dyn ContainerHandler {
    match kind {
        ContainerKind::Plain => &PlainHandler,
        ContainerKind::List => &ListHandler,
        ContainerKind::Map => &MapHandler,
        ContainerKind::Set => &SetHandler,
        ContainerKind::WeakMap => &WeakMapHandler,
        ContainerKind::WeakSet => &WeakSetHandler,
    }
}

// ----------------------------------------------------------------------
// Plain objects
// ----------------------------------------------------------------------

struct PlainHandler;

impl PlainHandler {
    /// Slot values read through a plain object unwrap stored cells.
    fn read_slot(p: &Reactive, slot: Option<Value>) -> Value {
        match slot {
            Some(Value::Ref(cell)) => cell.get(),
            Some(value) => p.wrap(value),
            None => Value::Null,
        }
    }
}

impl ContainerHandler for PlainHandler {
    fn prop(&self, _p: &Reactive, key: &Key) -> Result<Prop> {
        Ok(Prop::Key(Key::Str(key.property_name())))
    }

    fn get(&self, p: &Reactive, key: &Key) -> Result<Value> {
        let name = key.property_name();
        let slot = match &*p.data() {
            RawData::Plain(props) => props.get(&*name).cloned(),
            _ => return Err(p.unsupported("get")),
        };
        p.track(Prop::Key(Key::Str(name)));
        Ok(Self::read_slot(p, slot))
    }

    fn set(&self, p: &Reactive, key: Key, value: Value) -> Result<()> {
        let name = key.property_name();
        let old = match &*p.data() {
            RawData::Plain(props) => props.get(&*name).cloned(),
            _ => return Err(p.unsupported("set")),
        };
        if let Some(Value::Ref(cell)) = &old {
            if !matches!(value, Value::Ref(_)) {
                return cell.set(value);
            }
        }
        if old.as_ref().is_some_and(|old| old.is_same(&value)) {
            return Ok(());
        }

        if let RawData::Plain(props) = &mut *p.data_mut() {
            props.insert(Rc::clone(&name), value.clone());
        }

        let added = old.is_none();
        let mutation = if added { Mutation::Add } else { Mutation::Set };
        let record = change(
            Value::Str(Rc::clone(&name)),
            mutation,
            old.unwrap_or_default(),
            value,
        );
        p.rt.batch(|| {
            p.notify(Prop::Key(Key::Str(name)), Some(record));
            if added {
                p.notify(Prop::Iterate, None);
            }
        });
        Ok(())
    }

    fn has(&self, p: &Reactive, key: &Key) -> Result<bool> {
        let name = key.property_name();
        let found = match &*p.data() {
            RawData::Plain(props) => props.contains_key(&*name),
            _ => return Err(p.unsupported("has")),
        };
        p.track(Prop::Key(Key::Str(name)));
        Ok(found)
    }

    fn delete(&self, p: &Reactive, key: &Key) -> Result<bool> {
        let name = key.property_name();
        let removed = match &mut *p.data_mut() {
            RawData::Plain(props) => props.shift_remove(&*name),
            _ => return Err(p.unsupported("delete")),
        };
        let Some(old) = removed else {
            return Ok(false);
        };
        let record = change(
            Value::Str(Rc::clone(&name)),
            Mutation::Delete,
            old,
            Value::Null,
        );
        p.rt.batch(|| {
            p.notify(Prop::Key(Key::Str(name)), Some(record));
            p.notify(Prop::Iterate, None);
        });
        Ok(true)
    }

    fn len(&self, p: &Reactive) -> Result<usize> {
        let len = match &*p.data() {
            RawData::Plain(props) => props.len(),
            _ => return Err(p.unsupported("len")),
        };
        p.track(Prop::Iterate);
        Ok(len)
    }

    fn entries(&self, p: &Reactive) -> Result<Vec<(Value, Value)>> {
        let snapshot: Vec<(Rc<str>, Value)> = match &*p.data() {
            RawData::Plain(props) => props
                .iter()
                .map(|(k, v)| (Rc::clone(k), v.clone()))
                .collect(),
            _ => return Err(p.unsupported("entries")),
        };
        p.track(Prop::Iterate);
        Ok(snapshot
            .into_iter()
            .map(|(name, slot)| {
                p.track(Prop::Key(Key::Str(Rc::clone(&name))));
                (Value::Str(name), Self::read_slot(p, Some(slot)))
            })
            .collect())
    }
}

// ----------------------------------------------------------------------
// Lists
// ----------------------------------------------------------------------

struct ListHandler;

enum ListKey {
    Length,
    Index(usize),
}

impl ListHandler {
    fn parse(p: &Reactive, key: &Key) -> Result<ListKey> {
        if let Some(index) = key.as_index() {
            return Ok(ListKey::Index(index));
        }
        match key {
            Key::Str(s) if &**s == "length" => Ok(ListKey::Length),
            Key::Str(s) => s
                .parse::<usize>()
                .map(ListKey::Index)
                .map_err(|_| p.invalid_key(key)),
            _ => Err(p.invalid_key(key)),
        }
    }

    fn index_prop(index: usize) -> Prop {
        Prop::Key(Key::from(index))
    }

    fn items<R>(p: &Reactive, op: &'static str, f: impl FnOnce(&Vec<Value>) -> R) -> Result<R> {
        match &*p.data() {
            RawData::List(items) => Ok(f(items)),
            _ => Err(p.unsupported(op)),
        }
    }

    fn items_mut<R>(
        p: &Reactive,
        op: &'static str,
        f: impl FnOnce(&mut Vec<Value>) -> R,
    ) -> Result<R> {
        match &mut *p.data_mut() {
            RawData::List(items) => Ok(f(items)),
            _ => Err(p.unsupported(op)),
        }
    }

    /// Notify index readers of a shifted range and length readers.
    fn notify_shift(p: &Reactive, start: usize, before: Vec<Value>, after: Vec<Value>) {
        let old_len = start + before.len();
        let new_len = start + after.len();
        p.rt.batch(|| {
            for offset in 0..before.len().max(after.len()) {
                let old = before.get(offset).cloned().unwrap_or_default();
                let new = after.get(offset).cloned().unwrap_or_default();
                if old.is_same(&new) {
                    continue;
                }
                let mutation = match (offset < before.len(), offset < after.len()) {
                    (true, true) => Mutation::Set,
                    (false, _) => Mutation::Add,
                    (true, false) => Mutation::Delete,
                };
                let index = start + offset;
                p.notify(
                    Self::index_prop(index),
                    Some(change(Value::from(index), mutation, old, new)),
                );
            }
            if old_len != new_len {
                p.notify(Prop::Length, Some(length_change(old_len, new_len)));
            }
        });
    }
}

impl ContainerHandler for ListHandler {
    fn prop(&self, p: &Reactive, key: &Key) -> Result<Prop> {
        Ok(match Self::parse(p, key)? {
            ListKey::Length => Prop::Length,
            ListKey::Index(index) => Self::index_prop(index),
        })
    }

    fn get(&self, p: &Reactive, key: &Key) -> Result<Value> {
        match Self::parse(p, key)? {
            ListKey::Length => self.len(p).map(Value::from),
            ListKey::Index(index) => {
                let item = Self::items(p, "get", |items| items.get(index).cloned())?;
                p.track(Self::index_prop(index));
                Ok(item.map_or(Value::Null, |item| p.wrap(item)))
            }
        }
    }

    fn set(&self, p: &Reactive, key: Key, value: Value) -> Result<()> {
        let index = match Self::parse(p, &key)? {
            ListKey::Index(index) => index,
            ListKey::Length => {
                let len = Key::from(&value)
                    .as_index()
                    .ok_or_else(|| p.invalid_key(&Key::from(&value)))?;
                return self.set_len(p, len);
            }
        };

        let written = Self::items_mut(p, "set", |items| {
            let old_len = items.len();
            if index < old_len {
                if items[index].is_same(&value) {
                    return None;
                }
                let old = std::mem::replace(&mut items[index], value.clone());
                Some((Some(old), old_len))
            } else {
                items.resize(index, Value::Null);
                items.push(value.clone());
                Some((None, old_len))
            }
        })?;
        let Some((old, old_len)) = written else {
            return Ok(());
        };

        let mutation = if old.is_some() { Mutation::Set } else { Mutation::Add };
        let record = change(Value::from(index), mutation, old.unwrap_or_default(), value);
        p.rt.batch(|| {
            p.notify(Self::index_prop(index), Some(record));
            if index >= old_len {
                p.notify(Prop::Length, Some(length_change(old_len, index + 1)));
            }
        });
        Ok(())
    }

    fn has(&self, p: &Reactive, key: &Key) -> Result<bool> {
        match Self::parse(p, key)? {
            ListKey::Length => Ok(true),
            ListKey::Index(index) => {
                let len = Self::items(p, "has", Vec::len)?;
                p.track(Self::index_prop(index));
                Ok(index < len)
            }
        }
    }

    /// Deleting an index leaves a `Null` hole, like `delete list[i]`.
    fn delete(&self, p: &Reactive, key: &Key) -> Result<bool> {
        let ListKey::Index(index) = Self::parse(p, key)? else {
            return Err(p.unsupported("delete"));
        };
        let old = Self::items_mut(p, "delete", |items| {
            items
                .get_mut(index)
                .map(|slot| std::mem::replace(slot, Value::Null))
        })?;
        let Some(old) = old else {
            return Ok(false);
        };
        p.notify(
            Self::index_prop(index),
            Some(change(Value::from(index), Mutation::Delete, old, Value::Null)),
        );
        Ok(true)
    }

    fn len(&self, p: &Reactive) -> Result<usize> {
        let len = Self::items(p, "len", Vec::len)?;
        p.track(Prop::Length);
        Ok(len)
    }

    fn entries(&self, p: &Reactive) -> Result<Vec<(Value, Value)>> {
        let snapshot = Self::items(p, "entries", Vec::clone)?;
        p.track(Prop::Length);
        Ok(snapshot
            .into_iter()
            .enumerate()
            .map(|(index, item)| {
                p.track(Self::index_prop(index));
                (Value::from(index), p.wrap(item))
            })
            .collect())
    }

    fn clear(&self, p: &Reactive) -> Result<()> {
        self.set_len(p, 0)
    }

    // Mutators below never track: an effect that pushes must not depend on
    // the length it changes.

    fn push(&self, p: &Reactive, value: Value) -> Result<usize> {
        let index = Self::items(p, "push", Vec::len)?;
        self.set(p, Key::from(index), value)?;
        Ok(index + 1)
    }

    fn pop(&self, p: &Reactive) -> Result<Value> {
        let popped = Self::items_mut(p, "pop", |items| {
            let len = items.len();
            items.pop().map(|item| (item, len))
        })?;
        let Some((item, old_len)) = popped else {
            return Ok(Value::Null);
        };
        Self::notify_shift(p, old_len - 1, vec![item.clone()], Vec::new());
        Ok(p.wrap(item))
    }

    fn insert(&self, p: &Reactive, index: usize, value: Value) -> Result<()> {
        let shifted = Self::items_mut(p, "insert", |items| {
            if index > items.len() {
                return Err(ReactiveError::IndexOutOfBounds {
                    index,
                    len: items.len(),
                });
            }
            let before = items[index..].to_vec();
            items.insert(index, value);
            Ok((before, items[index..].to_vec()))
        })??;
        Self::notify_shift(p, index, shifted.0, shifted.1);
        Ok(())
    }

    fn remove(&self, p: &Reactive, index: usize) -> Result<Value> {
        let shifted = Self::items_mut(p, "remove", |items| {
            if index >= items.len() {
                return Err(ReactiveError::IndexOutOfBounds {
                    index,
                    len: items.len(),
                });
            }
            let before = items[index..].to_vec();
            let removed = items.remove(index);
            Ok((removed, before, items[index..].to_vec()))
        })??;
        let (removed, before, after) = shifted;
        Self::notify_shift(p, index, before, after);
        Ok(p.wrap(removed))
    }

    /// Shrinking notifies the length and every index at or past the new
    /// length. Growing pads with `Null` and notifies the length only.
    fn set_len(&self, p: &Reactive, len: usize) -> Result<()> {
        let (old_len, removed) = Self::items_mut(p, "set_len", |items| {
            let old_len = items.len();
            let removed = if len < old_len {
                items.split_off(len)
            } else {
                items.resize(len, Value::Null);
                Vec::new()
            };
            (old_len, removed)
        })?;
        if old_len == len {
            return Ok(());
        }
        p.rt.batch(|| {
            p.notify(Prop::Length, Some(length_change(old_len, len)));
            for (offset, old) in removed.into_iter().enumerate() {
                let index = len + offset;
                p.notify(
                    Self::index_prop(index),
                    Some(change(Value::from(index), Mutation::Delete, old, Value::Null)),
                );
            }
        });
        Ok(())
    }
}

// ----------------------------------------------------------------------
// Maps and sets
// ----------------------------------------------------------------------

struct MapHandler;

impl ContainerHandler for MapHandler {
    fn prop(&self, _p: &Reactive, key: &Key) -> Result<Prop> {
        Ok(Prop::Key(key.clone()))
    }

    fn get(&self, p: &Reactive, key: &Key) -> Result<Value> {
        let value = match &*p.data() {
            RawData::Map(entries) => entries.get(key).cloned(),
            _ => return Err(p.unsupported("get")),
        };
        p.track(Prop::Key(key.clone()));
        Ok(value.map_or(Value::Null, |value| p.wrap(value)))
    }

    fn set(&self, p: &Reactive, key: Key, value: Value) -> Result<()> {
        let old = match &mut *p.data_mut() {
            RawData::Map(entries) => entries.insert(key.clone(), value.clone()),
            _ => return Err(p.unsupported("set")),
        };
        if old.as_ref().is_some_and(|old| old.is_same(&value)) {
            return Ok(());
        }
        let added = old.is_none();
        let mutation = if added { Mutation::Add } else { Mutation::Set };
        let record = change(key.to_value(), mutation, old.unwrap_or_default(), value);
        // Iterating readers also saw the values; size readers only the keys.
        p.rt.batch(|| {
            p.notify(Prop::Key(key), Some(record));
            if added {
                p.notify(Prop::Iterate, None);
            } else {
                p.notify(Prop::Value, None);
            }
        });
        Ok(())
    }

    fn has(&self, p: &Reactive, key: &Key) -> Result<bool> {
        let found = match &*p.data() {
            RawData::Map(entries) => entries.contains_key(key),
            _ => return Err(p.unsupported("has")),
        };
        p.track(Prop::Key(key.clone()));
        Ok(found)
    }

    fn delete(&self, p: &Reactive, key: &Key) -> Result<bool> {
        let removed = match &mut *p.data_mut() {
            RawData::Map(entries) => entries.shift_remove(key),
            _ => return Err(p.unsupported("delete")),
        };
        let Some(old) = removed else {
            return Ok(false);
        };
        let record = change(key.to_value(), Mutation::Delete, old, Value::Null);
        p.rt.batch(|| {
            p.notify(Prop::Key(key.clone()), Some(record));
            p.notify(Prop::Iterate, None);
        });
        Ok(true)
    }

    fn len(&self, p: &Reactive) -> Result<usize> {
        let len = match &*p.data() {
            RawData::Map(entries) => entries.len(),
            _ => return Err(p.unsupported("len")),
        };
        p.track(Prop::Iterate);
        Ok(len)
    }

    fn entries(&self, p: &Reactive) -> Result<Vec<(Value, Value)>> {
        let snapshot: Vec<(Key, Value)> = match &*p.data() {
            RawData::Map(entries) => entries
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            _ => return Err(p.unsupported("entries")),
        };
        p.track(Prop::Iterate);
        p.track(Prop::Value);
        Ok(snapshot
            .into_iter()
            .map(|(key, value)| (p.wrap(key.to_value()), p.wrap(value)))
            .collect())
    }

    fn clear(&self, p: &Reactive) -> Result<()> {
        let cleared: IndexMap<Key, Value> = match &mut *p.data_mut() {
            RawData::Map(entries) => std::mem::take(entries),
            _ => return Err(p.unsupported("clear")),
        };
        if cleared.is_empty() {
            return Ok(());
        }
        p.rt.batch(|| {
            for (key, old) in cleared {
                let record = change(key.to_value(), Mutation::Clear, old, Value::Null);
                p.notify(Prop::Key(key), Some(record));
            }
            p.notify(Prop::Iterate, None);
        });
        Ok(())
    }
}

struct SetHandler;

impl ContainerHandler for SetHandler {
    fn prop(&self, _p: &Reactive, key: &Key) -> Result<Prop> {
        Ok(Prop::Key(key.clone()))
    }

    fn add(&self, p: &Reactive, value: Value) -> Result<()> {
        let key = Key::from(value);
        let inserted = match &mut *p.data_mut() {
            RawData::Set(items) => items.insert(key.clone()),
            _ => return Err(p.unsupported("add")),
        };
        if !inserted {
            return Ok(());
        }
        let record = change(key.to_value(), Mutation::Add, Value::Null, key.to_value());
        p.rt.batch(|| {
            p.notify(Prop::Key(key), Some(record));
            p.notify(Prop::Iterate, None);
        });
        Ok(())
    }

    fn has(&self, p: &Reactive, key: &Key) -> Result<bool> {
        let found = match &*p.data() {
            RawData::Set(items) => items.contains(key),
            _ => return Err(p.unsupported("has")),
        };
        p.track(Prop::Key(key.clone()));
        Ok(found)
    }

    fn delete(&self, p: &Reactive, key: &Key) -> Result<bool> {
        let removed = match &mut *p.data_mut() {
            RawData::Set(items) => items.shift_remove(key),
            _ => return Err(p.unsupported("delete")),
        };
        if !removed {
            return Ok(false);
        }
        let record = change(key.to_value(), Mutation::Delete, key.to_value(), Value::Null);
        p.rt.batch(|| {
            p.notify(Prop::Key(key.clone()), Some(record));
            p.notify(Prop::Iterate, None);
        });
        Ok(true)
    }

    fn len(&self, p: &Reactive) -> Result<usize> {
        let len = match &*p.data() {
            RawData::Set(items) => items.len(),
            _ => return Err(p.unsupported("len")),
        };
        p.track(Prop::Iterate);
        Ok(len)
    }

    fn entries(&self, p: &Reactive) -> Result<Vec<(Value, Value)>> {
        let snapshot: Vec<Key> = match &*p.data() {
            RawData::Set(items) => items.iter().cloned().collect(),
            _ => return Err(p.unsupported("entries")),
        };
        p.track(Prop::Iterate);
        Ok(snapshot
            .into_iter()
            .map(|key| {
                let item = p.wrap(key.to_value());
                (item.clone(), item)
            })
            .collect())
    }

    fn clear(&self, p: &Reactive) -> Result<()> {
        let cleared = match &mut *p.data_mut() {
            RawData::Set(items) => std::mem::take(items),
            _ => return Err(p.unsupported("clear")),
        };
        if cleared.is_empty() {
            return Ok(());
        }
        p.rt.batch(|| {
            for key in cleared {
                let record = change(key.to_value(), Mutation::Clear, key.to_value(), Value::Null);
                p.notify(Prop::Key(key), Some(record));
            }
            p.notify(Prop::Iterate, None);
        });
        Ok(())
    }
}

// ----------------------------------------------------------------------
// Weak collections
// ----------------------------------------------------------------------

fn weak_key(key: &Key) -> Result<Raw> {
    match key {
        Key::Object(raw) => Ok(raw.clone()),
        _ => Err(ReactiveError::InvalidWeakKey),
    }
}

struct WeakMapHandler;

impl ContainerHandler for WeakMapHandler {
    fn prop(&self, _p: &Reactive, key: &Key) -> Result<Prop> {
        Ok(Prop::Addr(weak_key(key)?.addr()))
    }

    fn get(&self, p: &Reactive, key: &Key) -> Result<Value> {
        let addr = weak_key(key)?.addr();
        let value = match &*p.data() {
            RawData::WeakMap(entries) => entries
                .get(&addr)
                .filter(|(weak, _)| weak.strong_count() > 0)
                .map(|(_, value)| value.clone()),
            _ => return Err(p.unsupported("get")),
        };
        p.track(Prop::Addr(addr));
        Ok(value.map_or(Value::Null, |value| p.wrap(value)))
    }

    fn set(&self, p: &Reactive, key: Key, value: Value) -> Result<()> {
        let raw = weak_key(&key)?;
        let addr = raw.addr();
        let old = match &mut *p.data_mut() {
            RawData::WeakMap(entries) => {
                entries.retain(|_, (weak, _)| weak.strong_count() > 0);
                entries
                    .insert(addr, (raw.downgrade(), value.clone()))
                    .map(|(_, old)| old)
            }
            _ => return Err(p.unsupported("set")),
        };
        if old.as_ref().is_some_and(|old| old.is_same(&value)) {
            return Ok(());
        }
        let mutation = if old.is_some() { Mutation::Set } else { Mutation::Add };
        p.notify(
            Prop::Addr(addr),
            Some(change(Value::Object(raw), mutation, old.unwrap_or_default(), value)),
        );
        Ok(())
    }

    fn has(&self, p: &Reactive, key: &Key) -> Result<bool> {
        let addr = weak_key(key)?.addr();
        let found = match &*p.data() {
            RawData::WeakMap(entries) => entries
                .get(&addr)
                .is_some_and(|(weak, _)| weak.strong_count() > 0),
            _ => return Err(p.unsupported("has")),
        };
        p.track(Prop::Addr(addr));
        Ok(found)
    }

    fn delete(&self, p: &Reactive, key: &Key) -> Result<bool> {
        let raw = weak_key(key)?;
        let addr = raw.addr();
        let removed = match &mut *p.data_mut() {
            RawData::WeakMap(entries) => entries
                .shift_remove(&addr)
                .filter(|(weak, _)| weak.strong_count() > 0),
            _ => return Err(p.unsupported("delete")),
        };
        let Some((_, old)) = removed else {
            return Ok(false);
        };
        p.notify(
            Prop::Addr(addr),
            Some(change(Value::Object(raw), Mutation::Delete, old, Value::Null)),
        );
        Ok(true)
    }
}

struct WeakSetHandler;

impl ContainerHandler for WeakSetHandler {
    fn prop(&self, _p: &Reactive, key: &Key) -> Result<Prop> {
        Ok(Prop::Addr(weak_key(key)?.addr()))
    }

    fn add(&self, p: &Reactive, value: Value) -> Result<()> {
        let raw = weak_key(&Key::from(value))?;
        let addr = raw.addr();
        let inserted = match &mut *p.data_mut() {
            RawData::WeakSet(items) => {
                items.retain(|_, weak| weak.strong_count() > 0);
                items.insert(addr, raw.downgrade()).is_none()
            }
            _ => return Err(p.unsupported("add")),
        };
        if inserted {
            let item = Value::Object(raw);
            p.notify(
                Prop::Addr(addr),
                Some(change(item.clone(), Mutation::Add, Value::Null, item)),
            );
        }
        Ok(())
    }

    fn has(&self, p: &Reactive, key: &Key) -> Result<bool> {
        let addr = weak_key(key)?.addr();
        let found = match &*p.data() {
            RawData::WeakSet(items) => items.get(&addr).is_some_and(|w| w.strong_count() > 0),
            _ => return Err(p.unsupported("has")),
        };
        p.track(Prop::Addr(addr));
        Ok(found)
    }

    fn delete(&self, p: &Reactive, key: &Key) -> Result<bool> {
        let raw = weak_key(key)?;
        let addr = raw.addr();
        let removed = match &mut *p.data_mut() {
            RawData::WeakSet(items) => items
                .shift_remove(&addr)
                .is_some_and(|weak| weak.strong_count() > 0),
            _ => return Err(p.unsupported("delete")),
        };
        if removed {
            let item = Value::Object(raw);
            p.notify(
                Prop::Addr(addr),
                Some(change(item.clone(), Mutation::Delete, item, Value::Null)),
            );
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::WatchOptions;
    use std::cell::{Cell, RefCell};

    fn counter() -> Rc<Cell<usize>> {
        Rc::new(Cell::new(0))
    }

    fn effect_on(
        rt: &Runtime,
        runs: &Rc<Cell<usize>>,
        read: impl Fn() + 'static,
    ) -> crate::WatchHandle {
        let runs = runs.clone();
        rt.watch_effect(move || {
            read();
            runs.set(runs.get() + 1);
        })
    }

    #[test]
    fn reads_bind_only_the_key_read() {
        let rt = Runtime::new();
        let state = rt.reactive(Raw::object([("a", 1), ("b", 2)]));
        let runs = counter();
        let _effect = {
            let state = state.clone();
            effect_on(&rt, &runs, move || {
                let _ = state.get("a");
            })
        };
        assert_eq!(runs.get(), 1);

        state.set("b", 3).unwrap();
        assert_eq!(runs.get(), 1);
        state.set("a", 5).unwrap();
        assert_eq!(runs.get(), 2);
    }

    #[test]
    fn identical_writes_notify_nobody() {
        let rt = Runtime::new();
        let nested = Raw::plain();
        let state = rt.reactive(Raw::object([("n", Value::Object(nested.clone()))]));
        let runs = counter();
        let _effect = {
            let state = state.clone();
            effect_on(&rt, &runs, move || {
                let _ = state.get("n");
            })
        };

        state.set("n", Value::Object(nested.clone())).unwrap();
        let proxied = rt.reactive(nested);
        state.set("n", proxied).unwrap();
        assert_eq!(runs.get(), 1);
    }

    #[test]
    fn nested_containers_wrap_lazily_and_store_raw() {
        let rt = Runtime::new();
        let inner = Raw::object([("x", 1)]);
        let state = rt.reactive(Raw::object([("inner", Value::Object(inner.clone()))]));

        let read = state.get("inner").unwrap();
        let proxy = read.as_proxy().cloned().unwrap();
        assert!(proxy.raw().ptr_eq(&inner));
        assert_eq!(proxy, rt.reactive(inner.clone()));

        state.set("copy", read).unwrap();
        assert!(matches!(state.raw().peek("copy"), Some(Value::Object(_))));
    }

    #[test]
    fn skipped_containers_pass_through() {
        let rt = Runtime::new();
        let opaque = Raw::plain().mark_skip();
        let state = rt.reactive(Raw::object([("opaque", Value::Object(opaque))]));
        assert!(matches!(state.get("opaque").unwrap(), Value::Object(_)));
    }

    #[test]
    fn plain_slots_unwrap_refs() {
        let rt = Runtime::new();
        let cell = rt.new_ref(1);
        let state = rt.reactive(Raw::object([("count", Value::Ref(cell.clone()))]));

        assert_eq!(state.get("count").unwrap().as_f64(), Some(1.0));
        state.set("count", 2).unwrap();
        assert_eq!(cell.get().as_f64(), Some(2.0));
        assert!(matches!(state.raw().peek("count"), Some(Value::Ref(_))));
    }

    #[test]
    fn lists_do_not_unwrap_refs() {
        let rt = Runtime::new();
        let cell = rt.new_ref(1);
        let list = rt.reactive(Raw::list([Value::Ref(cell)]));
        assert!(matches!(list.get(0).unwrap(), Value::Ref(_)));
    }

    #[test]
    fn adding_a_key_wakes_iteration() {
        let rt = Runtime::new();
        let state = rt.reactive(Raw::object([("a", 1)]));
        let runs = counter();
        let _effect = {
            let state = state.clone();
            effect_on(&rt, &runs, move || {
                let _ = state.keys();
            })
        };

        state.set("a", 2).unwrap();
        assert_eq!(runs.get(), 2, "iteration also reads every value");
        state.set("b", 1).unwrap();
        assert_eq!(runs.get(), 3);
        state.delete("b").unwrap();
        assert_eq!(runs.get(), 4);
        assert!(!state.delete("missing").unwrap());
        assert_eq!(runs.get(), 4);
    }

    #[test]
    fn shrinking_a_list_wakes_truncated_indices() {
        let rt = Runtime::new();
        let list = rt.reactive(Raw::list([1, 2, 3]));
        let runs = counter();
        let _effect = {
            let list = list.clone();
            effect_on(&rt, &runs, move || {
                let _ = list.get(2);
            })
        };

        list.set_len(5).unwrap();
        assert_eq!(runs.get(), 1);
        list.set_len(2).unwrap();
        assert_eq!(runs.get(), 2);
        assert_eq!(list.len().unwrap(), 2);
    }

    #[test]
    fn push_wakes_length_readers_without_tracking() {
        let rt = Runtime::new();
        let list = rt.reactive(Raw::list(Vec::<Value>::new()));
        let lengths = Rc::new(RefCell::new(Vec::new()));
        let _effect = {
            let (list, lengths) = (list.clone(), lengths.clone());
            rt.watch_effect(move || lengths.borrow_mut().push(list.len().unwrap_or(0)))
        };

        // An effect that pushes does not subscribe to the length it changes.
        let _pusher = {
            let list = list.clone();
            rt.watch_effect(move || {
                let _ = list.push("x");
            })
        };
        list.push("y").unwrap();
        assert_eq!(*lengths.borrow(), vec![0, 1, 2]);
    }

    #[test]
    fn list_insert_and_remove_shift_items() {
        let rt = Runtime::new();
        let list = rt.reactive(Raw::list(["a", "c"]));
        list.insert(1, "b").unwrap();
        let items: Vec<_> = list
            .values()
            .unwrap()
            .iter()
            .map(|v| v.as_str().unwrap_or_default().to_string())
            .collect();
        assert_eq!(items, ["a", "b", "c"]);

        assert_eq!(list.remove(0).unwrap().as_str(), Some("a"));
        assert_eq!(list.pop().unwrap().as_str(), Some("c"));
        assert_eq!(list.len().unwrap(), 1);
        assert_eq!(
            list.remove(5),
            Err(ReactiveError::IndexOutOfBounds { index: 5, len: 1 })
        );
    }

    #[test]
    fn list_length_key() {
        let rt = Runtime::new();
        let list = rt.reactive(Raw::list([1, 2, 3]));
        assert_eq!(list.get("length").unwrap().as_f64(), Some(3.0));
        list.set("length", 1).unwrap();
        assert_eq!(list.len().unwrap(), 1);
        assert!(matches!(
            list.get("name"),
            Err(ReactiveError::InvalidKey { .. })
        ));
    }

    #[test]
    fn map_add_wakes_size_readers() {
        let rt = Runtime::new();
        let map = rt.reactive(Raw::map());
        let runs = counter();
        let _effect = {
            let map = map.clone();
            effect_on(&rt, &runs, move || {
                let _ = map.len();
            })
        };

        map.set("a", 1).unwrap();
        assert_eq!(runs.get(), 2);
        map.set("a", 2).unwrap();
        assert_eq!(runs.get(), 2);
        map.clear().unwrap();
        assert_eq!(runs.get(), 3);
    }

    #[test]
    fn map_value_change_wakes_iterating_readers() {
        let rt = Runtime::new();
        let map = rt.reactive(Raw::map());
        map.set("a", 1).unwrap();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let _effect = {
            let (map, seen) = (map.clone(), seen.clone());
            rt.watch_effect(move || {
                let values: Vec<f64> = map
                    .values()
                    .unwrap_or_default()
                    .iter()
                    .filter_map(Value::as_f64)
                    .collect();
                seen.borrow_mut().push(values);
            })
        };

        map.set("a", 2).unwrap();
        assert_eq!(*seen.borrow(), vec![vec![1.0], vec![2.0]]);
        map.set("a", 2).unwrap();
        assert_eq!(seen.borrow().len(), 2);
    }

    #[test]
    fn deep_watch_on_a_map_sees_value_changes() {
        let rt = Runtime::new();
        let map = rt.reactive(Raw::map());
        map.set("a", 1).unwrap();
        let calls = counter();
        let _watch = {
            let calls = calls.clone();
            rt.watch(
                &map,
                move |_: &Value, _: Option<&Value>| calls.set(calls.get() + 1),
                WatchOptions::default(),
            )
        };

        map.set("a", 2).unwrap();
        assert_eq!(calls.get(), 1);
        map.set("b", 3).unwrap();
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn map_keys_are_unwrapped_containers() {
        let rt = Runtime::new();
        let key = Raw::plain();
        let map = rt.reactive(Raw::map());
        map.set(&rt.reactive(key.clone()), "proxied").unwrap();
        assert_eq!(map.get(&key).unwrap().as_str(), Some("proxied"));
    }

    #[test]
    fn set_add_and_has() {
        let rt = Runtime::new();
        let set = rt.reactive(Raw::set());
        let runs = counter();
        let _effect = {
            let set = set.clone();
            effect_on(&rt, &runs, move || {
                let _ = set.has("x");
            })
        };

        set.add("y").unwrap();
        assert_eq!(runs.get(), 1);
        set.add("x").unwrap();
        assert_eq!(runs.get(), 2);
        set.add("x").unwrap();
        assert_eq!(runs.get(), 2);
        assert!(set.delete("x").unwrap());
        assert_eq!(runs.get(), 3);
    }

    #[test]
    fn weak_collections_require_object_keys() {
        let rt = Runtime::new();
        let weak = rt.reactive(Raw::weak_map());
        assert_eq!(weak.set("a", 1), Err(ReactiveError::InvalidWeakKey));

        let key = Raw::plain();
        weak.set(&key, 1).unwrap();
        assert!(weak.has(&key).unwrap());
        assert_eq!(weak.get(&key).unwrap().as_f64(), Some(1.0));
        assert!(matches!(weak.len(), Err(ReactiveError::Unsupported { .. })));

        let seen = Rc::new(RefCell::new(Vec::new()));
        let set = rt.reactive(Raw::weak_set());
        assert_eq!(set.add(1), Err(ReactiveError::InvalidWeakKey));
        set.add(key.clone()).unwrap();
        assert!(set.has(&key).unwrap());
        set.add_listener({
            let seen = seen.clone();
            move |changes| seen.borrow_mut().extend(changes.iter().map(|c| c.mutation))
        });
        assert!(set.delete(&key).unwrap());
        assert_eq!(*seen.borrow(), vec![Mutation::Delete]);
    }

    #[test]
    fn unsupported_operations_are_errors() {
        let rt = Runtime::new();
        let map = rt.reactive(Raw::map());
        assert_eq!(
            map.push(1),
            Err(ReactiveError::Unsupported {
                op: "push",
                kind: ContainerKind::Map
            })
        );
        let set = rt.reactive(Raw::set());
        assert!(matches!(set.get("a"), Err(ReactiveError::Unsupported { .. })));
    }

    #[test]
    fn key_watchers_and_listeners() {
        let rt = Runtime::new();
        let state = rt.reactive(Raw::object([("a", 1)]));
        let watched = Rc::new(RefCell::new(Vec::new()));
        let batches = Rc::new(RefCell::new(Vec::new()));

        let watcher = {
            let watched = watched.clone();
            state
                .watch_key("a", move |change| watched.borrow_mut().push(change.new.as_f64()))
                .unwrap()
        };
        let listener = {
            let batches = batches.clone();
            state.add_listener(move |changes| batches.borrow_mut().push(changes.len()))
        };

        rt.batch(|| {
            state.set("a", 2).unwrap();
            state.set("b", 3).unwrap();
            assert_eq!(watched.borrow().len(), 1, "watchers are synchronous");
            assert!(batches.borrow().is_empty(), "listeners wait for the flush");
        });
        assert_eq!(*watched.borrow(), vec![Some(2.0)]);
        assert_eq!(*batches.borrow(), vec![2]);

        assert!(state.unwatch_key(watcher));
        assert!(state.remove_listener(listener));
        state.set("a", 4).unwrap();
        assert_eq!(watched.borrow().len(), 1);
        assert_eq!(batches.borrow().len(), 1);
    }

    #[test]
    fn to_ref_reads_and_writes_one_slot() {
        let rt = Runtime::new();
        let state = rt.reactive(Raw::object([("name", "ada")]));
        let name = state.to_ref("name");
        assert_eq!(name.get().unwrap().as_str(), Some("ada"));
        name.set("grace").unwrap();
        assert_eq!(state.get("name").unwrap().as_str(), Some("grace"));

        let seen = Rc::new(RefCell::new(Vec::new()));
        let _watch = {
            let (name, seen) = (name.clone(), seen.clone());
            rt.watch(
                crate::WatchSource::getter(move || name.get().unwrap_or_default()),
                move |new: &Value, _: Option<&Value>| {
                    seen.borrow_mut().push(new.as_str().map(str::to_owned))
                },
                WatchOptions::default(),
            )
        };
        state.set("name", "linus").unwrap();
        assert_eq!(*seen.borrow(), vec![Some("linus".to_owned())]);
    }
}
