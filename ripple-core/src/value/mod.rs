//! Dynamic Values
//!
//! The engine tracks reads and writes on dynamically shaped state: plain
//! objects, lists and keyed collections nested arbitrarily deep. This module
//! defines that state.
//!
//! - [`Value`] is a single slot: a primitive, a raw container, a reactive
//!   cell or a reactive handle onto a container.
//! - [`Raw`] is a container with identity. Cloning a `Raw` shares the
//!   container, exactly like copying an object reference.
//! - [`Key`] addresses a slot inside a container.
//!
//! Equality on `Value` is identity (`SameValue`): primitives compare by value
//! with `NaN` equal to itself, containers compare by allocation. Writes use it
//! to decide whether anything changed.

mod proxy;

pub use proxy::{PropRef, Reactive};

use std::cell::{Cell, RefCell};
use std::collections::HashSet;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::rc::{Rc, Weak};

use indexmap::{IndexMap, IndexSet};
use serde::Serialize;

use crate::reactive::Ref;

/// Shape of a raw container, fixed at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ContainerKind {
    /// String-keyed object with insertion-ordered properties.
    Plain,
    /// Indexed list with a `length`.
    List,
    /// Keyed collection with arbitrary keys.
    Map,
    /// Collection of unique elements.
    Set,
    /// Map keyed weakly by object identity.
    WeakMap,
    /// Set holding objects weakly.
    WeakSet,
}

impl fmt::Display for ContainerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

pub(crate) enum RawData {
    Plain(IndexMap<Rc<str>, Value>),
    List(Vec<Value>),
    Map(IndexMap<Key, Value>),
    Set(IndexSet<Key>),
    WeakMap(IndexMap<usize, (Weak<RawInner>, Value)>),
    WeakSet(IndexMap<usize, Weak<RawInner>>),
}

pub(crate) struct RawInner {
    kind: ContainerKind,
    pub(crate) data: RefCell<RawData>,
    skip: Cell<bool>,
}

/// A raw container with identity.
#[derive(Clone)]
pub struct Raw(pub(crate) Rc<RawInner>);

impl Raw {
    fn from_data(kind: ContainerKind, data: RawData) -> Self {
        Raw(Rc::new(RawInner {
            kind,
            data: RefCell::new(data),
            skip: Cell::new(false),
        }))
    }

    /// An empty plain object.
    pub fn plain() -> Self {
        Self::from_data(ContainerKind::Plain, RawData::Plain(IndexMap::new()))
    }

    /// A plain object with the given properties.
    pub fn object<K, V, I>(entries: I) -> Self
    where
        K: Into<Rc<str>>,
        V: Into<Value>,
        I: IntoIterator<Item = (K, V)>,
    {
        let props = entries
            .into_iter()
            .map(|(key, value)| (key.into(), Into::<Value>::into(value).into_raw()))
            .collect();
        Self::from_data(ContainerKind::Plain, RawData::Plain(props))
    }

    /// A list holding the given items.
    pub fn list<V: Into<Value>, I: IntoIterator<Item = V>>(items: I) -> Self {
        let items = items
            .into_iter()
            .map(|v| Into::<Value>::into(v).into_raw())
            .collect();
        Self::from_data(ContainerKind::List, RawData::List(items))
    }

    /// An empty keyed collection.
    pub fn map() -> Self {
        Self::from_data(ContainerKind::Map, RawData::Map(IndexMap::new()))
    }

    /// An empty set.
    pub fn set() -> Self {
        Self::from_data(ContainerKind::Set, RawData::Set(IndexSet::new()))
    }

    /// An empty weakly keyed map.
    pub fn weak_map() -> Self {
        Self::from_data(ContainerKind::WeakMap, RawData::WeakMap(IndexMap::new()))
    }

    /// An empty weak set.
    pub fn weak_set() -> Self {
        Self::from_data(ContainerKind::WeakSet, RawData::WeakSet(IndexMap::new()))
    }

    /// The container's shape.
    pub fn kind(&self) -> ContainerKind {
        self.0.kind
    }

    /// Address of the allocation, stable for the container's lifetime.
    pub fn addr(&self) -> usize {
        Rc::as_ptr(&self.0) as *const () as usize
    }

    /// Whether both handles share one container.
    pub fn ptr_eq(&self, other: &Raw) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    /// Opt this container out of reactivity. Wrapping passes it through.
    pub fn mark_skip(self) -> Self {
        self.0.skip.set(true);
        self
    }

    /// Whether [`Raw::mark_skip`] was called.
    pub fn is_skipped(&self) -> bool {
        self.0.skip.get()
    }

    pub(crate) fn downgrade(&self) -> Weak<RawInner> {
        Rc::downgrade(&self.0)
    }

    /// Number of entries, without tracking. Weak collections count live keys.
    pub fn len(&self) -> usize {
        match &*self.0.data.borrow() {
            RawData::Plain(props) => props.len(),
            RawData::List(items) => items.len(),
            RawData::Map(entries) => entries.len(),
            RawData::Set(items) => items.len(),
            RawData::WeakMap(entries) => entries
                .values()
                .filter(|(key, _)| key.strong_count() > 0)
                .count(),
            RawData::WeakSet(items) => items.values().filter(|k| k.strong_count() > 0).count(),
        }
    }

    /// Whether [`Raw::len`] is zero.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read a slot without tracking or wrapping.
    ///
    /// Sets answer with the element itself when present.
    pub fn peek(&self, key: impl Into<Key>) -> Option<Value> {
        let key = key.into();
        let data = self.0.data.borrow();
        match &*data {
            RawData::Plain(props) => props.get(&*key.property_name()).cloned(),
            RawData::List(items) => key.as_index().and_then(|i| items.get(i).cloned()),
            RawData::Map(entries) => entries.get(&key).cloned(),
            RawData::Set(items) => items.get(&key).map(Key::to_value),
            RawData::WeakMap(entries) => key
                .object_addr()
                .and_then(|addr| entries.get(&addr))
                .filter(|(weak, _)| weak.strong_count() > 0)
                .map(|(_, value)| value.clone()),
            RawData::WeakSet(items) => key
                .object_addr()
                .filter(|addr| items.get(addr).is_some_and(|w| w.strong_count() > 0))
                .map(|_| key.to_value()),
        }
    }

    /// List items or plain property values in order, without tracking.
    pub(crate) fn items(&self) -> Vec<Value> {
        match &*self.0.data.borrow() {
            RawData::Plain(props) => props.values().cloned().collect(),
            RawData::List(items) => items.clone(),
            RawData::Map(entries) => entries.values().cloned().collect(),
            RawData::Set(items) => items.iter().map(Key::to_value).collect(),
            RawData::WeakMap(_) | RawData::WeakSet(_) => Vec::new(),
        }
    }

    /// Plain properties in order, without tracking. Empty for other kinds.
    pub(crate) fn properties(&self) -> Vec<(Rc<str>, Value)> {
        match &*self.0.data.borrow() {
            RawData::Plain(props) => props
                .iter()
                .map(|(k, v)| (Rc::clone(k), v.clone()))
                .collect(),
            _ => Vec::new(),
        }
    }
}

impl fmt::Debug for Raw {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{:#x}", self.kind(), self.addr())
    }
}

/// One slot of dynamic state.
#[derive(Clone, Default)]
pub enum Value {
    /// Absent or null.
    #[default]
    Null,
    /// Boolean primitive.
    Bool(bool),
    /// Numeric primitive.
    Number(f64),
    /// String primitive.
    Str(Rc<str>),
    /// A raw container. Reads through it are not tracked.
    Object(Raw),
    /// A reactive cell stored in a slot.
    Ref(Ref),
    /// A reactive handle onto a container. Reads through it are tracked.
    Proxy(Reactive),
}

impl Value {
    /// A plain object value.
    pub fn object<K, V, I>(entries: I) -> Self
    where
        K: Into<Rc<str>>,
        V: Into<Value>,
        I: IntoIterator<Item = (K, V)>,
    {
        Value::Object(Raw::object(entries))
    }

    /// A list value.
    pub fn list<V: Into<Value>, I: IntoIterator<Item = V>>(items: I) -> Self {
        Value::Object(Raw::list(items))
    }

    /// Identity comparison (`SameValue`).
    pub fn is_same(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => {
                (a.is_nan() && b.is_nan()) || (a == b && a.is_sign_negative() == b.is_sign_negative())
            }
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Ref(a), Value::Ref(b)) => a.ptr_eq(b),
            (a, b) => match (a.as_raw(), b.as_raw()) {
                (Some(a), Some(b)) => a.ptr_eq(&b),
                _ => false,
            },
        }
    }

    /// Null, bool, number or string.
    pub fn is_primitive(&self) -> bool {
        matches!(
            self,
            Value::Null | Value::Bool(_) | Value::Number(_) | Value::Str(_)
        )
    }

    /// A raw or proxied container.
    pub fn is_container(&self) -> bool {
        matches!(self, Value::Object(_) | Value::Proxy(_))
    }

    /// The underlying container, for raw and proxied values.
    pub fn as_raw(&self) -> Option<Raw> {
        match self {
            Value::Object(raw) => Some(raw.clone()),
            Value::Proxy(proxy) => Some(proxy.raw()),
            _ => None,
        }
    }

    /// Strip the reactive wrapper off a proxied container.
    pub fn into_raw(self) -> Value {
        match self {
            Value::Proxy(proxy) => Value::Object(proxy.raw()),
            other => other,
        }
    }

    /// The reactive handle, if this value is proxied.
    pub fn as_proxy(&self) -> Option<&Reactive> {
        match self {
            Value::Proxy(proxy) => Some(proxy),
            _ => None,
        }
    }

    /// The reactive cell, if this value is one.
    pub fn as_ref_cell(&self) -> Option<&Ref> {
        match self {
            Value::Ref(cell) => Some(cell),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Build a value from JSON. Objects become plain containers, arrays lists.
    pub fn from_json(json: serde_json::Value) -> Value {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => Value::Number(n.as_f64().unwrap_or(f64::NAN)),
            serde_json::Value::String(s) => Value::Str(s.into()),
            serde_json::Value::Array(items) => {
                Value::list(items.into_iter().map(Value::from_json))
            }
            serde_json::Value::Object(props) => Value::object(
                props
                    .into_iter()
                    .map(|(k, v)| (Rc::<str>::from(k), Value::from_json(v))),
            ),
        }
    }

    /// Untracked JSON snapshot.
    ///
    /// Maps become arrays of `[key, value]` pairs, sets arrays, weak
    /// collections and cycles `null`. Cells contribute their current value.
    pub fn to_json(&self) -> serde_json::Value {
        let mut seen = HashSet::new();
        self.to_json_inner(&mut seen)
    }

    fn to_json_inner(&self, seen: &mut HashSet<usize>) -> serde_json::Value {
        use serde_json::Value as Json;

        match self {
            Value::Null => Json::Null,
            Value::Bool(b) => Json::Bool(*b),
            Value::Number(n) => serde_json::Number::from_f64(*n)
                .map(Json::Number)
                .unwrap_or(Json::Null),
            Value::Str(s) => Json::String(s.to_string()),
            Value::Ref(cell) => cell.get_untracked().to_json_inner(seen),
            Value::Object(_) | Value::Proxy(_) => {
                let Some(raw) = self.as_raw() else {
                    return Json::Null;
                };
                if !seen.insert(raw.addr()) {
                    return Json::Null;
                }
                let json = match &*raw.0.data.borrow() {
                    RawData::Plain(props) => Json::Object(
                        props
                            .iter()
                            .map(|(k, v)| (k.to_string(), v.to_json_inner(seen)))
                            .collect(),
                    ),
                    RawData::List(items) => {
                        Json::Array(items.iter().map(|v| v.to_json_inner(seen)).collect())
                    }
                    RawData::Map(entries) => Json::Array(
                        entries
                            .iter()
                            .map(|(k, v)| {
                                Json::Array(vec![
                                    k.to_value().to_json_inner(seen),
                                    v.to_json_inner(seen),
                                ])
                            })
                            .collect(),
                    ),
                    RawData::Set(items) => Json::Array(
                        items
                            .iter()
                            .map(|k| k.to_value().to_json_inner(seen))
                            .collect(),
                    ),
                    RawData::WeakMap(_) | RawData::WeakSet(_) => Json::Null,
                };
                seen.remove(&raw.addr());
                json
            }
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.is_same(other)
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("Null"),
            Value::Bool(b) => write!(f, "Bool({b})"),
            Value::Number(n) => write!(f, "Number({n})"),
            Value::Str(s) => write!(f, "Str({s:?})"),
            Value::Object(raw) => write!(f, "Object({raw:?})"),
            Value::Ref(cell) => write!(f, "Ref({:#x})", cell.addr()),
            Value::Proxy(proxy) => write!(f, "Proxy({:?})", proxy.raw()),
        }
    }
}

macro_rules! number_from {
    ($($ty:ty),*) => {
        $(impl From<$ty> for Value {
            fn from(n: $ty) -> Self {
                Value::Number(n as f64)
            }
        })*
    };
}

number_from!(f64, f32, i32, i64, u32, u64, usize);

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.into())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s.into())
    }
}

impl From<Rc<str>> for Value {
    fn from(s: Rc<str>) -> Self {
        Value::Str(s)
    }
}

impl From<Raw> for Value {
    fn from(raw: Raw) -> Self {
        Value::Object(raw)
    }
}

impl From<Reactive> for Value {
    fn from(proxy: Reactive) -> Self {
        Value::Proxy(proxy)
    }
}

impl From<Ref> for Value {
    fn from(cell: Ref) -> Self {
        Value::Ref(cell)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Value::Null)
    }
}

/// Address of a slot inside a container.
///
/// Hashing and equality follow `SameValueZero`: `0.0` equals `-0.0`, `NaN`
/// equals itself, containers and cells compare by identity.
#[derive(Clone)]
pub enum Key {
    /// Null key.
    Null,
    /// Boolean key.
    Bool(bool),
    /// Numeric key; list indices are non-negative integral numbers.
    Number(f64),
    /// String key; plain object properties are always strings.
    Str(Rc<str>),
    /// Container key, by identity.
    Object(Raw),
    /// Cell key, by identity.
    Cell(Ref),
}

impl Key {
    /// The key as a slot value.
    pub fn to_value(&self) -> Value {
        match self {
            Key::Null => Value::Null,
            Key::Bool(b) => Value::Bool(*b),
            Key::Number(n) => Value::Number(*n),
            Key::Str(s) => Value::Str(Rc::clone(s)),
            Key::Object(raw) => Value::Object(raw.clone()),
            Key::Cell(cell) => Value::Ref(cell.clone()),
        }
    }

    /// List index, if the key is a non-negative integral number.
    pub fn as_index(&self) -> Option<usize> {
        match self {
            Key::Number(n) if *n >= 0.0 && n.fract() == 0.0 && n.is_finite() => {
                Some(*n as usize)
            }
            _ => None,
        }
    }

    /// Property name used when the key addresses a plain object.
    pub fn property_name(&self) -> Rc<str> {
        match self {
            Key::Str(s) => Rc::clone(s),
            Key::Null => "null".into(),
            Key::Bool(b) => b.to_string().into(),
            Key::Number(n) => format_number(*n).into(),
            Key::Object(_) | Key::Cell(_) => "[object]".into(),
        }
    }

    pub(crate) fn object_addr(&self) -> Option<usize> {
        match self {
            Key::Object(raw) => Some(raw.addr()),
            _ => None,
        }
    }

    fn normalized_bits(n: f64) -> u64 {
        if n.is_nan() {
            f64::NAN.to_bits()
        } else if n == 0.0 {
            0
        } else {
            n.to_bits()
        }
    }
}

fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n.is_finite() && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        n.to_string()
    }
}

impl PartialEq for Key {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Key::Null, Key::Null) => true,
            (Key::Bool(a), Key::Bool(b)) => a == b,
            (Key::Number(a), Key::Number(b)) => {
                Key::normalized_bits(*a) == Key::normalized_bits(*b)
            }
            (Key::Str(a), Key::Str(b)) => a == b,
            (Key::Object(a), Key::Object(b)) => a.ptr_eq(b),
            (Key::Cell(a), Key::Cell(b)) => a.ptr_eq(b),
            _ => false,
        }
    }
}

impl Eq for Key {}

impl Hash for Key {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Key::Null => {}
            Key::Bool(b) => b.hash(state),
            Key::Number(n) => Key::normalized_bits(*n).hash(state),
            Key::Str(s) => s.hash(state),
            Key::Object(raw) => raw.addr().hash(state),
            Key::Cell(cell) => cell.addr().hash(state),
        }
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::Object(raw) => write!(f, "{raw:?}"),
            Key::Cell(cell) => write!(f, "Ref({:#x})", cell.addr()),
            Key::Str(s) => write!(f, "{s:?}"),
            other => f.write_str(&other.property_name()),
        }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl From<Value> for Key {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => Key::Null,
            Value::Bool(b) => Key::Bool(b),
            Value::Number(n) => Key::Number(n),
            Value::Str(s) => Key::Str(s),
            Value::Object(raw) => Key::Object(raw),
            Value::Proxy(proxy) => Key::Object(proxy.raw()),
            Value::Ref(cell) => Key::Cell(cell),
        }
    }
}

impl From<&Value> for Key {
    fn from(value: &Value) -> Self {
        Key::from(value.clone())
    }
}

macro_rules! key_from {
    ($($ty:ty),*) => {
        $(impl From<$ty> for Key {
            fn from(n: $ty) -> Self {
                Key::Number(n as f64)
            }
        })*
    };
}

key_from!(f64, i32, i64, u32, u64, usize);

impl From<bool> for Key {
    fn from(b: bool) -> Self {
        Key::Bool(b)
    }
}

impl From<&str> for Key {
    fn from(s: &str) -> Self {
        Key::Str(s.into())
    }
}

impl From<String> for Key {
    fn from(s: String) -> Self {
        Key::Str(s.into())
    }
}

impl From<Rc<str>> for Key {
    fn from(s: Rc<str>) -> Self {
        Key::Str(s)
    }
}

impl From<Raw> for Key {
    fn from(raw: Raw) -> Self {
        Key::Object(raw)
    }
}

impl From<&Raw> for Key {
    fn from(raw: &Raw) -> Self {
        Key::Object(raw.clone())
    }
}

impl From<&Reactive> for Key {
    fn from(proxy: &Reactive) -> Self {
        Key::Object(proxy.raw())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn identity_semantics() {
        assert!(Value::from(f64::NAN).is_same(&Value::from(f64::NAN)));
        assert!(!Value::from(0.0).is_same(&Value::from(-0.0)));
        assert_eq!(Value::from("a"), Value::from(String::from("a")));

        let a = Raw::plain();
        let b = Raw::plain();
        assert_eq!(Value::from(a.clone()), Value::from(a.clone()));
        assert_ne!(Value::from(a), Value::from(b));
    }

    #[test]
    fn keys_use_same_value_zero() {
        assert_eq!(Key::from(0.0), Key::from(-0.0));
        assert_eq!(Key::from(f64::NAN), Key::from(f64::NAN));
        assert_eq!(Key::from(2usize), Key::from(2.0));
        assert_ne!(Key::from(2), Key::from("2"));

        let mut set = IndexSet::new();
        set.insert(Key::from(0.0));
        assert!(set.contains(&Key::from(-0.0)));
    }

    #[test]
    fn number_keys_name_plain_properties() {
        assert_eq!(&*Key::from(1).property_name(), "1");
        assert_eq!(&*Key::from(1.5).property_name(), "1.5");
        assert_eq!(Key::from(3).as_index(), Some(3));
        assert_eq!(Key::from(-1).as_index(), None);
        assert_eq!(Key::from(1.5).as_index(), None);
    }

    #[test]
    fn json_round_trip_preserves_shape() {
        let json = json!({"count": 1, "tags": ["a", "b"], "nested": {"ok": true}});
        let value = Value::from_json(json.clone());
        assert_eq!(value.to_json(), json);

        let raw = value.as_raw().unwrap();
        assert_eq!(raw.kind(), ContainerKind::Plain);
        assert_eq!(raw.peek("count"), Some(Value::from(1)));
        assert_eq!(raw.peek("tags").unwrap().as_raw().unwrap().len(), 2);
    }

    #[test]
    fn to_json_breaks_cycles() {
        let list = Raw::list(Vec::<Value>::new());
        if let RawData::List(items) = &mut *list.0.data.borrow_mut() {
            items.push(Value::Object(list.clone()));
        }
        assert_eq!(Value::from(list.clone()).to_json(), json!([null]));
        // Break the cycle so the test does not leak.
        if let RawData::List(items) = &mut *list.0.data.borrow_mut() {
            items.clear();
        };
    }

    #[test]
    fn skip_marker_sticks_to_the_container() {
        let raw = Raw::plain().mark_skip();
        assert!(raw.clone().is_skipped());
        assert!(!Raw::plain().is_skipped());
    }
}
