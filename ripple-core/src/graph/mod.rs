//! Dependency Graph Storage
//!
//! This module holds the arena storage behind the dependency graph and the
//! batch scheduler that drains dirty nodes.
//!
//! # Overview
//!
//! Contexts (computations) and observers (per-container bookkeeping) live in
//! two arenas and refer to each other by integer handle, never by strong
//! reference:
//!
//! - an observer maps each property key to the contexts that read it, stamped
//!   with the reader's track id
//! - a context keeps the reverse index: the observers (and keys) it read
//!   during its last run
//!
//! # Design Decisions
//!
//! 1. Handles are generational. Freeing a slot bumps nothing in place; the
//!    next occupant simply gets a fresh generation, so a handle that outlives
//!    its node resolves to `None` instead of aliasing the new occupant.
//!
//! 2. Stopping a context is an O(1) arena free plus removal of its edges.
//!
//! 3. There are no bidirectional strong references, so dropping user handles
//!    can never leak a cycle through the graph.

mod node;
mod scheduler;

pub use node::{ContextKind, DirtyLevel};
pub(crate) use node::ContextNode;
pub(crate) use scheduler::{BatchQueue, Job, Pending};

use slab::Slab;

macro_rules! arena_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name {
            slot: u32,
            generation: u32,
        }

        impl $name {
            /// Arena slot of this handle.
            pub fn slot(&self) -> u32 {
                self.slot
            }

            /// Generation of the slot occupant this handle refers to.
            pub fn generation(&self) -> u32 {
                self.generation
            }
        }

        impl From<(u32, u32)> for $name {
            fn from((slot, generation): (u32, u32)) -> Self {
                Self { slot, generation }
            }
        }

        impl From<$name> for (u32, u32) {
            fn from(id: $name) -> Self {
                (id.slot, id.generation)
            }
        }
    };
}

arena_id!(
    /// Handle to a reactive context (computed, watcher or render binding).
    ContextId
);

arena_id!(
    /// Handle to an observer (the bookkeeping of one reactive container or cell).
    ObserverId
);

struct Entry<T> {
    generation: u32,
    value: T,
}

/// Generational arena over [`slab::Slab`].
pub(crate) struct Arena<T> {
    slots: Slab<Entry<T>>,
    next_generation: u32,
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self {
            slots: Slab::new(),
            next_generation: 0,
        }
    }
}

impl<T> Arena<T> {
    pub fn insert<I: From<(u32, u32)>>(&mut self, value: T) -> I {
        let generation = self.next_generation;
        self.next_generation = self.next_generation.wrapping_add(1);
        let slot = self.slots.insert(Entry { generation, value });
        I::from((slot as u32, generation))
    }

    pub fn get<I: Into<(u32, u32)>>(&self, id: I) -> Option<&T> {
        let (slot, generation) = id.into();
        self.slots
            .get(slot as usize)
            .filter(|entry| entry.generation == generation)
            .map(|entry| &entry.value)
    }

    pub fn get_mut<I: Into<(u32, u32)>>(&mut self, id: I) -> Option<&mut T> {
        let (slot, generation) = id.into();
        self.slots
            .get_mut(slot as usize)
            .filter(|entry| entry.generation == generation)
            .map(|entry| &mut entry.value)
    }

    pub fn remove<I: Into<(u32, u32)>>(&mut self, id: I) -> Option<T> {
        let (slot, generation) = id.into();
        match self.slots.get(slot as usize) {
            Some(entry) if entry.generation == generation => {
                Some(self.slots.remove(slot as usize).value)
            }
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_handles_do_not_alias_new_occupants() {
        let mut arena: Arena<&str> = Arena::default();
        let first: ContextId = arena.insert("first");
        assert_eq!(arena.remove(first), Some("first"));

        let second: ContextId = arena.insert("second");
        assert_eq!(first.slot(), second.slot());
        assert_ne!(first, second);
        assert!(arena.get(first).is_none());
        assert_eq!(arena.get(second), Some(&"second"));
    }

    #[test]
    fn remove_is_idempotent() {
        let mut arena: Arena<u8> = Arena::default();
        let id: ObserverId = arena.insert(7);
        assert!(arena.get(id).is_some());
        assert_eq!(arena.remove(id), Some(7));
        assert_eq!(arena.remove(id), None);
        assert_eq!(arena.len(), 0);
    }
}
