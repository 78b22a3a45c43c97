//! Index-based storage for the check graph.
//!
//! Every node of the graph (services, servers, checkers, links and tracked
//! files) lives in an [Arena], and nodes refer to each other by [Handle].
//! Identifiers are never reused within an arena, so a handle to a removed
//! node stays dead rather than aliasing a newer one.

use derive_where::derive_where;
use std::collections::BTreeMap;
use std::marker::PhantomData;

/// A typed reference to a value stored in an [Arena].
#[derive_where(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Handle<T> {
    id: u64,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Handle<T> {
    fn new(id: u64) -> Self {
        Self {
            id,
            _marker: PhantomData,
        }
    }

    pub fn as_u64(&self) -> u64 {
        self.id
    }
}

impl<T> std::fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.id)
    }
}

/// Owns values of a single type, handing out a [Handle] for each.
///
/// Iteration visits values in insertion order.
#[derive(Debug)]
pub struct Arena<T> {
    values: BTreeMap<u64, T>,
    next_id: u64,
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self {
            values: BTreeMap::new(),
            next_id: 0,
        }
    }
}

impl<T> Arena<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, value: T) -> Handle<T> {
        let id = self.next_id;
        self.next_id += 1;
        self.values.insert(id, value);
        Handle::new(id)
    }

    pub fn remove(&mut self, handle: Handle<T>) -> Option<T> {
        self.values.remove(&handle.id)
    }

    pub fn contains(&self, handle: Handle<T>) -> bool {
        self.values.contains_key(&handle.id)
    }

    pub fn get(&self, handle: Handle<T>) -> Option<&T> {
        self.values.get(&handle.id)
    }

    pub fn get_mut(&mut self, handle: Handle<T>) -> Option<&mut T> {
        self.values.get_mut(&handle.id)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Handle<T>, &T)> {
        self.values.iter().map(|(id, value)| (Handle::new(*id), value))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (Handle<T>, &mut T)> {
        self.values
            .iter_mut()
            .map(|(id, value)| (Handle::new(*id), value))
    }
}

// Indexing with a dead handle is a broken graph invariant, not an input
// error: callers which can see stale handles use `get` instead.
impl<T> std::ops::Index<Handle<T>> for Arena<T> {
    type Output = T;

    fn index(&self, handle: Handle<T>) -> &T {
        match self.values.get(&handle.id) {
            Some(value) => value,
            None => panic!("dangling handle {handle:?}"),
        }
    }
}

impl<T> std::ops::IndexMut<Handle<T>> for Arena<T> {
    fn index_mut(&mut self, handle: Handle<T>) -> &mut T {
        match self.values.get_mut(&handle.id) {
            Some(value) => value,
            None => panic!("dangling handle {handle:?}"),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn handles_are_not_reused() {
        let mut arena = Arena::new();
        let a = arena.insert("a");
        let b = arena.insert("b");
        assert_eq!(arena.remove(a), Some("a"));

        let c = arena.insert("c");
        assert_ne!(a, c);
        assert!(!arena.contains(a));
        assert!(arena.get(a).is_none());
        assert_eq!(arena[b], "b");
        assert_eq!(arena[c], "c");
        assert_eq!(arena.len(), 2);
    }

    #[test]
    fn iteration_follows_insertion_order() {
        let mut arena = Arena::new();
        let handles: Vec<_> = ["x", "y", "z"].into_iter().map(|v| arena.insert(v)).collect();
        arena.remove(handles[1]);

        let seen: Vec<_> = arena.iter().map(|(h, v)| (h, *v)).collect();
        assert_eq!(seen, vec![(handles[0], "x"), (handles[2], "z")]);
    }

    #[test]
    #[should_panic(expected = "dangling handle")]
    fn indexing_a_removed_handle_panics() {
        let mut arena = Arena::new();
        let a = arena.insert(1);
        arena.remove(a);
        let _ = arena[a];
    }
}
