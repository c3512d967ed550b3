//! `ScopedHashMap`
//!
//! This module defines a struct `ScopedHashMap<K, V>` which defines an
//! `FxHashMap`-like container that has a concept of scopes that can be
//! entered and exited, such that values inserted while inside a scope
//! aren't visible outside the scope. Value numbering uses one scope per
//! dominator-tree level.
//!
//! Shadowing, where one scope has entries with the same keys as a
//! containing scope, is not supported.

use crate::fx::FxHashMap;
use core::hash::Hash;

/// A wrapper around an `FxHashMap` which adds the concept of scopes.
pub struct ScopedHashMap<K, V> {
    map: FxHashMap<K, V>,
    inserted: Vec<K>,
    scope_marks: Vec<usize>,
}

impl<K, V> ScopedHashMap<K, V>
where
    K: PartialEq + Eq + Hash + Clone,
{
    /// Creates an empty `ScopedHashMap`.
    pub fn new() -> Self {
        Self {
            map: FxHashMap::default(),
            inserted: Vec::new(),
            scope_marks: Vec::new(),
        }
    }

    /// Get the value for `key`, if a surrounding scope inserted one.
    pub fn get(&self, key: &K) -> Option<&V> {
        self.map.get(key)
    }

    /// Insert a value for the current scope.
    pub fn insert(&mut self, key: K, value: V) {
        let prev = self.map.insert(key.clone(), value);
        debug_assert!(prev.is_none(), "shadowing is not supported");
        self.inserted.push(key);
    }

    /// Enter a new scope.
    pub fn increment_depth(&mut self) {
        self.scope_marks.push(self.inserted.len());
    }

    /// Exit the current scope, removing all elements inserted in it.
    pub fn decrement_depth(&mut self) {
        let mark = self.scope_marks.pop().expect("unbalanced scopes");
        while self.inserted.len() > mark {
            let key = self.inserted.pop().unwrap();
            self.map.remove(&key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scopes() {
        let mut map: ScopedHashMap<i32, i32> = ScopedHashMap::new();
        map.increment_depth();
        map.insert(1, 10);
        assert_eq!(map.get(&1), Some(&10));

        map.increment_depth();
        map.insert(2, 20);
        assert_eq!(map.get(&1), Some(&10));
        assert_eq!(map.get(&2), Some(&20));

        map.decrement_depth();
        assert_eq!(map.get(&1), Some(&10));
        assert_eq!(map.get(&2), None);

        map.decrement_depth();
        assert_eq!(map.get(&1), None);
    }
}
