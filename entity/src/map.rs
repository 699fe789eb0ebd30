//! Densely numbered entity references as mapping keys.

use crate::EntityRef;
use std::marker::PhantomData;
use std::ops::{Index, IndexMut};

/// A mapping `K -> V` for densely indexed entity references, which doubles as
/// the owner of the arena: `push` both allocates a fresh `K` and inserts its
/// value, so a `PrimaryMap` is the only thing in this crate's consumers that
/// ever *owns* a node — reference chains elsewhere hold plain `K`s, never a
/// second copy of the data.
#[derive(Debug, Clone)]
pub struct PrimaryMap<K, V>
where
    K: EntityRef,
{
    elems: Vec<V>,
    unused: PhantomData<K>,
}

impl<K, V> PrimaryMap<K, V>
where
    K: EntityRef,
{
    /// Create a new empty map.
    pub fn new() -> Self {
        Self {
            elems: Vec::new(),
            unused: PhantomData,
        }
    }

    /// Create a new empty map with the given capacity pre-reserved.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            elems: Vec::with_capacity(capacity),
            unused: PhantomData,
        }
    }

    /// Number of entries currently stored.
    pub fn len(&self) -> usize {
        self.elems.len()
    }

    /// Is this map empty?
    pub fn is_empty(&self) -> bool {
        self.elems.is_empty()
    }

    /// Get the element at `k`, if it exists.
    pub fn get(&self, k: K) -> Option<&V> {
        self.elems.get(k.index())
    }

    /// Get a mutable reference to the element at `k`, if it exists.
    pub fn get_mut(&mut self, k: K) -> Option<&mut V> {
        self.elems.get_mut(k.index())
    }

    /// Append `v` to the map, allocating and returning a fresh key for it.
    pub fn push(&mut self, v: V) -> K {
        let k = K::new(self.elems.len());
        self.elems.push(v);
        k
    }

    /// Iterate over all the keys and values in this map.
    pub fn iter(&self) -> impl Iterator<Item = (K, &V)> {
        self.elems
            .iter()
            .enumerate()
            .map(|(i, v)| (K::new(i), v))
    }

    /// Iterate over all values in this map.
    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.elems.iter()
    }

    /// Iterate over all values in this map, mutably.
    pub fn values_mut(&mut self) -> impl Iterator<Item = &mut V> {
        self.elems.iter_mut()
    }

    /// The key that the next `push` would return.
    pub fn next_key(&self) -> K {
        K::new(self.elems.len())
    }
}

impl<K, V> Default for PrimaryMap<K, V>
where
    K: EntityRef,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> Index<K> for PrimaryMap<K, V>
where
    K: EntityRef,
{
    type Output = V;

    fn index(&self, k: K) -> &V {
        &self.elems[k.index()]
    }
}

impl<K, V> IndexMut<K> for PrimaryMap<K, V>
where
    K: EntityRef,
{
    fn index_mut(&mut self, k: K) -> &mut V {
        &mut self.elems[k.index()]
    }
}

/// A mapping `K -> V` that, unlike `PrimaryMap`, behaves as if every key has
/// a default entry from the beginning — used for the per-storage reference-
/// index heads (one slot per local/global/register/temp-stack-offset, all
/// initially "no referrer").
#[derive(Debug, Clone)]
pub struct SecondaryMap<K, V>
where
    K: EntityRef,
    V: Clone,
{
    elems: Vec<V>,
    default: V,
    unused: PhantomData<K>,
}

impl<K, V> SecondaryMap<K, V>
where
    K: EntityRef,
    V: Clone,
{
    /// Create a new empty map using `V::default()` as the default value.
    pub fn new() -> Self
    where
        V: Default,
    {
        Self {
            elems: Vec::new(),
            default: Default::default(),
            unused: PhantomData,
        }
    }

    /// Create a new empty map with an explicit default value.
    pub fn with_default(default: V) -> Self {
        Self {
            elems: Vec::new(),
            default,
            unused: PhantomData,
        }
    }

    /// Get the value at `k`, extending the backing vector with the default
    /// value as needed. This never fails: absence and "default value" are
    /// the same observable state.
    pub fn get(&self, k: K) -> V {
        self.elems.get(k.index()).cloned().unwrap_or_else(|| self.default.clone())
    }

    /// Get a mutable reference to the slot at `k`, growing the backing
    /// vector with clones of the default value as needed.
    pub fn get_mut(&mut self, k: K) -> &mut V {
        let idx = k.index();
        if idx >= self.elems.len() {
            self.elems.resize(idx + 1, self.default.clone());
        }
        &mut self.elems[idx]
    }

    /// Set the value at `k`.
    pub fn set(&mut self, k: K, v: V) {
        *self.get_mut(k) = v;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity_impl;

    #[derive(Copy, Clone, PartialEq, Eq)]
    struct K(u32);
    entity_impl!(K);

    #[test]
    fn primary_map_push_and_index() {
        let mut m: PrimaryMap<K, &str> = PrimaryMap::new();
        let a = m.push("a");
        let b = m.push("b");
        assert_eq!(m[a], "a");
        assert_eq!(m[b], "b");
        assert_eq!(m.len(), 2);
    }

    #[test]
    fn secondary_map_defaults_until_set() {
        let mut m: SecondaryMap<K, Option<u32>> = SecondaryMap::new();
        let k = K::new(5);
        assert_eq!(m.get(k), None);
        m.set(k, Some(7));
        assert_eq!(m.get(k), Some(7));
        assert_eq!(m.get(K::new(0)), None);
    }
}
