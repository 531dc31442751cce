//! An ordered map keyed by variable-length bytes, used to index names.
//!
//! Stands in for an intrusive red-black tree where index nodes would live
//! inside the objects they index, giving O(log n) insert/prune with no
//! extra allocation and a statically-sized index. Rust has no portable way
//! to embed a tree node inside an arbitrary owning struct without unsafe
//! intrusive-list tricks, so this uses the usual substitute instead: a
//! preallocated arena of nodes, indexed by integer handle.
//!
//! That's exactly what this is: entries live in a slab
//! ([`crate::fd_registry`] / [`crate::service`] own their own slabs), and
//! this map only ever stores `(key, handle)` pairs, where `handle` is a
//! plain integer into that slab. `BTreeMap` already provides O(log n)
//! insert/lookup and in-order traversal, so it stands in for the red-black
//! tree without reimplementing one.
use std::collections::BTreeMap;
use std::collections::btree_map::Range;

/// An ordered map from byte-string keys to integer handles.
#[derive(Debug, Default)]
pub struct OrderedMap<H> {
    tree: BTreeMap<Vec<u8>, H>,
}

impl<H: Copy> OrderedMap<H> {
    pub fn new() -> Self {
        OrderedMap { tree: BTreeMap::new() }
    }

    pub fn len(&self) -> usize {
        self.tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    /// Insert `key -> handle`. Fails (returning `false`, leaving the map
    /// untouched) if `key` is already present — duplicate keys are rejected
    /// by the map; callers decide whether that should mean "overwrite" or
    /// "error".
    #[must_use]
    pub fn insert(&mut self, key: Vec<u8>, handle: H) -> bool {
        if self.tree.contains_key(&key) {
            return false;
        }
        self.tree.insert(key, handle);
        true
    }

    pub fn find(&self, key: &[u8]) -> Option<H> {
        self.tree.get(key).copied()
    }

    pub fn remove(&mut self, key: &[u8]) -> Option<H> {
        self.tree.remove(key)
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        self.tree.contains_key(key)
    }

    pub fn first(&self) -> Option<(&[u8], H)> {
        self.tree.iter().next().map(|(k, v)| (k.as_slice(), *v))
    }

    pub fn last(&self) -> Option<(&[u8], H)> {
        self.tree.iter().next_back().map(|(k, v)| (k.as_slice(), *v))
    }

    /// Iterate entries in key order, starting at the smallest key ≥
    /// `from`. Matches `fd_iter_next`/`svc_iter_next`'s "next-greater-or-
    /// equal" semantics.
    pub fn iter_from<'a>(&'a self, from: &[u8]) -> RangeIter<'a, H> {
        RangeIter {
            inner: self.tree.range(from.to_vec()..),
        }
    }
}

pub struct RangeIter<'a, H> {
    inner: Range<'a, Vec<u8>, H>,
}

impl<'a, H: Copy> Iterator for RangeIter<'a, H> {
    type Item = (&'a [u8], H);

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next().map(|(k, v)| (k.as_slice(), *v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_duplicate_keys() {
        let mut m: OrderedMap<usize> = OrderedMap::new();
        assert!(m.insert(b"a".to_vec(), 0));
        assert!(!m.insert(b"a".to_vec(), 1));
        assert_eq!(m.find(b"a"), Some(0));
    }

    #[test]
    fn iterates_in_key_order_from_floor() {
        let mut m: OrderedMap<usize> = OrderedMap::new();
        for (i, k) in [b"b".as_slice(), b"d", b"a", b"c"].into_iter().enumerate() {
            assert!(m.insert(k.to_vec(), i));
        }
        let names: Vec<&[u8]> = m.iter_from(b"b").map(|(k, _)| k).collect();
        assert_eq!(names, vec![b"b".as_slice(), b"c", b"d"]);
    }

    #[test]
    fn remove_unlinks_entry() {
        let mut m: OrderedMap<usize> = OrderedMap::new();
        m.insert(b"x".to_vec(), 7);
        assert_eq!(m.remove(b"x"), Some(7));
        assert_eq!(m.find(b"x"), None);
    }
}
