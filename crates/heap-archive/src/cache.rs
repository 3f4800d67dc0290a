//! Original object → archived copy.
//!
//! Keyed by object identity. An original has at most one archived copy per
//! dump session, which is what preserves sharing between subgraphs and lets
//! cyclic walks terminate.

use std::collections::HashMap;

use crate::model::ObjectId;
use crate::region::RegionKind;

/// Dump-time address of an archived copy, plus the region it lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ArchivedAddr {
    /// Absolute dump-time address.
    pub addr: u64,
    /// Region holding the copy.
    pub kind: RegionKind,
}

/// Identity map from live objects to their archived copies.
#[derive(Debug, Default)]
pub struct ObjectCache {
    map: HashMap<ObjectId, ArchivedAddr>,
}

impl ObjectCache {
    /// Creates an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The archived copy of `original`, if one exists.
    #[inline]
    #[must_use]
    pub fn lookup(&self, original: ObjectId) -> Option<ArchivedAddr> {
        self.map.get(&original).copied()
    }

    /// Records the archived copy of `original`.
    ///
    /// `original` must not already have a copy; the recorder only inserts
    /// after a failed lookup.
    pub fn insert(&mut self, original: ObjectId, archived: ArchivedAddr) {
        let prev = self.map.insert(original, archived);
        debug_assert!(prev.is_none(), "{original:?} archived twice");
    }

    /// Forgets the copy of `original` when its walk is rolled back.
    pub(crate) fn remove(&mut self, original: ObjectId) {
        self.map.remove(&original);
    }

    /// Number of archived objects.
    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Returns `true` if nothing has been archived.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const COPY: ArchivedAddr = ArchivedAddr {
        addr: 0x1000,
        kind: RegionKind::Open,
    };

    #[test]
    fn test_lookup_after_insert() {
        let mut cache = ObjectCache::new();
        assert!(cache.is_empty());
        assert_eq!(cache.lookup(ObjectId(1)), None);

        cache.insert(ObjectId(1), COPY);
        assert_eq!(cache.lookup(ObjectId(1)), Some(COPY));
        assert_eq!(cache.lookup(ObjectId(2)), None);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "archived twice")]
    fn test_double_insert_asserts() {
        let mut cache = ObjectCache::new();
        cache.insert(ObjectId(1), COPY);
        cache.insert(ObjectId(1), COPY);
    }
}
