//! Storage collaborator surface
//!
//! The transaction core treats storage as an ordered key -> versioned-cell
//! map with page-level latches. `MemMap` is the in-memory stand-in used by
//! the core and its tests; a production engine binds the same contract to
//! its B-tree. The core never relies on more than: ordered iteration,
//! get/insert/remove by key, and stable `Arc` identity of cells.

pub mod format;

use crate::txn::cell::TransactionalCell;
use crate::types::CellId;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::ops::{Bound, RangeBounds};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Global cell-id allocator. Cell ids key the old-version index, so they
/// must be unique across every map in the process.
static NEXT_CELL_ID: AtomicU64 = AtomicU64::new(1);

pub fn allocate_cell_id() -> CellId {
    NEXT_CELL_ID.fetch_add(1, Ordering::Relaxed)
}

/// Ordered key -> cell map.
///
/// One map-level latch stands in for the B-tree's page latches; cells are
/// shared via `Arc`, so a reader holds the latch only long enough to clone
/// the reference. All MVCC state lives inside the cell itself.
pub struct MemMap<K: Ord + Clone> {
    name: String,
    tree: RwLock<BTreeMap<K, Arc<TransactionalCell>>>,
}

impl<K: Ord + Clone> MemMap<K> {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            tree: RwLock::new(BTreeMap::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn get(&self, key: &K) -> Option<Arc<TransactionalCell>> {
        self.tree.read().get(key).cloned()
    }

    /// Get the cell for `key`, inserting the one built by `make` if absent.
    ///
    /// Two writers racing to insert the same key converge on a single cell;
    /// the loser's candidate is dropped and both contend on the winner's
    /// lock slot.
    pub fn get_or_insert_with(
        &self,
        key: K,
        make: impl FnOnce() -> Arc<TransactionalCell>,
    ) -> Arc<TransactionalCell> {
        let mut tree = self.tree.write();
        tree.entry(key).or_insert_with(make).clone()
    }

    /// Physically unlink a key. Only storage compaction calls this; the
    /// transaction core leaves committed tombstones in place so snapshot
    /// readers can still reach their old-version chains.
    pub fn remove(&self, key: &K) -> Option<Arc<TransactionalCell>> {
        self.tree.write().remove(key)
    }

    /// Snapshot the cells in `range` in key order.
    ///
    /// The latch is held only while cloning the references; visibility
    /// filtering happens afterwards against each cell's own snapshot.
    pub fn range<R: RangeBounds<K>>(&self, range: R) -> Vec<(K, Arc<TransactionalCell>)> {
        self.tree
            .read()
            .range((
                cloned_bound(range.start_bound()),
                cloned_bound(range.end_bound()),
            ))
            .map(|(k, c)| (k.clone(), c.clone()))
            .collect()
    }

    /// Last key in the map, if any. Backs "remove the newest row" paths.
    pub fn last_key(&self) -> Option<K> {
        self.tree.read().keys().next_back().cloned()
    }

    pub fn len(&self) -> usize {
        self.tree.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.read().is_empty()
    }
}

fn cloned_bound<K: Clone>(b: Bound<&K>) -> Bound<K> {
    match b {
        Bound::Included(k) => Bound::Included(k.clone()),
        Bound::Excluded(k) => Bound::Excluded(k.clone()),
        Bound::Unbounded => Bound::Unbounded,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Value;

    fn cell(v: &str) -> Arc<TransactionalCell> {
        Arc::new(TransactionalCell::committed(
            allocate_cell_id(),
            Some(Value::from(v)),
        ))
    }

    #[test]
    fn test_get_or_insert_converges() {
        let map: Arc<MemMap<String>> = MemMap::new("t");
        let a = map.get_or_insert_with("k".into(), || cell("a"));
        let b = map.get_or_insert_with("k".into(), || cell("b"));
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_range_is_ordered() {
        let map: Arc<MemMap<String>> = MemMap::new("t");
        for k in ["3", "1", "2"] {
            map.get_or_insert_with(k.into(), || cell(k));
        }
        let keys: Vec<String> = map.range(..).into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["1", "2", "3"]);

        let bounded: Vec<String> = map
            .range("2".to_string()..)
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(bounded, vec!["2", "3"]);
    }

    #[test]
    fn test_last_key() {
        let map: Arc<MemMap<String>> = MemMap::new("t");
        assert_eq!(map.last_key(), None);
        map.get_or_insert_with("2".into(), || cell("b"));
        map.get_or_insert_with("3".into(), || cell("c"));
        assert_eq!(map.last_key(), Some("3".to_string()));
    }
}
