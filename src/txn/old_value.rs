//! Old-version index
//!
//! Keeps, per cell, a chain of past committed values ordered by descending
//! commit timestamp. Chains exist only while at least one live
//! repeatable-read (or serializable) transaction might still need a prior
//! version; the engine prunes them against the oldest such reader and
//! drops them wholesale when no snapshot reader is alive.

use crate::txn::cell::TransactionalCell;
use crate::types::{CellId, Timestamp, Value};
use ahash::RandomState;
use dashmap::DashMap;
use parking_lot::RwLock;

/// One prior committed version.
///
/// `use_last` is set on a head whose successor writes were elided because
/// the chain already covered every live reader; it records the commit
/// timestamp of the newest elided write so the version can be revived with
/// its real timestamp when the chain grows again.
struct OldValueNode {
    tid: Timestamp,
    value: Option<Value>,
    use_last: Option<Timestamp>,
    next: Option<Box<OldValueNode>>,
}

/// Chain of old versions for a single cell, newest first.
struct OldValueChain {
    head: RwLock<Option<Box<OldValueNode>>>,
}

impl OldValueChain {
    fn new() -> Self {
        Self {
            head: RwLock::new(None),
        }
    }
}

/// Result of resolving a reader against one chain
pub enum ChainWalk {
    /// First node at or below the reader's snapshot.
    Found(Option<Value>),
    /// The chain exists but every retained node is newer than the reader.
    Exhausted,
    /// No chain for this cell.
    NoChain,
}

/// Old-version chains for all cells, keyed by cell identity.
pub struct OldValueIndex {
    chains: DashMap<CellId, OldValueChain, RandomState>,
}

impl OldValueIndex {
    pub fn new() -> Self {
        Self {
            chains: DashMap::with_hasher(RandomState::new()),
        }
    }

    /// Record the version a committing transaction publishes for `cell`.
    ///
    /// Called only while at least one snapshot reader is live. `floor` is
    /// the oldest live repeatable-read transaction id; a chain head newer
    /// than the floor already covers every live reader, in which case the
    /// write is elided and the head marked `use_last`.
    pub fn publish(&self, cell: &TransactionalCell, commit_ts: Timestamp, floor: Timestamp) {
        let held = match cell.lock_snapshot() {
            Some(held) => held,
            // Commit iterates held locks, so the slot is populated; a bare
            // cell here is an engine bug, not a user error.
            None => {
                log::error!("publish on unlocked cell {}", cell.id());
                return;
            }
        };
        let new_value = cell.current();

        let entry = self
            .chains
            .entry(cell.id())
            .or_insert_with(OldValueChain::new);
        let mut head = entry.head.write();

        if held.is_insert() {
            // Pure insert: no pre-image to retain, just tag the new value.
            let next = head.take();
            *head = Some(Box::new(OldValueNode {
                tid: commit_ts,
                value: new_value,
                use_last: None,
                next,
            }));
            return;
        }

        match head.take() {
            Some(mut h) if h.tid > floor => {
                // Every live reader resolves inside the existing chain;
                // skip the extension and remember the elided timestamp.
                h.use_last = Some(commit_ts);
                *head = Some(h);
            }
            prev => {
                let pre_image = held.pre_image().cloned();
                let next = match prev {
                    // First overwrite under a live reader: synthesize a
                    // tail holding the pre-image, visible to any reader.
                    None => Some(Box::new(OldValueNode {
                        tid: 0,
                        value: pre_image,
                        use_last: None,
                        next: None,
                    })),
                    Some(h) => match h.use_last {
                        // Revive the newest elided version under its real
                        // timestamp before stacking the new one on top.
                        Some(elided_ts) => Some(Box::new(OldValueNode {
                            tid: elided_ts,
                            value: pre_image,
                            use_last: None,
                            next: Some(h),
                        })),
                        None => Some(h),
                    },
                };
                *head = Some(Box::new(OldValueNode {
                    tid: commit_ts,
                    value: new_value,
                    use_last: None,
                    next,
                }));
            }
        }
    }

    /// Resolve the version a reader with snapshot `rtid` must see.
    pub fn walk(&self, cell_id: CellId, rtid: Timestamp) -> ChainWalk {
        let entry = match self.chains.get(&cell_id) {
            Some(entry) => entry,
            None => return ChainWalk::NoChain,
        };
        let head = entry.head.read();
        let mut node = head.as_deref();
        if node.is_none() {
            return ChainWalk::NoChain;
        }
        while let Some(n) = node {
            if n.tid <= rtid {
                return ChainWalk::Found(n.value.clone());
            }
            node = n.next.as_deref();
        }
        ChainWalk::Exhausted
    }

    /// Prune one chain against the oldest live snapshot reader.
    ///
    /// Keeps the first node at or below the floor (the version that reader
    /// resolves to) and drops everything older. A floor of `u64::MAX`
    /// (no live reader) removes the chain outright.
    pub fn prune(&self, cell_id: CellId, floor: Timestamp) -> usize {
        if floor == u64::MAX {
            return match self.chains.remove(&cell_id) {
                Some((_, chain)) => count_nodes(&chain.head.read()),
                None => 0,
            };
        }
        let mut removed = 0;
        if let Some(entry) = self.chains.get(&cell_id) {
            let mut head = entry.head.write();
            let mut node = head.as_deref_mut();
            while let Some(n) = node {
                if n.tid <= floor {
                    removed += count_nodes(&n.next.take());
                    break;
                }
                node = n.next.as_deref_mut();
            }
        }
        removed
    }

    /// Prune every chain. Runs from the engine's periodic sweep and after
    /// commits that find no live snapshot reader.
    pub fn sweep(&self, floor: Timestamp) -> usize {
        let ids: Vec<CellId> = self.chains.iter().map(|e| *e.key()).collect();
        let mut removed = 0;
        for id in ids {
            removed += self.prune(id, floor);
        }
        removed
    }

    pub fn stats(&self) -> OldValueIndexStats {
        let mut total_nodes = 0u64;
        let mut max_chain_length = 0u64;
        for entry in self.chains.iter() {
            let len = count_nodes(&entry.head.read()) as u64;
            total_nodes += len;
            max_chain_length = max_chain_length.max(len);
        }
        OldValueIndexStats {
            total_chains: self.chains.len() as u64,
            total_nodes,
            max_chain_length,
        }
    }
}

impl Default for OldValueIndex {
    fn default() -> Self {
        Self::new()
    }
}

fn count_nodes(head: &Option<Box<OldValueNode>>) -> usize {
    let mut n = 0;
    let mut node = head.as_deref();
    while let Some(cur) = node {
        n += 1;
        node = cur.next.as_deref();
    }
    n
}

/// Old-version index statistics
#[derive(Debug, Clone)]
pub struct OldValueIndexStats {
    pub total_chains: u64,
    pub total_nodes: u64,
    pub max_chain_length: u64,
}
