//! Transactional view over an ordered storage map
//!
//! `TransactionMap` binds one transaction to one storage map. Reads go
//! through the visibility oracle; writes take the row lock first and
//! mutate the cell in place, so a transaction's own uncommitted writes
//! live in the cells themselves rather than a side buffer.

use crate::storage::{allocate_cell_id, MemMap};
use crate::txn::cell::{TransactionalCell, TryLock};
use crate::txn::transaction::Transaction;
use crate::txn::visibility;
use crate::types::Value;
use crate::{DbError, Result};
use std::fmt::Debug;
use std::ops::RangeBounds;
use std::sync::Arc;

pub struct TransactionMap<K: Ord + Clone + Debug> {
    txn: Transaction,
    store: Arc<MemMap<K>>,
}

impl<K: Ord + Clone + Debug> Clone for TransactionMap<K> {
    fn clone(&self) -> Self {
        Self {
            txn: self.txn.clone(),
            store: self.store.clone(),
        }
    }
}

impl<K: Ord + Clone + Debug> TransactionMap<K> {
    pub(crate) fn new(txn: Transaction, store: Arc<MemMap<K>>) -> Self {
        Self { txn, store }
    }

    pub fn name(&self) -> &str {
        self.store.name()
    }

    pub(crate) fn txn(&self) -> &Transaction {
        &self.txn
    }

    /// Visibility-filtered point read. `None` means no version of the
    /// row is visible to this transaction.
    pub fn get(&self, key: &K) -> Option<Value> {
        let cell = self.store.get(key)?;
        visibility::visible(&cell, self.txn.core(), self.txn.engine().old_values()).into_option()
    }

    /// Write a value, locking the row first. Fails with
    /// `ConcurrentUpdate` when another transaction holds the lock; the
    /// yieldable executor turns that conflict into a parked statement
    /// instead of calling this directly.
    pub fn put(&self, key: K, value: Value) -> Result<()> {
        let cell = self.lock_or_conflict(&key)?;
        cell.set_value(Some(value));
        Ok(())
    }

    /// Tombstone a row. A key with no cell is already absent; nothing to
    /// lock in that case.
    pub fn remove(&self, key: &K) -> Result<()> {
        if self.store.get(key).is_none() {
            return Ok(());
        }
        let cell = self.lock_or_conflict(key)?;
        cell.set_value(None);
        Ok(())
    }

    /// Remove the last key in the map. Returns the key it tombstoned.
    pub fn remove_last(&self) -> Result<Option<K>> {
        match self.store.last_key() {
            Some(key) => {
                self.remove(&key)?;
                Ok(Some(key))
            }
            None => Ok(None),
        }
    }

    fn lock_or_conflict(&self, key: &K) -> Result<Arc<TransactionalCell>> {
        let cell = self.store.get_or_insert_with(key.clone(), || {
            Arc::new(TransactionalCell::committed(allocate_cell_id(), None))
        });
        match self.txn.try_lock(&cell) {
            TryLock::Conflict(holder) => Err(DbError::ConcurrentUpdate(format!(
                "{key:?} held by transaction {}",
                holder.transaction_id()
            ))),
            _ => Ok(cell),
        }
    }

    /// Raw cells in range, for the executor's row-at-a-time drivers.
    pub(crate) fn cells<R: RangeBounds<K>>(&self, range: R) -> Vec<(K, Arc<TransactionalCell>)> {
        self.store.range(range)
    }

    /// Visibility-filtered cursor over a key range.
    pub fn cursor<R: RangeBounds<K>>(&self, range: R) -> TransactionMapCursor<K> {
        TransactionMapCursor {
            txn: self.txn.clone(),
            entries: self.store.range(range),
            pos: 0,
        }
    }

    /// Number of rows visible to this transaction.
    pub fn count(&self) -> usize {
        self.cursor(..).count()
    }
}

/// Iterates (key, value) pairs the transaction is allowed to see, in key
/// order. Rows with no visible version are skipped.
pub struct TransactionMapCursor<K: Ord + Clone + Debug> {
    txn: Transaction,
    entries: Vec<(K, Arc<TransactionalCell>)>,
    pos: usize,
}

impl<K: Ord + Clone + Debug> Iterator for TransactionMapCursor<K> {
    type Item = (K, Value);

    fn next(&mut self) -> Option<(K, Value)> {
        while self.pos < self.entries.len() {
            let (key, cell) = &self.entries[self.pos];
            self.pos += 1;
            let sight =
                visibility::visible(cell, self.txn.core(), self.txn.engine().old_values());
            if let Some(value) = sight.into_option() {
                return Some((key.clone(), value));
            }
        }
        None
    }
}
