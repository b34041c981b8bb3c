//! Transaction descriptor
//!
//! Provides the per-transaction identity and lifecycle: begin, lock
//! tracking, savepoints, commit (sync and async) and rollback.
//!
//! State is split in two. `TransactionCore` carries what concurrent
//! readers must see through a cell's lock slot (id, isolation, status,
//! commit timestamp) and is shared via `Arc` from every `RowLock`.
//! `Transaction` is the executor-facing handle; it owns the held-lock
//! list and savepoint bookkeeping and is mutated only by the session
//! thread driving the transaction. A cell's lock owning the core while
//! the descriptor keeps plain cell references is what keeps the
//! cell/transaction reference graph acyclic.

use crate::storage::MemMap;
use crate::txn::cell::{TransactionalCell, TryLock};
use crate::txn::engine::{PendingCommit, TransactionEngine};
use crate::txn::map::TransactionMap;
use crate::types::{Timestamp, TransactionId};
use crate::{DbError, Result};
use crossbeam::channel;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

/// Transaction isolation level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    /// Read whatever is in the cell, locked or not.
    ReadUncommitted = 0,
    /// Read only committed data.
    ReadCommitted = 1,
    /// Repeatable reads within the transaction (snapshot at begin).
    RepeatableRead = 2,
    /// Full serializable isolation.
    Serializable = 3,
}

impl IsolationLevel {
    /// True for the levels that pin a begin-time snapshot and therefore
    /// participate in old-version retention.
    pub fn is_repeatable_read(self) -> bool {
        matches!(self, IsolationLevel::RepeatableRead | IsolationLevel::Serializable)
    }
}

/// Transaction status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TxStatus {
    Active = 0,
    Committing = 1,
    Committed = 2,
    RolledBack = 3,
}

impl TxStatus {
    fn from_u8(v: u8) -> TxStatus {
        match v {
            0 => TxStatus::Active,
            1 => TxStatus::Committing,
            2 => TxStatus::Committed,
            _ => TxStatus::RolledBack,
        }
    }
}

/// Shared transaction state, referenced from every lock the transaction
/// holds. Lives until the last lock snapshot referencing it is dropped.
pub struct TransactionCore {
    tid: TransactionId,
    isolation: IsolationLevel,
    status: AtomicU8,
    /// Assigned at commit; 0 = not yet assigned.
    commit_ts: AtomicU64,
}

impl TransactionCore {
    pub fn new(tid: TransactionId, isolation: IsolationLevel) -> Self {
        Self {
            tid,
            isolation,
            status: AtomicU8::new(TxStatus::Active as u8),
            commit_ts: AtomicU64::new(0),
        }
    }

    pub fn transaction_id(&self) -> TransactionId {
        self.tid
    }

    pub fn isolation(&self) -> IsolationLevel {
        self.isolation
    }

    pub fn status(&self) -> TxStatus {
        TxStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    pub fn set_status(&self, status: TxStatus) {
        self.status.store(status as u8, Ordering::Release);
    }

    /// Move ACTIVE -> COMMITTING; false if the transaction already left
    /// the active state.
    pub fn begin_commit(&self) -> bool {
        self.status
            .compare_exchange(
                TxStatus::Active as u8,
                TxStatus::Committing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    pub fn is_committed(&self) -> bool {
        self.status() == TxStatus::Committed
    }

    pub fn commit_timestamp(&self) -> Option<Timestamp> {
        match self.commit_ts.load(Ordering::Acquire) {
            0 => None,
            ts => Some(ts),
        }
    }

    pub fn set_commit_ts(&self, ts: Timestamp) {
        self.commit_ts.store(ts, Ordering::Release);
    }

    pub fn is_repeatable_read(&self) -> bool {
        self.isolation.is_repeatable_read()
    }
}

struct TxnInner {
    core: Arc<TransactionCore>,
    engine: Arc<TransactionEngine>,
    autocommit: bool,
    /// Cells whose lock slot names this transaction, in acquisition
    /// order. The savepoint id is an index into this list.
    locks: Mutex<Vec<Arc<TransactionalCell>>>,
}

/// Executor-facing transaction handle. Cheap to clone; all clones drive
/// the same underlying transaction.
#[derive(Clone)]
pub struct Transaction {
    inner: Arc<TxnInner>,
}

impl Transaction {
    pub(crate) fn new(
        engine: Arc<TransactionEngine>,
        core: Arc<TransactionCore>,
        autocommit: bool,
    ) -> Self {
        Self {
            inner: Arc::new(TxnInner {
                core,
                engine,
                autocommit,
                locks: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn core(&self) -> &Arc<TransactionCore> {
        &self.inner.core
    }

    pub fn engine(&self) -> &Arc<TransactionEngine> {
        &self.inner.engine
    }

    pub fn transaction_id(&self) -> TransactionId {
        self.inner.core.transaction_id()
    }

    pub fn isolation(&self) -> IsolationLevel {
        self.inner.core.isolation()
    }

    pub fn status(&self) -> TxStatus {
        self.inner.core.status()
    }

    pub fn is_autocommit(&self) -> bool {
        self.inner.autocommit
    }

    pub fn held_lock_count(&self) -> usize {
        self.inner.locks.lock().len()
    }

    /// Bind this transaction to an ordered storage map.
    pub fn open_map<K: Ord + Clone + std::fmt::Debug>(
        &self,
        store: Arc<MemMap<K>>,
    ) -> TransactionMap<K> {
        TransactionMap::new(self.clone(), store)
    }

    fn ensure_active(&self) -> Result<()> {
        match self.status() {
            TxStatus::Active => Ok(()),
            other => Err(DbError::Transaction(format!(
                "transaction {} is not active ({other:?})",
                self.transaction_id()
            ))),
        }
    }

    /// Non-blocking row-lock acquisition. A newly acquired lock is
    /// recorded in the held-lock list; re-entrant acquisition is not.
    pub fn try_lock(&self, cell: &Arc<TransactionalCell>) -> TryLock {
        let outcome = cell.try_lock(&self.inner.core);
        if matches!(outcome, TryLock::Acquired) {
            self.inner.locks.lock().push(cell.clone());
        }
        outcome
    }

    /// Logical marker for partial rollback: the current length of the
    /// held-lock list.
    pub fn savepoint_id(&self) -> u64 {
        self.inner.locks.lock().len() as u64
    }

    /// Undo everything after `savepoint`: locks acquired since then are
    /// released newest-first with their pre-images restored.
    pub fn rollback_to_savepoint(&self, savepoint: u64) -> Result<()> {
        self.ensure_active()?;
        let mut locks = self.inner.locks.lock();
        while locks.len() as u64 > savepoint {
            if let Some(cell) = locks.pop() {
                cell.rollback_to_pre_image();
            }
        }
        Ok(())
    }

    /// Commit and wait for the redo-log acknowledgement.
    ///
    /// Under queued durability this blocks until the group flush runs.
    pub fn commit(&self) -> Result<()> {
        let (ack_tx, ack_rx) = channel::bounded(1);
        self.commit_async(move |result| {
            let _ = ack_tx.send(result);
        })?;
        ack_rx
            .recv()
            .map_err(|_| DbError::Internal("commit acknowledgement dropped".into()))?
    }

    /// Commit without waiting for the flush: publishes old versions,
    /// hands the redo log a pending commit and returns. `on_complete`
    /// fires when the flush acknowledges; only then are the locks
    /// released and the new values visible as committed.
    pub fn commit_async(
        &self,
        on_complete: impl FnOnce(Result<()>) + Send + 'static,
    ) -> Result<()> {
        if !self.inner.core.begin_commit() {
            return Err(DbError::Transaction(format!(
                "transaction {} is not active",
                self.transaction_id()
            )));
        }
        let engine = &self.inner.engine;
        let commit_ts = engine.next_timestamp();
        self.inner.core.set_commit_ts(commit_ts);

        let cells: Vec<Arc<TransactionalCell>> =
            self.inner.locks.lock().drain(..).collect();

        if engine.contains_repeatable_read_transactions() {
            // Version-publish for snapshot readers, then trim each chain
            // against the oldest of them.
            let floor = engine.min_live_repeatable_read_tid();
            for cell in &cells {
                engine.old_values().publish(cell, commit_ts, floor);
                engine.old_values().prune(cell.id(), floor);
            }
        } else {
            // No snapshot reader alive: retained versions are dead weight.
            engine.old_values().sweep(u64::MAX);
        }

        log::debug!(
            "transaction {} committing at ts {} ({} cells)",
            self.transaction_id(),
            commit_ts,
            cells.len()
        );
        engine.redo_log().append_commit(PendingCommit::new(
            engine,
            self.inner.core.clone(),
            cells,
            commit_ts,
            Box::new(on_complete),
        ));
        Ok(())
    }

    /// Roll the whole transaction back: every held cell gets its
    /// pre-image restored and its lock cleared, newest-first.
    pub fn rollback(&self) -> Result<()> {
        self.ensure_active()?;
        let cells: Vec<Arc<TransactionalCell>> =
            self.inner.locks.lock().drain(..).collect();
        for cell in cells.iter().rev() {
            cell.rollback_to_pre_image();
        }
        self.inner.core.set_status(TxStatus::RolledBack);
        self.inner.engine.end_transaction(&self.inner.core);
        log::debug!("transaction {} rolled back", self.transaction_id());
        Ok(())
    }
}
