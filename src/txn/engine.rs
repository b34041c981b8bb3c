//! Transaction engine
//!
//! Owns the global monotone counter (transaction ids and commit
//! timestamps come from the same sequence so they stay comparable), the
//! live-transaction set, old-version garbage collection, lock-waiter
//! wake-ups, deadlock detection and the redo-log seam.

use crate::config::{DbConfig, DurabilityLevel};
use crate::error::{DbError, Result};
use crate::txn::cell::TransactionalCell;
use crate::txn::old_value::OldValueIndex;
use crate::txn::transaction::{IsolationLevel, Transaction, TransactionCore, TxStatus};
use crate::types::{Timestamp, TransactionId};
use ahash::RandomState;
use crossbeam::channel::Sender;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

/// A commit handed to the redo log, finalized when the log acknowledges
/// the flush: status goes COMMITTED, every lock is released, waiters are
/// woken and the caller's continuation runs.
pub struct PendingCommit {
    engine: Weak<TransactionEngine>,
    core: Arc<TransactionCore>,
    cells: Vec<Arc<TransactionalCell>>,
    commit_ts: Timestamp,
    on_complete: Option<Box<dyn FnOnce(Result<()>) + Send>>,
}

impl PendingCommit {
    pub(crate) fn new(
        engine: &Arc<TransactionEngine>,
        core: Arc<TransactionCore>,
        cells: Vec<Arc<TransactionalCell>>,
        commit_ts: Timestamp,
        on_complete: Box<dyn FnOnce(Result<()>) + Send>,
    ) -> Self {
        Self {
            engine: Arc::downgrade(engine),
            core,
            cells,
            commit_ts,
            on_complete: Some(on_complete),
        }
    }

    pub fn transaction_id(&self) -> TransactionId {
        self.core.transaction_id()
    }

    /// The flush is durable: publish COMMITTED, then release the locks.
    ///
    /// Status flips before the slots clear so a reader that still sees a
    /// lock resolves it as a committed owner.
    pub fn flushed(mut self) {
        self.core.set_status(TxStatus::Committed);
        for cell in &self.cells {
            cell.finish_commit(self.commit_ts);
        }
        if let Some(engine) = self.engine.upgrade() {
            engine.note_committed(&self.core);
        }
        if let Some(on_complete) = self.on_complete.take() {
            on_complete(Ok(()));
        }
    }
}

/// Where the engine signals commit moments. Durability itself lives
/// outside the core; implementations only decide when the
/// acknowledgement comes back.
pub trait RedoLog: Send + Sync {
    fn append_commit(&self, pending: PendingCommit);
}

/// Acknowledges every commit inline: `commit()` returns flushed.
pub struct ImmediateRedoLog;

impl RedoLog for ImmediateRedoLog {
    fn append_commit(&self, pending: PendingCommit) {
        pending.flushed();
    }
}

/// Holds acknowledgements until `flush_all`, modelling group commit.
/// Async committers get their continuation when the batch flushes.
pub struct QueuedRedoLog {
    queue: Mutex<Vec<PendingCommit>>,
}

impl QueuedRedoLog {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(Vec::new()),
        }
    }

    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }

    /// Flush the batch; returns how many commits were finalized.
    pub fn flush_all(&self) -> usize {
        let batch: Vec<PendingCommit> = self.queue.lock().drain(..).collect();
        let n = batch.len();
        for pending in batch {
            pending.flushed();
        }
        n
    }
}

impl Default for QueuedRedoLog {
    fn default() -> Self {
        Self::new()
    }
}

impl RedoLog for QueuedRedoLog {
    fn append_commit(&self, pending: PendingCommit) {
        self.queue.lock().push(pending);
    }
}

/// A parked statement waiting for a lock holder to finish. The notify
/// channel feeds the owning session's scheduler.
pub struct Waiter {
    pub session_id: u64,
    pub notify: Sender<u64>,
}

/// Transaction engine state shared by every session.
pub struct TransactionEngine {
    config: DbConfig,

    /// Next transaction id / commit timestamp.
    counter: AtomicU64,

    /// Live (uncommitted, unrolled-back) transactions.
    live: DashMap<TransactionId, Arc<TransactionCore>, RandomState>,

    /// Live repeatable-read / serializable transaction ids; the first
    /// element is the retention floor for old-version chains.
    rr_live: Mutex<BTreeSet<TransactionId>>,
    rr_count: AtomicUsize,

    committed_count: AtomicU64,

    old_values: OldValueIndex,

    redo_log: Arc<dyn RedoLog>,

    /// holder tid -> statements to wake when it finishes.
    waiters: DashMap<TransactionId, Vec<Waiter>, RandomState>,

    /// waiter tid -> holder tid. A row lock has a single holder, so each
    /// parked transaction has at most one outgoing edge.
    wait_for: DashMap<TransactionId, TransactionId, RandomState>,

    closed: AtomicBool,
}

impl TransactionEngine {
    pub fn new(config: DbConfig) -> Arc<Self> {
        let redo_log: Arc<dyn RedoLog> = match config.durability {
            DurabilityLevel::Immediate => Arc::new(ImmediateRedoLog),
            DurabilityLevel::Queued => Arc::new(QueuedRedoLog::new()),
        };
        Self::with_redo_log(config, redo_log)
    }

    pub fn with_redo_log(config: DbConfig, redo_log: Arc<dyn RedoLog>) -> Arc<Self> {
        Self::with_next_id(config, redo_log, 1)
    }

    /// Recovery seam: restart the counter above the highest persisted
    /// transaction id / commit timestamp.
    pub fn with_next_id(
        config: DbConfig,
        redo_log: Arc<dyn RedoLog>,
        next_id: u64,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            counter: AtomicU64::new(next_id.max(1)),
            live: DashMap::with_hasher(RandomState::new()),
            rr_live: Mutex::new(BTreeSet::new()),
            rr_count: AtomicUsize::new(0),
            committed_count: AtomicU64::new(0),
            old_values: OldValueIndex::new(),
            redo_log,
            waiters: DashMap::with_hasher(RandomState::new()),
            wait_for: DashMap::with_hasher(RandomState::new()),
            closed: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &DbConfig {
        &self.config
    }

    pub fn redo_log(&self) -> &Arc<dyn RedoLog> {
        &self.redo_log
    }

    pub fn old_values(&self) -> &OldValueIndex {
        &self.old_values
    }

    pub fn next_timestamp(&self) -> Timestamp {
        self.counter.fetch_add(1, Ordering::SeqCst)
    }

    /// Begin a transaction.
    pub fn begin(
        self: &Arc<Self>,
        isolation: IsolationLevel,
        autocommit: bool,
    ) -> Result<Transaction> {
        if self.is_closed() {
            return Err(DbError::ConnectionBroken);
        }
        let tid = self.next_timestamp();
        let core = Arc::new(TransactionCore::new(tid, isolation));
        self.live.insert(tid, core.clone());
        if isolation.is_repeatable_read() {
            self.rr_live.lock().insert(tid);
            self.rr_count.fetch_add(1, Ordering::SeqCst);
        }
        log::trace!("begin transaction {tid} ({isolation:?})");
        Ok(Transaction::new(self.clone(), core, autocommit))
    }

    /// Cheap check used by the commit path to skip old-version
    /// bookkeeping entirely when no snapshot reader is alive.
    pub fn contains_repeatable_read_transactions(&self) -> bool {
        self.rr_count.load(Ordering::SeqCst) > 0
    }

    /// Oldest live repeatable-read transaction id, `u64::MAX` if none.
    pub fn min_live_repeatable_read_tid(&self) -> TransactionId {
        self.rr_live
            .lock()
            .iter()
            .next()
            .copied()
            .unwrap_or(u64::MAX)
    }

    pub(crate) fn note_committed(&self, core: &Arc<TransactionCore>) {
        self.committed_count.fetch_add(1, Ordering::SeqCst);
        self.end_transaction(core);
    }

    /// Remove an ended transaction from the live set and wake everyone
    /// parked on it.
    pub(crate) fn end_transaction(&self, core: &Arc<TransactionCore>) {
        let tid = core.transaction_id();
        self.live.remove(&tid);
        if core.is_repeatable_read() {
            self.rr_live.lock().remove(&tid);
            self.rr_count.fetch_sub(1, Ordering::SeqCst);
        }
        self.wait_for.remove(&tid);
        self.wake_waiters(tid);
    }

    fn wake_waiters(&self, holder: TransactionId) {
        if let Some((_, waiters)) = self.waiters.remove(&holder) {
            for waiter in waiters {
                log::trace!(
                    "transaction {holder} ended, waking session {}",
                    waiter.session_id
                );
                let _ = waiter.notify.send(waiter.session_id);
            }
        }
    }

    /// Record that `waiter` is parked on `holder`'s row lock. Refreshes
    /// the wait-for edge on re-attempts (the holder may have changed).
    pub fn park(&self, waiter: TransactionId, holder: TransactionId, handle: Waiter) {
        self.wait_for.insert(waiter, holder);
        let mut entry = self.waiters.entry(holder).or_default();
        if !entry.iter().any(|w| w.session_id == handle.session_id) {
            entry.push(handle);
        }
    }

    /// Drop the waiter's wait-for edge once it stops waiting.
    pub fn unpark(&self, waiter: TransactionId) {
        self.wait_for.remove(&waiter);
    }

    /// Walk "waits-for" from `start` until the chain ends or returns to
    /// `start`. Row locks have single holders, so the walk is a simple
    /// pointer chase bounded by the number of live transactions.
    pub fn detect_deadlock(&self, start: TransactionId) -> bool {
        let mut current = start;
        let mut hops = 0usize;
        let bound = self.live.len() + 1;
        loop {
            let next = match self.wait_for.get(&current) {
                Some(entry) => *entry.value(),
                None => return false,
            };
            if next == start {
                return true;
            }
            current = next;
            hops += 1;
            if hops > bound {
                // stale edges from ended transactions; no live cycle
                return false;
            }
        }
    }

    /// Periodic old-version sweep; also runs opportunistically from the
    /// commit path.
    pub fn sweep_old_values(&self) -> usize {
        let floor = if self.contains_repeatable_read_transactions() {
            self.min_live_repeatable_read_tid()
        } else {
            u64::MAX
        };
        let removed = self.old_values.sweep(floor);
        if removed > 0 {
            log::debug!("old-version sweep removed {removed} nodes (floor {floor})");
        }
        removed
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Close the database. Statements still running observe the flag and
    /// surface CONNECTION_BROKEN.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// Out-of-memory path: partial transaction state cannot be trusted,
    /// so nothing is rolled back; the engine just stops admitting work.
    pub fn emergency_shutdown(&self) {
        log::error!("emergency shutdown: transaction state abandoned");
        self.closed.store(true, Ordering::Release);
    }

    pub fn stats(&self) -> TransactionEngineStats {
        TransactionEngineStats {
            active_transactions: self.live.len() as u64,
            total_committed: self.committed_count.load(Ordering::SeqCst),
            live_repeatable_read: self.rr_count.load(Ordering::SeqCst) as u64,
            min_live_repeatable_read_tid: self.min_live_repeatable_read_tid(),
        }
    }
}

/// Transaction engine statistics
#[derive(Debug, Clone)]
pub struct TransactionEngineStats {
    pub active_transactions: u64,
    pub total_committed: u64,
    pub live_repeatable_read: u64,
    pub min_live_repeatable_read_tid: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemMap;
    use crate::types::Value;
    use std::thread;

    fn engine() -> Arc<TransactionEngine> {
        TransactionEngine::new(DbConfig::default())
    }

    #[test]
    fn test_ids_and_timestamps_share_one_sequence() {
        let engine = engine();
        let t1 = engine.begin(IsolationLevel::ReadCommitted, false).unwrap();
        let ts = engine.next_timestamp();
        let t2 = engine.begin(IsolationLevel::ReadCommitted, false).unwrap();
        assert!(t1.transaction_id() < ts);
        assert!(ts < t2.transaction_id());
    }

    #[test]
    fn test_min_live_repeatable_read_tracking() {
        let engine = engine();
        assert!(!engine.contains_repeatable_read_transactions());
        assert_eq!(engine.min_live_repeatable_read_tid(), u64::MAX);

        let rr1 = engine.begin(IsolationLevel::RepeatableRead, false).unwrap();
        let rr2 = engine.begin(IsolationLevel::Serializable, false).unwrap();
        let _rc = engine.begin(IsolationLevel::ReadCommitted, false).unwrap();

        assert!(engine.contains_repeatable_read_transactions());
        assert_eq!(engine.min_live_repeatable_read_tid(), rr1.transaction_id());

        rr1.commit().unwrap();
        assert_eq!(engine.min_live_repeatable_read_tid(), rr2.transaction_id());

        rr2.rollback().unwrap();
        assert!(!engine.contains_repeatable_read_transactions());
        assert_eq!(engine.min_live_repeatable_read_tid(), u64::MAX);
    }

    #[test]
    fn test_deadlock_detection_finds_cycle() {
        let engine = engine();
        let (tx, _rx) = crossbeam::channel::unbounded();
        engine.park(
            10,
            20,
            Waiter {
                session_id: 1,
                notify: tx.clone(),
            },
        );
        assert!(!engine.detect_deadlock(10));

        engine.park(
            20,
            10,
            Waiter {
                session_id: 2,
                notify: tx,
            },
        );
        assert!(engine.detect_deadlock(10));
        assert!(engine.detect_deadlock(20));

        engine.unpark(20);
        assert!(!engine.detect_deadlock(10));
    }

    #[test]
    fn test_transaction_end_wakes_waiters() {
        let engine = engine();
        let t1 = engine.begin(IsolationLevel::ReadCommitted, false).unwrap();
        let (tx, rx) = crossbeam::channel::unbounded();
        engine.park(
            999,
            t1.transaction_id(),
            Waiter {
                session_id: 7,
                notify: tx,
            },
        );

        t1.commit().unwrap();
        assert_eq!(rx.try_recv().unwrap(), 7);
    }

    #[test]
    fn test_closed_engine_rejects_begin() {
        let engine = engine();
        engine.close();
        assert!(matches!(
            engine.begin(IsolationLevel::ReadCommitted, false),
            Err(DbError::ConnectionBroken)
        ));
    }

    #[test]
    fn test_stats_count_commits() {
        let engine = engine();
        for _ in 0..3 {
            let t = engine.begin(IsolationLevel::ReadCommitted, false).unwrap();
            t.commit().unwrap();
        }
        let aborted = engine.begin(IsolationLevel::ReadCommitted, false).unwrap();
        aborted.rollback().unwrap();

        let stats = engine.stats();
        assert_eq!(stats.total_committed, 3);
        assert_eq!(stats.active_transactions, 0);
    }

    #[test]
    fn test_random_workload_quiesces_clean() {
        use rand::Rng;

        let engine = engine();
        let store: Arc<MemMap<u64>> = MemMap::new("t");
        let mut handles = vec![];

        for _ in 0..4 {
            let engine = engine.clone();
            let store = store.clone();
            handles.push(thread::spawn(move || {
                let mut rng = rand::thread_rng();
                for _ in 0..50 {
                    let level = if rng.gen_bool(0.5) {
                        IsolationLevel::ReadCommitted
                    } else {
                        IsolationLevel::RepeatableRead
                    };
                    let t = engine.begin(level, false).unwrap();
                    let map = t.open_map(store.clone());
                    let key = rng.gen_range(0..16u64);
                    // conflicts are expected; losers just roll back
                    let wrote = map.put(key, Value::Integer(rng.gen_range(0..100))).is_ok();
                    let _ = map.get(&key);
                    if wrote && rng.gen_bool(0.8) {
                        t.commit().unwrap();
                    } else {
                        t.rollback().unwrap();
                    }
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        let stats = engine.stats();
        assert_eq!(stats.active_transactions, 0);
        assert_eq!(stats.live_repeatable_read, 0);
        // with no live snapshot readers the next sweep clears every chain
        engine.sweep_old_values();
        assert_eq!(engine.old_values().stats().total_nodes, 0);
        for (_, cell) in store.range(..) {
            assert!(!cell.is_locked());
        }
    }

    #[test]
    fn test_concurrent_begin_commit() {
        let engine = engine();
        let store: Arc<MemMap<u64>> = MemMap::new("t");
        let mut handles = vec![];

        for i in 0..10u64 {
            let engine = engine.clone();
            let store = store.clone();
            handles.push(thread::spawn(move || {
                let t = engine.begin(IsolationLevel::ReadCommitted, false).unwrap();
                let map = t.open_map(store);
                map.put(i, Value::Integer(i as i64)).unwrap();
                t.commit().unwrap();
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        let stats = engine.stats();
        assert_eq!(stats.total_committed, 10);
        assert_eq!(stats.active_transactions, 0);
        assert_eq!(store.len(), 10);
    }
}
