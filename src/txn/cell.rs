//! Versioned cell: the per-row MVCC record
//!
//! A cell holds the current (committed or tentatively updated) value and a
//! nullable lock slot. `lock == None` means no in-flight writer and the
//! value is committed. The slot is the single point of coordination
//! between writers: whoever installs a `RowLock` owns the cell's value
//! until commit or rollback.
//!
//! Readers never take the slot guard for longer than one `Arc` clone; the
//! lock record itself is immutable, so a snapshot of the slot plus the
//! pre-image inside it is always a consistent pair.

use crate::storage::format::{read_optional, read_varlong, write_optional, write_varlong, DataType};
use crate::txn::transaction::TransactionCore;
use crate::types::{CellId, Timestamp, TransactionId, Value};
use crate::Result;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// In-flight writer record installed in a cell's lock slot.
///
/// Immutable once published. `pre_image == None` means the row did not
/// exist when the lock was taken (an uncommitted insert); concurrent
/// readers treat such a row as absent.
pub struct RowLock {
    owner: Arc<TransactionCore>,
    pre_image: Option<Value>,
}

impl RowLock {
    pub fn owner(&self) -> &Arc<TransactionCore> {
        &self.owner
    }

    pub fn pre_image(&self) -> Option<&Value> {
        self.pre_image.as_ref()
    }

    /// True when the lock was taken on a row that had no committed value.
    pub fn is_insert(&self) -> bool {
        self.pre_image.is_none()
    }
}

/// Outcome of a non-blocking lock attempt
pub enum TryLock {
    /// This attempt installed the lock.
    Acquired,
    /// The transaction already owned the lock (re-entrant).
    AlreadyHeld,
    /// Another live transaction holds the lock.
    Conflict(Arc<TransactionCore>),
}

impl TryLock {
    pub fn is_success(&self) -> bool {
        !matches!(self, TryLock::Conflict(_))
    }
}

/// One row's MVCC record: current value plus optional in-flight lock.
///
/// `value == None` is the tombstone for "row absent"; it is distinct from
/// a stored `Value::Null`.
pub struct TransactionalCell {
    id: CellId,

    /// Mutated only by the current lock owner (or at cell construction).
    value: RwLock<Option<Value>>,

    /// The lock slot. Transitions are a short try-and-set critical
    /// section; failure never blocks.
    lock: RwLock<Option<Arc<RowLock>>>,

    /// Commit timestamp of the newest committed write, 0 if never
    /// overwritten since load. Lets snapshot readers decide "the current
    /// value predates me" after the writer's lock is long gone.
    last_commit_ts: AtomicU64,
}

impl TransactionalCell {
    /// A committed cell with no in-flight writer.
    pub fn committed(id: CellId, value: Option<Value>) -> Self {
        Self {
            id,
            value: RwLock::new(value),
            lock: RwLock::new(None),
            last_commit_ts: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> CellId {
        self.id
    }

    /// Current value without any visibility check. For internal use by
    /// the lock owner and the visibility oracle.
    pub fn current(&self) -> Option<Value> {
        self.value.read().clone()
    }

    /// Snapshot the lock slot. The returned record is immutable; callers
    /// inspect it without re-reading the slot.
    pub fn lock_snapshot(&self) -> Option<Arc<RowLock>> {
        self.lock.read().clone()
    }

    pub fn is_locked(&self) -> bool {
        self.lock.read().is_some()
    }

    /// Commit timestamp of the newest committed overwrite (0 = none).
    pub fn last_commit_ts(&self) -> Timestamp {
        self.last_commit_ts.load(Ordering::Acquire)
    }

    /// Try to install `owner` in the lock slot, capturing the pre-image.
    ///
    /// Re-entrant for the current owner. Never blocks: a held slot returns
    /// `Conflict` with the holder so the caller can park on it.
    pub fn try_lock(&self, owner: &Arc<TransactionCore>) -> TryLock {
        let mut slot = self.lock.write();
        match slot.as_ref() {
            Some(held) if held.owner.transaction_id() == owner.transaction_id() => {
                TryLock::AlreadyHeld
            }
            Some(held) => TryLock::Conflict(held.owner.clone()),
            None => {
                let pre_image = self.value.read().clone();
                *slot = Some(Arc::new(RowLock {
                    owner: owner.clone(),
                    pre_image,
                }));
                TryLock::Acquired
            }
        }
    }

    /// Overwrite the tentative value. Owner-only, between a successful
    /// `try_lock` and the matching unlock.
    pub fn set_value(&self, value: Option<Value>) {
        *self.value.write() = value;
    }

    /// Restore the pre-image and clear the slot. Owner-only, from
    /// rollback paths.
    pub fn rollback_to_pre_image(&self) {
        let mut slot = self.lock.write();
        if let Some(held) = slot.take() {
            *self.value.write() = held.pre_image.clone();
        }
    }

    /// Record the commit timestamp and release the slot. Owner-only, from
    /// the commit finalize path.
    pub fn finish_commit(&self, commit_ts: Timestamp) {
        self.last_commit_ts.store(commit_ts, Ordering::Release);
        *self.lock.write() = None;
    }

    // ---- persisted layout -------------------------------------------------
    //
    // varlong tid (0 = committed, else the writer's transaction id), then
    // the value with a one-byte presence flag. Writing 0 for the common
    // committed case keeps the header to a single byte.

    /// Serialize the header: the owning transaction id, or 0 if committed.
    pub fn write_meta(&self, buf: &mut Vec<u8>) {
        let tid = match self.lock_snapshot() {
            Some(held) if !held.owner.is_committed() => held.owner.transaction_id(),
            _ => 0,
        };
        write_varlong(buf, tid);
    }

    /// Serialize the value body through the storage layer's descriptor.
    pub fn write_value(&self, buf: &mut Vec<u8>, dt: &dyn DataType<Value>) -> Result<()> {
        write_optional(buf, dt, self.value.read().as_ref())
    }

    pub fn write(&self, buf: &mut Vec<u8>, dt: &dyn DataType<Value>) -> Result<()> {
        self.write_meta(buf);
        self.write_value(buf, dt)
    }

    /// Read the header, returning the persisted transaction id.
    pub fn read_meta(buf: &mut &[u8]) -> Result<TransactionId> {
        read_varlong(buf)
    }

    /// Deserialize a cell. The result is always committed with
    /// `lock == None`: in-flight writers are recovered from the redo log,
    /// never replayed from a serialized lock slot, so a non-zero persisted
    /// tid is noted and discarded.
    pub fn read(id: CellId, buf: &mut &[u8], dt: &dyn DataType<Value>) -> Result<Self> {
        let tid = Self::read_meta(buf)?;
        if tid != 0 {
            log::trace!("cell {id}: discarding in-flight tid {tid} on read");
        }
        let value = read_optional(buf, dt)?;
        Ok(Self::committed(id, value))
    }
}
