//! rookdb transaction core
//!
//! The MVCC transaction engine of a distributed SQL database, sitting
//! between the SQL executor above and the ordered key-value storage
//! below. It provides:
//!
//! - per-row locking with a single compare-and-set lock slot per cell
//! - visibility under four isolation levels, shared by point reads and
//!   scan cursors
//! - old-version retention for repeatable-read snapshots, garbage
//!   collected against the oldest live snapshot reader
//! - commit (sync and async via the redo-log seam), rollback and
//!   savepoint partial rollback
//! - cooperative, yieldable DML execution that parks on row-lock
//!   conflicts and resumes without losing its cursor position
//!
//! ## Architecture
//! - Storage layer: ordered key -> versioned-cell maps ([`storage`])
//! - Transaction layer: cells, old-version chains, descriptors, engine,
//!   visibility oracle ([`txn`])
//! - Executor layer: sessions, scheduler, yieldable statements
//!   ([`executor`])

pub mod config;
pub mod executor;
pub mod storage;
pub mod txn;
pub mod types;

mod error;

pub use config::{DbConfig, DurabilityLevel};
pub use error::{DbError, Result};

pub use executor::{ConflictType, Scheduler, Session, SessionStatus, Yieldable, YieldableUpdate};
pub use storage::MemMap;
pub use txn::{
    ImmediateRedoLog, IsolationLevel, QueuedRedoLog, RedoLog, Transaction, TransactionEngine,
    TransactionMap, TxStatus,
};
pub use types::{Row, Value};
