//! Error types for the rookdb transaction core

use thiserror::Error;

pub type Result<T> = std::result::Result<T, DbError>;

#[derive(Error, Debug)]
pub enum DbError {
    /// Row-lock CAS lost. Caught inside the yieldable retry loop and never
    /// surfaced to callers; the retry loop upgrades it to Deadlock or
    /// LockTimeout when the wait is hopeless.
    #[error("concurrent update on row {0}")]
    ConcurrentUpdate(String),

    /// Cycle detected among lock waiters. Rolls back the whole transaction.
    #[error("deadlock detected: transaction {waiter} waits for transaction {holder}")]
    Deadlock { waiter: u64, holder: u64 },

    /// Waited past the session lock timeout with no cycle found.
    #[error("lock timeout after {elapsed_ms}ms waiting for transaction {holder}")]
    LockTimeout { holder: u64, elapsed_ms: u64 },

    /// Fatal. Partial transaction state cannot be trusted; the engine
    /// shuts down immediately.
    #[error("out of memory")]
    OutOfMemory,

    /// The database was closed while a statement was running.
    #[error("connection broken: database closed")]
    ConnectionBroken,

    /// Invariant violation.
    #[error("internal error: {0}")]
    Internal(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("invalid data: {0}")]
    InvalidData(String),

    #[error("statement cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<bincode::Error> for DbError {
    fn from(err: bincode::Error) -> Self {
        DbError::Serialization(err.to_string())
    }
}
