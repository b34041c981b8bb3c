//! Transaction layer implementation

pub mod cell;
pub mod engine;
pub mod map;
pub mod old_value;
pub mod transaction;
pub mod visibility;

pub use cell::{RowLock, TransactionalCell, TryLock};
pub use engine::{
    ImmediateRedoLog, PendingCommit, QueuedRedoLog, RedoLog, TransactionEngine,
    TransactionEngineStats, Waiter,
};
pub use map::{TransactionMap, TransactionMapCursor};
pub use old_value::{OldValueIndex, OldValueIndexStats};
pub use transaction::{IsolationLevel, Transaction, TransactionCore, TxStatus};
pub use visibility::{visible, Sight};
