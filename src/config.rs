//! Engine configuration
//!
//! Balances responsiveness and throughput for the transaction core: how
//! long a statement waits on a row lock before escalating, how often a
//! long update yields to the scheduler, and how commit acknowledgements
//! are delivered by the redo log.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Durability level for the redo-log seam.
///
/// The core never writes files itself; it only decides when a commit is
/// acknowledged back to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DurabilityLevel {
    /// Acknowledge the commit inline, before `commit()` returns.
    ///
    /// Equivalent to a synchronous redo-log flush per transaction.
    Immediate,

    /// Queue the acknowledgement; a later flush releases a whole batch.
    ///
    /// Models group commit: callers of `commit_async` get their callback
    /// when the batch flushes.
    Queued,
}

impl Default for DurabilityLevel {
    fn default() -> Self {
        DurabilityLevel::Immediate
    }
}

/// Transaction core configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbConfig {
    /// How long a statement may wait on a single row lock before the
    /// engine runs deadlock detection and escalates to Deadlock or
    /// LockTimeout.
    pub lock_timeout: Duration,

    /// A yieldable statement checks cancellation and offers the scheduler
    /// a chance to run every this many rows.
    pub yield_interval: usize,

    /// Commit acknowledgement mode.
    pub durability: DurabilityLevel,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_secs(2),
            yield_interval: 128,
            durability: DurabilityLevel::default(),
        }
    }
}

impl DbConfig {
    /// Configuration for tests that must not stall: short lock timeout,
    /// inline commit acks.
    pub fn fast() -> Self {
        Self {
            lock_timeout: Duration::from_millis(50),
            ..Self::default()
        }
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn with_durability(mut self, durability: DurabilityLevel) -> Self {
        self.durability = durability;
        self
    }
}
