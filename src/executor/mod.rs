//! Cooperative statement execution
//!
//! Long-running DML splits into yieldable steps: `run()` returns `true`
//! when the statement parked itself (row-lock conflict, cooperative
//! yield) and must be re-run later, `false` when it finished or failed.
//! One scheduler thread drives one session at a time; wake-ups arrive on
//! the session's channel when a lock holder finishes.

pub mod session;
pub mod yieldable;

pub use session::{ConflictType, Scheduler, Session, SessionStatus};
pub use yieldable::YieldableUpdate;

/// A statement that executes in cooperative steps.
pub trait Yieldable {
    /// Advance the statement. `true` = suspended, call again after a
    /// wake-up; `false` = finished or failed synchronously.
    fn run(&mut self) -> bool;

    /// Resume-from-conflict hook, called before re-running a parked
    /// statement.
    fn back(&mut self);
}
