//! Visibility oracle
//!
//! Decides, for one cell and one reading transaction, which value the
//! reader must see. Shared by point reads and scan cursors so both
//! apply identical rules.
//!
//! The reader's transaction id doubles as its snapshot marker: under
//! repeatable-read it sees exactly the commits whose timestamp is at or
//! below its own id. Ids and commit timestamps come from one monotone
//! counter, so the comparison is direct.

use crate::txn::cell::TransactionalCell;
use crate::txn::old_value::{ChainWalk, OldValueIndex};
use crate::txn::transaction::{IsolationLevel, TransactionCore};
use crate::types::Value;

/// What a reader sees at a cell.
///
/// `Sightless` means no version exists that is visible to this reader:
/// the row is treated as if it does not exist. Distinct from a stored
/// `Value::Null`, which is a visible value.
#[derive(Debug, PartialEq)]
pub enum Sight {
    Visible(Value),
    Sightless,
}

impl Sight {
    fn of(value: Option<Value>) -> Sight {
        match value {
            Some(v) => Sight::Visible(v),
            None => Sight::Sightless,
        }
    }

    pub fn is_sightless(&self) -> bool {
        matches!(self, Sight::Sightless)
    }

    pub fn into_option(self) -> Option<Value> {
        match self {
            Sight::Visible(v) => Some(v),
            Sight::Sightless => None,
        }
    }
}

/// Resolve the value `reader` must see at `cell`.
pub fn visible(
    cell: &TransactionalCell,
    reader: &TransactionCore,
    old_values: &OldValueIndex,
) -> Sight {
    // One snapshot of the slot; the record behind it is immutable.
    let lock = cell.lock_snapshot();

    // A transaction always sees its own writes.
    if let Some(held) = &lock {
        if held.owner().transaction_id() == reader.transaction_id() {
            return Sight::of(cell.current());
        }
    }

    match reader.isolation() {
        IsolationLevel::ReadUncommitted => Sight::of(cell.current()),

        IsolationLevel::ReadCommitted => match &lock {
            None => Sight::of(cell.current()),
            Some(held) if held.owner().is_committed() => Sight::of(cell.current()),
            // Uncommitted writer: the pre-image is what the world sees.
            // No pre-image means an uncommitted insert, so no row at all.
            Some(held) => Sight::of(held.pre_image().cloned()),
        },

        IsolationLevel::RepeatableRead | IsolationLevel::Serializable => {
            let rtid = reader.transaction_id();
            match &lock {
                Some(held) => {
                    if held.owner().is_committed()
                        && held
                            .owner()
                            .commit_timestamp()
                            .map_or(false, |cts| rtid >= cts)
                    {
                        return Sight::of(cell.current());
                    }
                }
                None => {
                    // The newest committed overwrite predates the reader:
                    // current value belongs to its snapshot. A cell never
                    // overwritten while any snapshot reader was live has
                    // no chain and resolves here.
                    if rtid >= cell.last_commit_ts() {
                        return Sight::of(cell.current());
                    }
                }
            }
            match old_values.walk(cell.id(), rtid) {
                ChainWalk::Found(value) => Sight::of(value),
                ChainWalk::Exhausted | ChainWalk::NoChain => match &lock {
                    Some(held) => Sight::of(held.pre_image().cloned()),
                    None => Sight::Sightless,
                },
            }
        }
    }
}
