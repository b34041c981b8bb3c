//! Yieldable DML execution
//!
//! Drives one DELETE or UPDATE statement row by row. The statement is an
//! explicit state machine (START -> EXECUTE -> STOP) with a resume
//! anchor, not a continuation: on a row-lock conflict it saves its
//! position, parks the session and returns control to the scheduler.
//! When the holder finishes, the scheduler re-runs the statement and it
//! retries the anchored row before advancing.
//!
//! Error policy: lock conflicts never surface (they park or escalate);
//! a deadlock rolls back the whole transaction; a lock timeout rolls
//! back to the pre-row savepoint; out-of-memory bypasses the normal
//! stop path and shuts the engine down.

use crate::error::{DbError, Result};
use crate::executor::session::{ConflictType, Session, SessionStatus};
use crate::executor::Yieldable;
use crate::txn::cell::{TransactionalCell, TryLock};
use crate::txn::map::TransactionMap;
use crate::txn::transaction::{Transaction, TransactionCore, TxStatus};
use crate::txn::visibility;
use crate::types::Value;
use std::fmt::Debug;
use std::sync::Arc;

enum State {
    Start,
    Execute,
    Stop,
}

enum StatementKind {
    Delete,
    Update {
        apply: Box<dyn FnMut(&Value) -> Result<Value> + Send>,
    },
}

/// Where to pick up after a suspension: the candidate index plus the
/// savepoint taken before the row was attempted.
struct Anchor {
    index: usize,
    savepoint: u64,
}

enum RowStep {
    Advance,
    Parked,
    LimitReached,
    Fatal,
}

pub struct YieldableUpdate<K: Ord + Clone + Debug> {
    map: TransactionMap<K>,
    session: Arc<Session>,
    kind: StatementKind,
    filter: Box<dyn FnMut(&K, &Value) -> bool + Send>,
    before_trigger: Option<Box<dyn FnMut(&K, &Value) -> bool + Send>>,
    limit: Option<u64>,
    yield_interval: u64,
    /// Originating statement text, carried into surfaced errors.
    statement: Option<String>,

    state: State,
    candidates: Vec<(K, Arc<TransactionalCell>)>,
    next: usize,
    anchor: Option<Anchor>,
    rows_seen: u64,
    updated: u64,

    outcome: Option<Result<u64>>,
    handler: Option<Box<dyn FnOnce(&Result<u64>) + Send>>,
}

impl<K: Ord + Clone + Debug> YieldableUpdate<K> {
    pub fn delete(
        map: TransactionMap<K>,
        session: Arc<Session>,
        filter: impl FnMut(&K, &Value) -> bool + Send + 'static,
    ) -> Self {
        Self::new(map, session, StatementKind::Delete, Box::new(filter))
    }

    pub fn update(
        map: TransactionMap<K>,
        session: Arc<Session>,
        filter: impl FnMut(&K, &Value) -> bool + Send + 'static,
        apply: impl FnMut(&Value) -> Result<Value> + Send + 'static,
    ) -> Self {
        Self::new(
            map,
            session,
            StatementKind::Update {
                apply: Box::new(apply),
            },
            Box::new(filter),
        )
    }

    fn new(
        map: TransactionMap<K>,
        session: Arc<Session>,
        kind: StatementKind,
        filter: Box<dyn FnMut(&K, &Value) -> bool + Send>,
    ) -> Self {
        let yield_interval = map.txn().engine().config().yield_interval.max(1) as u64;
        Self {
            map,
            session,
            kind,
            filter,
            before_trigger: None,
            limit: None,
            yield_interval,
            statement: None,
            state: State::Start,
            candidates: Vec::new(),
            next: 0,
            anchor: None,
            rows_seen: 0,
            updated: 0,
            outcome: None,
            handler: None,
        }
    }

    pub fn with_limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Attach the SQL text this statement came from; surfaced errors are
    /// annotated with it.
    pub fn with_statement(mut self, text: impl Into<String>) -> Self {
        self.statement = Some(text.into());
        self
    }

    /// BEFORE trigger: returning false vetoes the row (its savepoint is
    /// rolled back and the cursor advances).
    pub fn with_before_trigger(
        mut self,
        trigger: impl FnMut(&K, &Value) -> bool + Send + 'static,
    ) -> Self {
        self.before_trigger = Some(Box::new(trigger));
        self
    }

    pub fn on_complete(mut self, handler: impl FnOnce(&Result<u64>) + Send + 'static) -> Self {
        self.handler = Some(Box::new(handler));
        self
    }

    pub fn update_count(&self) -> u64 {
        self.updated
    }

    pub fn take_outcome(&mut self) -> Option<Result<u64>> {
        self.outcome.take()
    }

    fn txn(&self) -> Transaction {
        self.map.txn().clone()
    }

    fn finish(&mut self) -> bool {
        let txn = self.txn();
        if txn.is_autocommit() && txn.status() == TxStatus::Active {
            if let Err(e) = txn.commit() {
                return self.fail(e);
            }
        }
        self.state = State::Stop;
        self.session.set_status(SessionStatus::StatementCompleted);
        let outcome = Ok(self.updated);
        if let Some(handler) = self.handler.take() {
            handler(&outcome);
        }
        self.outcome = Some(outcome);
        false
    }

    fn fail(&mut self, error: DbError) -> bool {
        if matches!(error, DbError::OutOfMemory) {
            // fatal: skip the normal stop path entirely
            self.txn().engine().emergency_shutdown();
            self.state = State::Stop;
            self.outcome = Some(Err(error));
            return false;
        }
        self.state = State::Stop;
        self.session.set_status(SessionStatus::StatementCompleted);
        self.session.set_conflict(ConflictType::None);
        self.session.set_current_locked_row(None);
        let error = match (&self.statement, error) {
            // concurrency outcomes keep their kind for the retry logic
            // above; anything else carries the originating statement
            (Some(text), e)
                if !matches!(
                    e,
                    DbError::Deadlock { .. } | DbError::LockTimeout { .. } | DbError::Cancelled
                ) =>
            {
                DbError::Transaction(format!("{text}: {e}"))
            }
            (_, e) => e,
        };
        let outcome = Err(error);
        if let Some(handler) = self.handler.take() {
            handler(&outcome);
        }
        self.outcome = Some(outcome);
        false
    }

    fn step_row(&mut self, index: usize, anchor: Option<Anchor>) -> RowStep {
        let (key, cell) = self.candidates[index].clone();
        let txn = self.txn();

        // Evaluate the filter against what this transaction can see.
        // A resumed row is re-checked here: the holder's commit may have
        // changed or deleted it.
        let seen = visibility::visible(&cell, txn.core(), txn.engine().old_values());
        let seen = match seen.into_option() {
            Some(v) => v,
            None => return RowStep::Advance,
        };
        if !(self.filter)(&key, &seen) {
            return RowStep::Advance;
        }

        let savepoint = anchor
            .as_ref()
            .map(|a| a.savepoint)
            .unwrap_or_else(|| txn.savepoint_id());

        match txn.try_lock(&cell) {
            TryLock::Conflict(holder) => self.park(index, savepoint, &key, &holder),
            TryLock::Acquired | TryLock::AlreadyHeld => {
                txn.engine().unpark(txn.transaction_id());
                self.session.end_wait();
                self.session.set_conflict(ConflictType::None);
                self.session.set_current_locked_row(None);

                if let Some(trigger) = self.before_trigger.as_mut() {
                    if !trigger(&key, &seen) {
                        if let Err(e) = txn.rollback_to_savepoint(savepoint) {
                            return self.row_error(e, savepoint);
                        }
                        return RowStep::Advance;
                    }
                }

                // Mutate from the value we now own; a commit that slipped
                // in between the filter and the lock may have removed it.
                let current = match cell.current() {
                    Some(v) => v,
                    None => {
                        if let Err(e) = txn.rollback_to_savepoint(savepoint) {
                            return self.row_error(e, savepoint);
                        }
                        return RowStep::Advance;
                    }
                };
                match &mut self.kind {
                    StatementKind::Delete => cell.set_value(None),
                    StatementKind::Update { apply } => match apply(&current) {
                        Ok(new_value) => cell.set_value(Some(new_value)),
                        Err(e) => return self.row_error(e, savepoint),
                    },
                }
                self.updated += 1;
                log::trace!(
                    "session {} mutated row {key:?} ({} so far)",
                    self.session.id(),
                    self.updated
                );

                if let Some(limit) = self.limit {
                    if self.updated >= limit {
                        return RowStep::LimitReached;
                    }
                }
                RowStep::Advance
            }
        }
    }

    fn park(
        &mut self,
        index: usize,
        savepoint: u64,
        key: &K,
        holder: &Arc<TransactionCore>,
    ) -> RowStep {
        let txn = self.txn();
        let my_tid = txn.transaction_id();
        let holder_tid = holder.transaction_id();

        match self.session.waiting_since() {
            None => {
                // first conflict on this row: park and let the scheduler
                // re-run us when the holder finishes
                self.session.begin_wait();
                self.session.set_status(SessionStatus::Waiting);
                self.session.set_conflict(ConflictType::RowLock);
                self.session.set_current_locked_row(Some(format!("{key:?}")));
                txn.engine().park(my_tid, holder_tid, self.session.waiter());
                self.anchor = Some(Anchor { index, savepoint });
                log::debug!(
                    "session {}: transaction {my_tid} parked on {key:?} held by {holder_tid}",
                    self.session.id()
                );
                RowStep::Parked
            }
            Some(since) if since.elapsed() >= self.session.lock_timeout() => {
                // waited out the budget: look for a cycle before giving up
                txn.engine().park(my_tid, holder_tid, self.session.waiter());
                let deadlock = txn.engine().detect_deadlock(my_tid);
                txn.engine().unpark(my_tid);
                self.session.end_wait();
                self.session.set_conflict(ConflictType::None);
                self.session.set_current_locked_row(None);

                if deadlock {
                    log::warn!(
                        "deadlock: transaction {my_tid} <-> transaction {holder_tid}, rolling back"
                    );
                    let _ = txn.rollback();
                    self.fail(DbError::Deadlock {
                        waiter: my_tid,
                        holder: holder_tid,
                    });
                    RowStep::Fatal
                } else {
                    let elapsed_ms = since.elapsed().as_millis() as u64;
                    let _ = txn.rollback_to_savepoint(savepoint);
                    self.fail(DbError::LockTimeout {
                        holder: holder_tid,
                        elapsed_ms,
                    });
                    RowStep::Fatal
                }
            }
            Some(_) => {
                // still within the timeout; refresh the edge (the holder
                // may differ from last attempt) and stay parked
                txn.engine().park(my_tid, holder_tid, self.session.waiter());
                self.session.set_status(SessionStatus::Waiting);
                self.anchor = Some(Anchor { index, savepoint });
                RowStep::Parked
            }
        }
    }

    fn row_error(&mut self, error: DbError, savepoint: u64) -> RowStep {
        let txn = self.txn();
        match error {
            DbError::Deadlock { .. } => {
                let _ = txn.rollback();
                self.fail(error);
            }
            DbError::OutOfMemory => {
                self.fail(error);
            }
            other => {
                let _ = txn.rollback_to_savepoint(savepoint);
                self.fail(other);
            }
        }
        RowStep::Fatal
    }
}

impl<K: Ord + Clone + Debug> Yieldable for YieldableUpdate<K> {
    fn run(&mut self) -> bool {
        if matches!(self.state, State::Stop) {
            return false;
        }
        self.session.set_status(SessionStatus::StatementRunning);
        if matches!(self.state, State::Start) {
            self.candidates = self.map.cells(..);
            self.state = State::Execute;
        }

        loop {
            if self.map.txn().engine().is_closed() {
                return self.fail(DbError::ConnectionBroken);
            }

            let (index, anchor) = match self.anchor.take() {
                Some(anchor) => (anchor.index, Some(anchor)),
                None => (self.next, None),
            };
            if index >= self.candidates.len() {
                return self.finish();
            }

            self.rows_seen += 1;
            if self.rows_seen % self.yield_interval == 0 {
                if self.session.is_cancelled() {
                    let txn = self.txn();
                    let savepoint = anchor
                        .as_ref()
                        .map(|a| a.savepoint)
                        .unwrap_or_else(|| txn.savepoint_id());
                    let _ = txn.rollback_to_savepoint(savepoint);
                    self.session.clear_cancel();
                    return self.fail(DbError::Cancelled);
                }
                if self.session.take_yield_request() {
                    // no conflict, just give the scheduler a turn
                    self.anchor = anchor;
                    if self.anchor.is_none() {
                        self.next = index;
                    }
                    return true;
                }
            }

            match self.step_row(index, anchor) {
                RowStep::Advance => {
                    self.next = index + 1;
                }
                RowStep::Parked => return true,
                RowStep::LimitReached => return self.finish(),
                RowStep::Fatal => return false,
            }
        }
    }

    fn back(&mut self) {
        if !matches!(self.state, State::Stop) {
            self.session.set_status(SessionStatus::Retrying);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DbConfig;
    use crate::executor::session::Scheduler;
    use crate::storage::MemMap;
    use crate::txn::engine::TransactionEngine;
    use crate::txn::transaction::IsolationLevel;
    use std::thread;
    use std::time::Duration;

    fn setup() -> (Arc<TransactionEngine>, Arc<MemMap<u64>>, Arc<Scheduler>) {
        let config = DbConfig::fast();
        let engine = TransactionEngine::new(config.clone());
        let store: Arc<MemMap<u64>> = MemMap::new("rows");
        let scheduler = Scheduler::new(&config);
        (engine, store, scheduler)
    }

    fn seed(engine: &Arc<TransactionEngine>, store: &Arc<MemMap<u64>>, n: u64) {
        let txn = engine.begin(IsolationLevel::ReadCommitted, false).unwrap();
        let map = txn.open_map(store.clone());
        for i in 1..=n {
            map.put(i, Value::Integer(i as i64)).unwrap();
        }
        txn.commit().unwrap();
    }

    #[test]
    fn test_delete_all_matching_rows() {
        let (engine, store, scheduler) = setup();
        seed(&engine, &store, 5);

        let txn = engine.begin(IsolationLevel::ReadCommitted, false).unwrap();
        let map = txn.open_map(store.clone());
        let session = scheduler.new_session();
        let mut stmt =
            YieldableUpdate::delete(map, session.clone(), |_, v| {
                matches!(v, Value::Integer(n) if n % 2 == 1)
            });

        assert!(!stmt.run());
        assert_eq!(stmt.take_outcome().unwrap().unwrap(), 3);
        assert_eq!(session.status(), SessionStatus::StatementCompleted);
        txn.commit().unwrap();

        let probe = engine.begin(IsolationLevel::ReadCommitted, false).unwrap();
        let left: Vec<u64> = probe.open_map(store).cursor(..).map(|(k, _)| k).collect();
        assert_eq!(left, vec![2, 4]);
    }

    #[test]
    fn test_update_statement_transforms_rows() {
        let (engine, store, scheduler) = setup();
        seed(&engine, &store, 3);

        let txn = engine.begin(IsolationLevel::ReadCommitted, false).unwrap();
        let map = txn.open_map(store.clone());
        let session = scheduler.new_session();
        let mut stmt = YieldableUpdate::update(
            map,
            session,
            |_, _| true,
            |v| match v {
                Value::Integer(n) => Ok(Value::Integer(n * 10)),
                other => Ok(other.clone()),
            },
        );

        assert!(!stmt.run());
        assert_eq!(stmt.take_outcome().unwrap().unwrap(), 3);
        txn.commit().unwrap();

        let probe = engine.begin(IsolationLevel::ReadCommitted, false).unwrap();
        assert_eq!(probe.open_map(store).get(&2), Some(Value::Integer(20)));
    }

    #[test]
    fn test_limit_stops_after_n_rows() {
        let (engine, store, scheduler) = setup();
        seed(&engine, &store, 5);

        let txn = engine.begin(IsolationLevel::ReadCommitted, false).unwrap();
        let map = txn.open_map(store.clone());
        let session = scheduler.new_session();
        let mut stmt = YieldableUpdate::delete(map, session, |_, _| true).with_limit(2);

        assert!(!stmt.run());
        assert_eq!(stmt.take_outcome().unwrap().unwrap(), 2);
        txn.commit().unwrap();

        let probe = engine.begin(IsolationLevel::ReadCommitted, false).unwrap();
        assert_eq!(probe.open_map(store).count(), 3);
    }

    #[test]
    fn test_row_lock_conflict_parks_then_resumes() {
        let (engine, store, scheduler) = setup();
        seed(&engine, &store, 10);

        // T_X holds row 7 uncommitted
        let t_x = engine.begin(IsolationLevel::ReadCommitted, false).unwrap();
        let map_x = t_x.open_map(store.clone());
        map_x.put(7, Value::Integer(700)).unwrap();

        // T_Y's DELETE matching row 7 parks
        let t_y = engine.begin(IsolationLevel::ReadCommitted, false).unwrap();
        let map_y = t_y.open_map(store.clone());
        let session = scheduler.new_session();
        let mut stmt = YieldableUpdate::delete(map_y, session.clone(), |k, _| *k == 7);

        assert!(stmt.run());
        assert_eq!(session.status(), SessionStatus::Waiting);
        assert_eq!(session.conflict(), ConflictType::RowLock);
        assert_eq!(session.current_locked_row(), Some("7".to_string()));

        // holder commits; the session is woken
        t_x.commit().unwrap();
        assert!(session.wait_for_wake(Duration::from_millis(500)));

        stmt.back();
        assert!(!stmt.run());
        // T_Y (read committed) sees the committed 700, still matching, deletes it
        assert_eq!(stmt.take_outcome().unwrap().unwrap(), 1);
        assert_eq!(session.conflict(), ConflictType::None);
        t_y.commit().unwrap();

        let probe = engine.begin(IsolationLevel::ReadCommitted, false).unwrap();
        assert_eq!(probe.open_map(store).get(&7), None);
    }

    #[test]
    fn test_conflict_resumes_past_row_deleted_by_holder() {
        let (engine, store, scheduler) = setup();
        seed(&engine, &store, 3);

        let t_x = engine.begin(IsolationLevel::ReadCommitted, false).unwrap();
        let map_x = t_x.open_map(store.clone());
        map_x.remove(&2).unwrap();

        let t_y = engine.begin(IsolationLevel::ReadCommitted, false).unwrap();
        let map_y = t_y.open_map(store.clone());
        let session = scheduler.new_session();
        let mut stmt = YieldableUpdate::delete(map_y, session.clone(), |k, _| *k == 2);

        assert!(stmt.run());
        t_x.commit().unwrap();
        assert!(session.wait_for_wake(Duration::from_millis(500)));

        stmt.back();
        assert!(!stmt.run());
        // the anchored row vanished with the holder's commit: nothing left to delete
        assert_eq!(stmt.take_outcome().unwrap().unwrap(), 0);
    }

    #[test]
    fn test_deadlock_is_detected_and_one_side_rolls_back() {
        let (engine, store, scheduler) = setup();
        seed(&engine, &store, 2);

        // T_P locks row 1, T_Q locks row 2
        let t_p = engine.begin(IsolationLevel::ReadCommitted, false).unwrap();
        t_p.open_map(store.clone()).put(1, Value::Integer(100)).unwrap();
        let t_q = engine.begin(IsolationLevel::ReadCommitted, false).unwrap();
        t_q.open_map(store.clone()).put(2, Value::Integer(200)).unwrap();

        // now each tries the other's row through a yieldable
        let session_p = scheduler.new_session();
        let session_q = scheduler.new_session();
        let mut stmt_p =
            YieldableUpdate::delete(t_p.open_map(store.clone()), session_p.clone(), |k, _| *k == 2);
        let mut stmt_q =
            YieldableUpdate::delete(t_q.open_map(store.clone()), session_q.clone(), |k, _| *k == 1);

        let sched_p = scheduler.clone();
        let sched_q = scheduler.clone();
        let handle_p = thread::spawn(move || {
            sched_p.drive(&session_p, &mut stmt_p);
            stmt_p.take_outcome().unwrap()
        });
        let handle_q = thread::spawn(move || {
            sched_q.drive(&session_q, &mut stmt_q);
            stmt_q.take_outcome().unwrap()
        });

        let outcome_p = handle_p.join().unwrap();
        let outcome_q = handle_q.join().unwrap();

        let deadlocks = [&outcome_p, &outcome_q]
            .iter()
            .filter(|o| matches!(o, Err(DbError::Deadlock { .. })))
            .count();
        assert!(
            deadlocks >= 1,
            "expected a deadlock, got {outcome_p:?} / {outcome_q:?}"
        );

        // settle the survivors, then every lock must be gone. A deadlock
        // victim already rolled its whole transaction back; a lock-timeout
        // loser only rolled back to the row savepoint and still holds its
        // earlier locks.
        for (outcome, txn) in [(&outcome_p, &t_p), (&outcome_q, &t_q)] {
            match outcome {
                Ok(_) => txn.commit().unwrap(),
                Err(DbError::Deadlock { .. }) => {}
                Err(_) => {
                    let _ = txn.rollback();
                }
            }
        }
        for key in [1u64, 2] {
            assert!(!store.get(&key).unwrap().is_locked());
        }
    }

    #[test]
    fn test_cancellation_rolls_back_current_iteration() {
        let config = DbConfig {
            yield_interval: 2,
            ..DbConfig::fast()
        };
        let engine = TransactionEngine::new(config.clone());
        let store: Arc<MemMap<u64>> = MemMap::new("rows");
        let scheduler = Scheduler::new(&config);
        seed(&engine, &store, 10);

        let txn = engine.begin(IsolationLevel::ReadCommitted, false).unwrap();
        let map = txn.open_map(store.clone());
        let session = scheduler.new_session();
        session.cancel();
        let mut stmt = YieldableUpdate::delete(map, session, |_, _| true);

        assert!(!stmt.run());
        assert!(matches!(
            stmt.take_outcome().unwrap(),
            Err(DbError::Cancelled)
        ));
    }

    #[test]
    fn test_before_trigger_vetoes_rows() {
        let (engine, store, scheduler) = setup();
        seed(&engine, &store, 4);

        let txn = engine.begin(IsolationLevel::ReadCommitted, false).unwrap();
        let map = txn.open_map(store.clone());
        let session = scheduler.new_session();
        let mut stmt = YieldableUpdate::delete(map, session, |_, _| true)
            .with_before_trigger(|k, _| *k != 3);

        assert!(!stmt.run());
        assert_eq!(stmt.take_outcome().unwrap().unwrap(), 3);
        // the vetoed row's lock was released by the savepoint rollback
        assert!(!store.get(&3).unwrap().is_locked());
        txn.commit().unwrap();

        let probe = engine.begin(IsolationLevel::ReadCommitted, false).unwrap();
        let left: Vec<u64> = probe.open_map(store).cursor(..).map(|(k, _)| k).collect();
        assert_eq!(left, vec![3]);
    }

    #[test]
    fn test_row_error_rolls_back_row_and_carries_statement_text() {
        let (engine, store, scheduler) = setup();
        seed(&engine, &store, 3);

        let txn = engine.begin(IsolationLevel::ReadCommitted, false).unwrap();
        let map = txn.open_map(store.clone());
        let session = scheduler.new_session();
        let mut stmt = YieldableUpdate::update(
            map,
            session,
            |_, _| true,
            |v| match v {
                Value::Integer(2) => Err(DbError::InvalidData("bad row".into())),
                other => Ok(other.clone()),
            },
        )
        .with_statement("UPDATE t SET x = x");

        assert!(!stmt.run());
        match stmt.take_outcome().unwrap() {
            Err(DbError::Transaction(msg)) => {
                assert!(msg.contains("UPDATE t SET x = x"));
                assert!(msg.contains("bad row"));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        // the failing row's lock was released by the savepoint rollback,
        // earlier rows stay locked by the still-active transaction
        assert!(!store.get(&2).unwrap().is_locked());
        assert!(store.get(&1).unwrap().is_locked());
        txn.rollback().unwrap();
    }

    #[test]
    fn test_completion_handler_fires() {
        let (engine, store, scheduler) = setup();
        seed(&engine, &store, 2);

        let txn = engine.begin(IsolationLevel::ReadCommitted, false).unwrap();
        let map = txn.open_map(store);
        let session = scheduler.new_session();
        let (tx, rx) = crossbeam::channel::bounded(1);
        let mut stmt = YieldableUpdate::delete(map, session, |_, _| true).on_complete(
            move |outcome| {
                tx.send(outcome.as_ref().map(|n| *n).map_err(|_| ())).unwrap();
            },
        );

        assert!(!stmt.run());
        assert_eq!(rx.try_recv().unwrap(), Ok(2));
    }

    #[test]
    fn test_closed_engine_breaks_statement() {
        let (engine, store, scheduler) = setup();
        seed(&engine, &store, 2);

        let txn = engine.begin(IsolationLevel::ReadCommitted, false).unwrap();
        let map = txn.open_map(store);
        let session = scheduler.new_session();
        let mut stmt = YieldableUpdate::delete(map, session, |_, _| true);

        engine.close();
        assert!(!stmt.run());
        assert!(matches!(
            stmt.take_outcome().unwrap(),
            Err(DbError::ConnectionBroken)
        ));
    }
}
