//! Session state and the cooperative scheduler
//!
//! A session is the unit of scheduling: at most one thread drives a
//! session at any moment, and the session records the statement state
//! the protocol layer reports to clients (running, waiting on a row
//! lock, completed). Wake-ups are messages on the session's own channel
//! so independent sessions never contend.

use crate::config::DbConfig;
use crate::executor::Yieldable;
use crate::txn::engine::Waiter;
use crossbeam::channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Statement state the core reports upward
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    TransactionNotStart,
    StatementRunning,
    StatementCompleted,
    Waiting,
    Retrying,
}

/// Why a statement is parked
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictType {
    None,
    Append,
    RowLock,
}

pub struct Session {
    id: u64,
    status: Mutex<SessionStatus>,
    conflict: Mutex<ConflictType>,
    current_locked_row: Mutex<Option<String>>,
    lock_timeout: Duration,
    lock_start: Mutex<Option<Instant>>,
    cancel: AtomicBool,
    yield_requested: AtomicBool,
    wake_tx: Sender<u64>,
    wake_rx: Receiver<u64>,
}

impl Session {
    pub fn new(id: u64, lock_timeout: Duration) -> Arc<Self> {
        let (wake_tx, wake_rx) = unbounded();
        Arc::new(Self {
            id,
            status: Mutex::new(SessionStatus::TransactionNotStart),
            conflict: Mutex::new(ConflictType::None),
            current_locked_row: Mutex::new(None),
            lock_timeout,
            lock_start: Mutex::new(None),
            cancel: AtomicBool::new(false),
            yield_requested: AtomicBool::new(false),
            wake_tx,
            wake_rx,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn status(&self) -> SessionStatus {
        *self.status.lock()
    }

    pub fn set_status(&self, status: SessionStatus) {
        *self.status.lock() = status;
    }

    pub fn conflict(&self) -> ConflictType {
        *self.conflict.lock()
    }

    pub fn set_conflict(&self, conflict: ConflictType) {
        *self.conflict.lock() = conflict;
    }

    /// Key of the row the session is blocked on, for diagnostics.
    pub fn current_locked_row(&self) -> Option<String> {
        self.current_locked_row.lock().clone()
    }

    pub fn set_current_locked_row(&self, row: Option<String>) {
        *self.current_locked_row.lock() = row;
    }

    pub fn lock_timeout(&self) -> Duration {
        self.lock_timeout
    }

    /// Start the lock-wait clock if it is not already running.
    pub fn begin_wait(&self) {
        let mut start = self.lock_start.lock();
        if start.is_none() {
            *start = Some(Instant::now());
        }
    }

    pub fn end_wait(&self) {
        *self.lock_start.lock() = None;
    }

    pub fn waiting_since(&self) -> Option<Instant> {
        *self.lock_start.lock()
    }

    /// Raise the per-statement cancel flag; consulted at the periodic
    /// yield check.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Acquire)
    }

    pub fn clear_cancel(&self) {
        self.cancel.store(false, Ordering::Release);
    }

    /// Ask the running statement to yield at its next check point even
    /// without a conflict.
    pub fn request_yield(&self) {
        self.yield_requested.store(true, Ordering::Release);
    }

    pub fn take_yield_request(&self) -> bool {
        self.yield_requested.swap(false, Ordering::AcqRel)
    }

    /// Handle the engine uses to wake this session when a lock holder
    /// finishes.
    pub fn waiter(&self) -> Waiter {
        Waiter {
            session_id: self.id,
            notify: self.wake_tx.clone(),
        }
    }

    pub fn wake(&self) {
        let _ = self.wake_tx.send(self.id);
    }

    /// Block until a wake-up or the timeout; true if a wake-up arrived.
    pub fn wait_for_wake(&self, timeout: Duration) -> bool {
        match self.wake_rx.recv_timeout(timeout) {
            Ok(_) => true,
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => false,
        }
    }
}

/// Drives yieldable statements over a set of sessions. Parked statements
/// are re-run on wake-up, and polled on a short interval so lock
/// timeouts fire even when no wake-up arrives.
pub struct Scheduler {
    sessions: DashMap<u64, Arc<Session>>,
    next_id: AtomicU64,
    lock_timeout: Duration,
    poll_interval: Duration,
}

impl Scheduler {
    pub fn new(config: &DbConfig) -> Arc<Self> {
        // poll fast enough that a timeout is noticed promptly
        let poll_interval = (config.lock_timeout / 4).max(Duration::from_millis(1));
        Arc::new(Self {
            sessions: DashMap::new(),
            next_id: AtomicU64::new(1),
            lock_timeout: config.lock_timeout,
            poll_interval,
        })
    }

    pub fn new_session(&self) -> Arc<Session> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let session = Session::new(id, self.lock_timeout);
        self.sessions.insert(id, session.clone());
        session
    }

    pub fn session(&self, id: u64) -> Option<Arc<Session>> {
        self.sessions.get(&id).map(|entry| entry.value().clone())
    }

    /// Run a statement to completion on the calling thread, sleeping on
    /// the session channel between suspensions.
    pub fn drive(&self, session: &Arc<Session>, statement: &mut dyn Yieldable) {
        while statement.run() {
            let _ = session.wait_for_wake(self.poll_interval);
            statement.back();
        }
    }
}
