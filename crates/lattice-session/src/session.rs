//! Pooled session records and the checkout guard
//!
//! A `SessionRecord` is the pool's bookkeeping entry for one server-side
//! session; a `Session` is the handle callers hold while the session is
//! checked out. Dropping the handle returns the session to its pool.

use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use lattice_core::{SessionHandle, TransactionId};

use crate::pool::pool::PoolInner;

/// The flavor of a pooled session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionKind {
    /// Plain session with no prepared transaction.
    ReadOnly,
    /// Session carrying a pre-begun read/write transaction, so the first
    /// write skips one round-trip.
    ReadWrite,
}

/// Lifecycle states of a pooled session.
///
/// A session moves through these monotonically towards `Deleted`; the
/// transition table in [`SessionState::can_become`] is the authority and
/// every transition is asserted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SessionState {
    Creating,
    Idle,
    InUse,
    Refreshing,
    Evicting,
    Deleted,
}

impl SessionState {
    pub(crate) fn can_become(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Creating, Idle | InUse | Evicting)
                | (Idle, InUse | Refreshing | Evicting)
                | (InUse, Idle | Refreshing | Evicting)
                | (Refreshing, Idle | Evicting)
                | (Evicting, Deleted)
        )
    }
}

struct Deadlines {
    refresh_at: Instant,
    evict_at: Instant,
}

/// Pool-internal record for one server-side session.
pub(crate) struct SessionRecord {
    handle: SessionHandle,
    kind: SessionKind,
    transaction: Option<TransactionId>,
    deadlines: Mutex<Deadlines>,
    /// Timestamp of the caller's own most recent successful statement,
    /// reported through [`Session::note_exercised`]. Consumed at release to
    /// reset the refresh deadline without an extra probe.
    last_exercised: Mutex<Option<Instant>>,
    state: Mutex<SessionState>,
}

impl SessionRecord {
    pub(crate) fn new(
        handle: SessionHandle,
        kind: SessionKind,
        transaction: Option<TransactionId>,
        refresh_at: Instant,
        evict_at: Instant,
    ) -> Self {
        Self {
            handle,
            kind,
            transaction,
            deadlines: Mutex::new(Deadlines {
                refresh_at: refresh_at.min(evict_at),
                evict_at,
            }),
            last_exercised: Mutex::new(None),
            state: Mutex::new(SessionState::Creating),
        }
    }

    pub(crate) fn handle(&self) -> &SessionHandle {
        &self.handle
    }

    pub(crate) fn name(&self) -> &str {
        self.handle.name()
    }

    pub(crate) fn kind(&self) -> SessionKind {
        self.kind
    }

    pub(crate) fn transaction(&self) -> Option<&TransactionId> {
        self.transaction.as_ref()
    }

    pub(crate) fn refresh_at(&self) -> Instant {
        self.deadlines.lock().refresh_at
    }

    pub(crate) fn evict_at(&self) -> Instant {
        self.deadlines.lock().evict_at
    }

    /// Move the refresh deadline. The deadline never extends past the
    /// eviction deadline.
    pub(crate) fn reset_refresh_at(&self, at: Instant) {
        let mut deadlines = self.deadlines.lock();
        deadlines.refresh_at = at.min(deadlines.evict_at);
    }

    pub(crate) fn note_exercised(&self, at: Instant) {
        *self.last_exercised.lock() = Some(at);
    }

    pub(crate) fn take_exercised(&self) -> Option<Instant> {
        self.last_exercised.lock().take()
    }

    #[cfg(test)]
    pub(crate) fn state(&self) -> SessionState {
        *self.state.lock()
    }

    pub(crate) fn set_state(&self, next: SessionState) {
        let mut state = self.state.lock();
        assert!(
            state.can_become(next),
            "illegal session transition {:?} -> {:?} for {}",
            *state,
            next,
            self.handle.name()
        );
        *state = next;
    }
}

impl fmt::Debug for SessionRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionRecord")
            .field("name", &self.handle.name())
            .field("kind", &self.kind)
            .field("state", &*self.state.lock())
            .finish_non_exhaustive()
    }
}

/// A session checked out of a pool.
///
/// Dropping the handle returns the session to its pool, which re-queues it,
/// refreshes it, or deletes it depending on its deadlines. Use
/// [`Session::discard`] to force deletion instead of reuse.
pub struct Session {
    record: Option<Arc<SessionRecord>>,
    pool: Weak<PoolInner>,
    force_delete: bool,
}

impl Session {
    pub(crate) fn new(record: Arc<SessionRecord>, pool: Weak<PoolInner>) -> Self {
        Self {
            record: Some(record),
            pool,
            force_delete: false,
        }
    }

    pub(crate) fn record(&self) -> &Arc<SessionRecord> {
        self.record.as_ref().expect("record taken")
    }

    /// The server-assigned session name.
    pub fn name(&self) -> &str {
        self.record().name()
    }

    /// The session flavor.
    ///
    /// A read-only acquisition may be satisfied by a `ReadWrite` session;
    /// its prepared transaction simply goes unused.
    pub fn kind(&self) -> SessionKind {
        self.record().kind()
    }

    /// The pre-begun transaction id, present iff the session is `ReadWrite`.
    pub fn transaction(&self) -> Option<&TransactionId> {
        self.record().transaction()
    }

    /// Tell the pool the caller ran its own successful statement at `at`.
    ///
    /// The service's idle timer restarted at that moment, so release can
    /// push the refresh deadline forward without issuing a probe of its own.
    pub fn note_exercised(&self, at: Instant) {
        self.record().note_exercised(at);
    }

    /// Release the session and have the pool delete it instead of reusing it.
    pub fn discard(mut self) {
        self.force_delete = true;
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("name", &self.name())
            .field("kind", &self.kind())
            .finish_non_exhaustive()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let Some(record) = self.record.take() else {
            return;
        };
        if let Some(pool) = self.pool.upgrade() {
            PoolInner::release(&pool, record, self.force_delete);
        }
        // Pool already gone: the record is dropped with it.
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn record() -> SessionRecord {
        let now = Instant::now();
        SessionRecord::new(
            SessionHandle::new("db/sessions/0"),
            SessionKind::ReadOnly,
            None,
            now + Duration::from_secs(60),
            now + Duration::from_secs(600),
        )
    }

    #[test]
    fn lifecycle_follows_the_transition_table() {
        let record = record();
        assert_eq!(record.state(), SessionState::Creating);
        record.set_state(SessionState::Idle);
        record.set_state(SessionState::InUse);
        record.set_state(SessionState::Refreshing);
        record.set_state(SessionState::Idle);
        record.set_state(SessionState::Evicting);
        record.set_state(SessionState::Deleted);
    }

    #[test]
    #[should_panic(expected = "illegal session transition")]
    fn deleted_is_terminal() {
        let record = record();
        record.set_state(SessionState::Evicting);
        record.set_state(SessionState::Deleted);
        record.set_state(SessionState::Idle);
    }

    #[test]
    #[should_panic(expected = "illegal session transition")]
    fn idle_cannot_jump_to_deleted() {
        let record = record();
        record.set_state(SessionState::Idle);
        record.set_state(SessionState::Deleted);
    }

    #[test]
    fn refresh_deadline_is_clamped_to_eviction() {
        let record = record();
        let far = Instant::now() + Duration::from_secs(7_200);
        record.reset_refresh_at(far);
        assert_eq!(record.refresh_at(), record.evict_at());
        assert!(record.refresh_at() <= record.evict_at());
    }

    #[test]
    fn exercised_timestamp_is_consumed_once() {
        let record = record();
        let at = Instant::now();
        record.note_exercised(at);
        assert_eq!(record.take_exercised(), Some(at));
        assert_eq!(record.take_exercised(), None);
    }
}
