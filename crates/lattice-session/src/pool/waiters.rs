//! Queue of acquirers waiting for a session
//!
//! Each waiter owns a one-shot delivery slot, so handing a session to a
//! waiter and waking it are a single atomic step. A delivery that races a
//! cancellation sees the dropped receiver and gets the session back to
//! offer to the next waiter.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::oneshot;

use lattice_core::{LatticeError, Result};

use crate::session::{SessionKind, SessionRecord};

/// One suspended acquirer.
pub(crate) struct Waiter {
    id: u64,
    kind: SessionKind,
    slot: oneshot::Sender<Result<Arc<SessionRecord>>>,
}

impl Waiter {
    /// Whether a session of the offered kind satisfies this waiter.
    ///
    /// Read-only acquirers take either flavor; read/write acquirers never
    /// downgrade to a read-only session.
    fn accepts(&self, offered: SessionKind) -> bool {
        self.kind == SessionKind::ReadOnly || offered == SessionKind::ReadWrite
    }

    /// Hand the session to the waiter. Returns the record if the waiter
    /// gave up (cancellation or timeout dropped the receiver) so the caller
    /// can offer it to the next waiter.
    pub(crate) fn deliver(
        self,
        record: Arc<SessionRecord>,
    ) -> std::result::Result<(), Arc<SessionRecord>> {
        match self.slot.send(Ok(record)) {
            Ok(()) => Ok(()),
            Err(Ok(record)) => Err(record),
            // A slot only ever carries Ok payloads through this path.
            Err(Err(_)) => Ok(()),
        }
    }

    /// Fail the waiter with the given error.
    pub(crate) fn fail(self, err: LatticeError) {
        let _ = self.slot.send(Err(err));
    }
}

/// Strict-FIFO queue of pending acquirers.
#[derive(Default)]
pub(crate) struct WaiterQueue {
    waiters: VecDeque<Waiter>,
    next_id: u64,
}

impl WaiterQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn len(&self) -> usize {
        self.waiters.len()
    }

    /// Enqueue a waiter, returning its id and the receiving half of its slot.
    pub(crate) fn push(
        &mut self,
        kind: SessionKind,
    ) -> (u64, oneshot::Receiver<Result<Arc<SessionRecord>>>) {
        let id = self.next_id;
        self.next_id += 1;
        let (slot, rx) = oneshot::channel();
        self.waiters.push_back(Waiter { id, kind, slot });
        (id, rx)
    }

    /// Remove and return the oldest waiter a session of `offered` kind
    /// satisfies.
    pub(crate) fn take_compatible(&mut self, offered: SessionKind) -> Option<Waiter> {
        let index = self.waiters.iter().position(|w| w.accepts(offered))?;
        self.waiters.remove(index)
    }

    /// Fail the oldest waiter a session of `offered` kind would have
    /// satisfied. Used when a creation attempt for that kind gives up.
    pub(crate) fn fail_oldest(&mut self, offered: SessionKind, err: LatticeError) {
        if let Some(waiter) = self.take_compatible(offered) {
            waiter.fail(err);
        }
    }

    /// Fail every waiter. Shutdown path.
    pub(crate) fn fail_all(&mut self, err: LatticeError) {
        for waiter in self.waiters.drain(..) {
            waiter.fail(err.clone());
        }
    }

    /// Drop a waiter that gave up. Idempotent: delivery may already have
    /// removed it.
    pub(crate) fn remove(&mut self, id: u64) {
        if let Some(index) = self.waiters.iter().position(|w| w.id == id) {
            self.waiters.remove(index);
        }
    }
}
