//! Session pool implementation

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{watch, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use lattice_core::{DatabaseId, LatticeError, Result, ServiceClient};

use crate::session::{Session, SessionKind, SessionRecord, SessionState};

use super::options::{ExhaustedBehavior, PoolOptions};
use super::stats::PoolStats;
use super::waiters::WaiterQueue;

/// Statement used to exercise an idle session so the service keeps it alive.
const KEEPALIVE_SQL: &str = "SELECT 1";

/// Cadence at which shutdown re-checks for outstanding sessions.
const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Creation attempts before the worker gives up and reports the pool
/// unhealthy.
const CREATE_ATTEMPTS: u32 = 3;

/// Pause before the first creation retry; doubles per attempt up to
/// [`CREATE_RETRY_CAP`].
const CREATE_RETRY_INITIAL: Duration = Duration::from_millis(100);

/// Ceiling for creation retry pauses.
const CREATE_RETRY_CAP: Duration = Duration::from_secs(10);

/// Pause before retry number `attempt` (zero-based) of a failed creation.
pub(super) fn create_retry_delay(attempt: u32) -> Duration {
    let factor = 1u32 << attempt.min(10);
    (CREATE_RETRY_INITIAL * factor).min(CREATE_RETRY_CAP)
}

/// Clock-seeded roll in [0, 1) feeding deadline jitter.
fn jitter_roll() -> f64 {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    ((nanos >> 10) & 0x3ff) as f64 / 1024.0
}

/// All mutable pool bookkeeping, guarded by a single mutex.
///
/// RPCs never run while this lock is held; workers re-acquire it to record
/// their results and must tolerate any transition (including shutdown)
/// having happened in between.
struct PoolState {
    idle_read: VecDeque<Arc<SessionRecord>>,
    idle_write: VecDeque<Arc<SessionRecord>>,
    active: usize,
    in_flight: usize,
    in_flight_write: usize,
    /// Idle sessions temporarily out of the queues for a keepalive probe.
    refreshing: usize,
    waiters: WaiterQueue,
    healthy: bool,
    last_error: Option<LatticeError>,
    shutdown: bool,
    sessions_created: u64,
    sessions_deleted: u64,
}

impl PoolState {
    fn idle_total(&self) -> usize {
        self.idle_read.len() + self.idle_write.len()
    }

    /// Everything counting against the session cap.
    fn total(&self) -> usize {
        self.active + self.in_flight + self.refreshing + self.idle_total()
    }

    /// Oldest-first checkout. Read-only acquirers fall back to a read/write
    /// session (its prepared transaction goes unused); read/write acquirers
    /// never downgrade.
    fn pop_idle(&mut self, kind: SessionKind) -> Option<Arc<SessionRecord>> {
        match kind {
            SessionKind::ReadWrite => self.idle_write.pop_front(),
            SessionKind::ReadOnly => self
                .idle_read
                .pop_front()
                .or_else(|| self.idle_write.pop_front()),
        }
    }

    fn park(&mut self, record: Arc<SessionRecord>) {
        match record.kind() {
            SessionKind::ReadOnly => self.idle_read.push_back(record),
            SessionKind::ReadWrite => self.idle_write.push_back(record),
        }
    }

    fn count_creation(&mut self, kind: SessionKind) {
        self.in_flight += 1;
        if kind == SessionKind::ReadWrite {
            self.in_flight_write += 1;
        }
    }

    fn uncount_creation(&mut self, kind: SessionKind) {
        self.in_flight -= 1;
        if kind == SessionKind::ReadWrite {
            self.in_flight_write -= 1;
        }
    }
}

pub(crate) struct PoolInner {
    client: Arc<dyn ServiceClient>,
    database: DatabaseId,
    options: PoolOptions,
    state: Mutex<PoolState>,
    /// Caps concurrent creation and keepalive RPCs.
    rpc_limit: Semaphore,
    /// Bumped on every state change; wakes `wait_until_ready` watchers.
    changed: watch::Sender<()>,
    /// Cancelled at shutdown to abort creation retry loops.
    shutdown_token: CancellationToken,
}

/// A session pool for one target database
///
/// Hands out server-side sessions, keeping a warm reserve so callers almost
/// never pay session-creation latency. Checked-out sessions return to the
/// pool when their [`Session`] handle is dropped.
///
/// Cloning the pool is cheap and clones share all state.
pub struct SessionPool {
    inner: Arc<PoolInner>,
}

impl Clone for SessionPool {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl std::fmt::Debug for SessionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stats = self.stats();
        f.debug_struct("SessionPool")
            .field("database", &self.inner.database)
            .field("stats", &stats)
            .finish_non_exhaustive()
    }
}

enum Wait {
    Delivered(Result<Arc<SessionRecord>>),
    Cancelled,
    TimedOut,
}

impl SessionPool {
    /// Create a pool for the given database.
    ///
    /// # Errors
    /// Returns `Configuration` if the options are inconsistent.
    pub fn new(
        client: Arc<dyn ServiceClient>,
        database: DatabaseId,
        options: PoolOptions,
    ) -> Result<Self> {
        options.validate()?;

        tracing::debug!(
            database = %database,
            min_sessions = options.min_sessions(),
            max_sessions = options.max_sessions(),
            "created session pool"
        );

        let (changed, _) = watch::channel(());
        Ok(Self {
            inner: Arc::new(PoolInner {
                rpc_limit: Semaphore::new(options.max_concurrent_creates()),
                client,
                database,
                options,
                state: Mutex::new(PoolState {
                    idle_read: VecDeque::new(),
                    idle_write: VecDeque::new(),
                    active: 0,
                    in_flight: 0,
                    in_flight_write: 0,
                    refreshing: 0,
                    waiters: WaiterQueue::new(),
                    healthy: true,
                    last_error: None,
                    shutdown: false,
                    sessions_created: 0,
                    sessions_deleted: 0,
                }),
                changed,
                shutdown_token: CancellationToken::new(),
            }),
        })
    }

    /// The database this pool serves.
    pub fn database(&self) -> &DatabaseId {
        &self.inner.database
    }

    /// The options this pool was built with.
    pub fn options(&self) -> &PoolOptions {
        &self.inner.options
    }

    /// Acquire a session, creating one if the pool has room.
    ///
    /// Equivalent to [`SessionPool::acquire_with`] with a token that never
    /// fires.
    pub async fn acquire(&self, kind: SessionKind) -> Result<Session> {
        self.acquire_with(kind, &CancellationToken::new()).await
    }

    /// Acquire a session, honoring an external cancellation token.
    ///
    /// Fast path: an idle session of a compatible flavor is checked out
    /// immediately. Otherwise the caller queues FIFO behind earlier
    /// acquirers; if the session cap leaves room, a creation request is
    /// started on its behalf. Fails with `InvalidState` after shutdown,
    /// `Cancelled` if the token fires, and `ResourceExhausted` on timeout or
    /// when the pool is at its cap under the `Fail` policy.
    pub async fn acquire_with(
        &self,
        kind: SessionKind,
        cancel: &CancellationToken,
    ) -> Result<Session> {
        let deadline = Instant::now() + self.inner.options.acquire_timeout();

        let (waiter_id, mut rx) = {
            let mut state = self.inner.state.lock();
            if state.shutdown {
                return Err(LatticeError::InvalidState(
                    "session pool is shut down".into(),
                ));
            }

            loop {
                let Some(record) = state.pop_idle(kind) else {
                    break;
                };
                // An idle session may have aged out since the last
                // maintenance tick.
                if Instant::now() >= record.evict_at() {
                    PoolInner::schedule_delete(
                        &self.inner,
                        &mut state,
                        record,
                        "past eviction deadline",
                    );
                    continue;
                }
                record.set_state(SessionState::InUse);
                state.active += 1;
                return Ok(Session::new(record, Arc::downgrade(&self.inner)));
            }

            if state.total() < self.inner.options.max_sessions() {
                let slot = state.waiters.push(kind);
                state.count_creation(kind);
                PoolInner::spawn_create(&self.inner, kind);
                slot
            } else if self.inner.options.exhausted_behavior() == ExhaustedBehavior::Fail {
                return Err(LatticeError::ResourceExhausted(format!(
                    "session pool for {} is at capacity ({})",
                    self.inner.database,
                    self.inner.options.max_sessions()
                )));
            } else {
                state.waiters.push(kind)
            }
        };

        let wait = tokio::select! {
            delivered = &mut rx => match delivered {
                Ok(result) => Wait::Delivered(result),
                Err(_) => Wait::Delivered(Err(LatticeError::Cancelled)),
            },
            () = cancel.cancelled() => Wait::Cancelled,
            () = tokio::time::sleep_until(deadline) => Wait::TimedOut,
        };

        match wait {
            Wait::Delivered(Ok(record)) => Ok(Session::new(record, Arc::downgrade(&self.inner))),
            Wait::Delivered(Err(err)) => Err(err),
            Wait::Cancelled | Wait::TimedOut => {
                self.inner.state.lock().waiters.remove(waiter_id);
                // A delivery may have won the race against the removal. The
                // session is already counted active, so route it back
                // through the regular release path.
                if let Ok(Ok(record)) = rx.try_recv() {
                    drop(Session::new(record, Arc::downgrade(&self.inner)));
                }
                if matches!(wait, Wait::Cancelled) {
                    Err(LatticeError::Cancelled)
                } else {
                    Err(LatticeError::ResourceExhausted(format!(
                        "timed out after {:?} waiting for a session",
                        self.inner.options.acquire_timeout()
                    )))
                }
            }
        }
    }

    /// Release a session back to the pool.
    ///
    /// Dropping the [`Session`] handle does the same with
    /// `force_delete = false`.
    pub fn release(&self, session: Session, force_delete: bool) {
        if force_delete {
            session.discard();
        }
        // Otherwise the drop impl returns it.
    }

    /// Wait until the warm reserve is filled to its configured floor.
    ///
    /// Returns immediately once the pool holds `min_sessions` idle sessions
    /// with the configured share of read/write sessions among them. Fails
    /// with the most recent creation error while the pool is unhealthy, and
    /// with `Cancelled` on shutdown or external cancellation. Callers use
    /// this to fail fast on backends that cannot produce sessions.
    pub async fn wait_until_ready(&self, cancel: &CancellationToken) -> Result<()> {
        let mut changed_rx = self.inner.changed.subscribe();
        loop {
            {
                let state = self.inner.state.lock();
                if state.shutdown {
                    return Err(LatticeError::Cancelled);
                }
                if state.idle_total() >= self.inner.options.min_sessions()
                    && state.idle_write.len() >= self.inner.options.write_target()
                {
                    return Ok(());
                }
                if !state.healthy {
                    return Err(state.last_error.clone().unwrap_or_else(|| {
                        LatticeError::Unknown("session pool is unhealthy".into())
                    }));
                }
            }
            tokio::select! {
                changed = changed_rx.changed() => {
                    if changed.is_err() {
                        return Err(LatticeError::Cancelled);
                    }
                }
                () = cancel.cancelled() => return Err(LatticeError::Cancelled),
            }
        }
    }

    /// Run one maintenance tick: top the warm reserve up to its floor,
    /// probe idle sessions whose refresh deadline passed, and drop idle
    /// sessions past their eviction deadline.
    ///
    /// Driven by the manager's background ticker, or called directly by
    /// tests and embedders that disabled it.
    pub fn maintain(&self) {
        let now = Instant::now();
        let inner = &self.inner;
        let mut state = inner.state.lock();
        if state.shutdown {
            return;
        }

        // Fill towards the floor, biased to read/write sessions until the
        // configured share is warm.
        let write_target = inner.options.write_target();
        while state.idle_total() + state.refreshing + state.in_flight
            < inner.options.min_sessions()
            && state.total() < inner.options.max_sessions()
            && state.in_flight < inner.options.max_concurrent_creates()
        {
            let kind = if state.idle_write.len() + state.in_flight_write < write_target {
                SessionKind::ReadWrite
            } else {
                SessionKind::ReadOnly
            };
            state.count_creation(kind);
            PoolInner::spawn_create(inner, kind);
        }

        // Probe idle sessions nearing the service's idle limit.
        let stale = drain_idle(&mut state, |record| {
            now >= record.refresh_at() && now < record.evict_at()
        });
        for record in stale {
            record.set_state(SessionState::Refreshing);
            state.refreshing += 1;
            Arc::clone(inner).spawn_refresh(record);
        }

        // Drop idle sessions past their local age limit; the next tick's
        // fill replaces them.
        let expired = drain_idle(&mut state, |record| now >= record.evict_at());
        for record in expired {
            PoolInner::schedule_delete(inner, &mut state, record, "past eviction deadline");
        }
    }

    /// Shut the pool down and wait for outstanding sessions to drain.
    ///
    /// Idle sessions are deleted immediately; queued acquirers fail with
    /// `Cancelled`; subsequent acquisitions fail with `InvalidState`.
    /// Completes once every checked-out session has been released and every
    /// in-flight creation has landed. Idempotent.
    pub async fn shutdown(&self) {
        {
            let mut state = self.inner.state.lock();
            if !state.shutdown {
                tracing::info!(database = %self.inner.database, "shutting down session pool");
                state.shutdown = true;
                state.waiters.fail_all(LatticeError::Cancelled);
                let mut idle: Vec<_> = state.idle_read.drain(..).collect();
                idle.extend(state.idle_write.drain(..));
                for record in idle {
                    PoolInner::schedule_delete(&self.inner, &mut state, record, "pool shut down");
                }
                self.inner.shutdown_token.cancel();
                self.inner.notify();
            }
        }

        loop {
            {
                let state = self.inner.state.lock();
                if state.active == 0 && state.in_flight == 0 && state.refreshing == 0 {
                    return;
                }
            }
            // Checked-out sessions released after shutdown drive progress;
            // poll for them at a bounded cadence.
            tokio::time::sleep(SHUTDOWN_POLL_INTERVAL).await;
        }
    }

    /// Whether the most recent creation attempt succeeded.
    pub fn is_healthy(&self) -> bool {
        self.inner.state.lock().healthy
    }

    /// Get current pool statistics.
    pub fn stats(&self) -> PoolStats {
        let state = self.inner.state.lock();
        PoolStats {
            active: state.active,
            in_flight: state.in_flight,
            idle_read: state.idle_read.len(),
            idle_write: state.idle_write.len(),
            waiting: state.waiters.len(),
            shutdown: state.shutdown,
            sessions_created: state.sessions_created,
            sessions_deleted: state.sessions_deleted,
        }
    }
}

impl PoolInner {
    fn notify(&self) {
        self.changed.send_replace(());
    }

    /// Return a checked-out session to the pool. Called exactly once per
    /// checkout, from the guard's drop.
    pub(crate) fn release(inner: &Arc<PoolInner>, record: Arc<SessionRecord>, force_delete: bool) {
        let mut state = inner.state.lock();
        state.active -= 1;

        // The caller's own statements restarted the service's idle timer;
        // push the refresh deadline out from the last one instead of
        // probing again.
        if let Some(at) = record.take_exercised() {
            let delay = inner
                .options
                .refresh_jitter()
                .apply(inner.options.refresh_delay(), jitter_roll());
            record.reset_refresh_at(at + delay);
        }

        let now = Instant::now();
        if state.shutdown || force_delete || now >= record.evict_at() {
            let reason = if state.shutdown {
                "pool shut down"
            } else if force_delete {
                "discarded by caller"
            } else {
                "past eviction deadline"
            };
            Self::schedule_delete(inner, &mut state, record, reason);
        } else if now >= record.refresh_at() {
            record.set_state(SessionState::Refreshing);
            state.refreshing += 1;
            drop(state);
            Arc::clone(inner).spawn_refresh(record);
        } else {
            record.set_state(SessionState::Idle);
            Self::deliver_or_park(inner, &mut state, record);
        }
    }

    /// Hand an idle session to the oldest compatible waiter, or park it in
    /// its idle queue. Expects the record in the `Idle` state; after
    /// shutdown the session is deleted instead.
    fn deliver_or_park(
        inner: &Arc<PoolInner>,
        state: &mut PoolState,
        record: Arc<SessionRecord>,
    ) {
        if state.shutdown {
            Self::schedule_delete(inner, state, record, "pool shut down");
            return;
        }

        let mut record = record;
        while let Some(waiter) = state.waiters.take_compatible(record.kind()) {
            record.set_state(SessionState::InUse);
            state.active += 1;
            match waiter.deliver(record) {
                Ok(()) => {
                    inner.notify();
                    return;
                }
                Err(returned) => {
                    // The waiter cancelled between delivery and its queue
                    // removal; undo and offer to the next one.
                    state.active -= 1;
                    returned.set_state(SessionState::Idle);
                    record = returned;
                }
            }
        }
        state.park(record);
        inner.notify();
    }

    /// Start a creation request. The caller holds the state lock and has
    /// already counted the request in `in_flight`.
    fn spawn_create(inner: &Arc<PoolInner>, kind: SessionKind) {
        let inner = Arc::clone(inner);
        tokio::spawn(async move {
            let result = inner.create_session(kind).await;
            let mut state = inner.state.lock();
            state.uncount_creation(kind);
            match result {
                Ok(record) => {
                    state.sessions_created += 1;
                    state.healthy = true;
                    state.last_error = None;
                    record.set_state(SessionState::Idle);
                    Self::deliver_or_park(&inner, &mut state, record);
                }
                Err(_) if state.shutdown => {
                    // Worker aborted by shutdown; waiters were already
                    // failed when the flag was set.
                    inner.notify();
                }
                Err(err) => {
                    tracing::warn!(
                        database = %inner.database,
                        error = %err,
                        "session creation failed"
                    );
                    state.healthy = false;
                    state.last_error = Some(err.clone());
                    state.waiters.fail_oldest(kind, err);
                    inner.notify();
                }
            }
        });
    }

    /// Create one session, retrying transient failures with backoff within
    /// a bounded window.
    async fn create_session(&self, kind: SessionKind) -> Result<Arc<SessionRecord>> {
        let _permit = self
            .rpc_limit
            .acquire()
            .await
            .map_err(|_| LatticeError::Cancelled)?;

        let mut attempt = 0;
        loop {
            if self.shutdown_token.is_cancelled() {
                return Err(LatticeError::Cancelled);
            }
            match self.try_create(kind).await {
                Ok(record) => return Ok(record),
                Err(err) if err.is_retryable() && attempt + 1 < CREATE_ATTEMPTS => {
                    tracing::debug!(
                        database = %self.database,
                        error = %err,
                        attempt,
                        "retrying session creation"
                    );
                    tokio::select! {
                        () = tokio::time::sleep(create_retry_delay(attempt)) => {}
                        () = self.shutdown_token.cancelled() => {
                            return Err(LatticeError::Cancelled);
                        }
                    }
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn try_create(&self, kind: SessionKind) -> Result<Arc<SessionRecord>> {
        let handle = self.client.create_session(&self.database).await?;

        let transaction = match kind {
            SessionKind::ReadOnly => None,
            SessionKind::ReadWrite => match self.client.begin_transaction(&handle).await {
                Ok(transaction) => Some(transaction),
                Err(err) => {
                    // The session exists server-side; don't leak it.
                    let client = Arc::clone(&self.client);
                    let orphan = handle.clone();
                    tokio::spawn(async move {
                        if let Err(delete_err) = client.delete_session(&orphan).await {
                            tracing::warn!(
                                session = orphan.name(),
                                error = %delete_err,
                                "failed to delete session after begin_transaction failure"
                            );
                        }
                    });
                    return Err(err);
                }
            },
        };

        let now = Instant::now();
        let evict_at = now
            + self
                .options
                .eviction_jitter()
                .apply(self.options.eviction_delay(), jitter_roll());
        let refresh_at = now
            + self
                .options
                .refresh_jitter()
                .apply(self.options.refresh_delay(), jitter_roll());
        Ok(Arc::new(SessionRecord::new(
            handle,
            kind,
            transaction,
            refresh_at,
            evict_at,
        )))
    }

    /// Probe an idle session to reset the service's idle timer. The record
    /// is in the `Refreshing` state and counted in `refreshing`.
    fn spawn_refresh(self: Arc<Self>, record: Arc<SessionRecord>) {
        tokio::spawn(async move {
            let _permit = self.rpc_limit.acquire().await.ok();
            let result = self.client.execute_sql(record.handle(), KEEPALIVE_SQL).await;

            let mut state = self.state.lock();
            state.refreshing -= 1;
            match result {
                Ok(()) => {
                    let delay = self
                        .options
                        .refresh_jitter()
                        .apply(self.options.refresh_delay(), jitter_roll());
                    record.reset_refresh_at(Instant::now() + delay);
                    record.set_state(SessionState::Idle);
                    Self::deliver_or_park(&self, &mut state, record);
                }
                Err(err) => {
                    tracing::debug!(
                        session = record.name(),
                        error = %err,
                        "keepalive probe failed"
                    );
                    Self::schedule_delete(&self, &mut state, record, "keepalive probe failed");
                }
            }
        });
    }

    /// Schedule a best-effort delete RPC. The session is accounted deleted
    /// locally before the RPC lands; a failed delete is only logged.
    fn schedule_delete(
        inner: &Arc<PoolInner>,
        state: &mut PoolState,
        record: Arc<SessionRecord>,
        reason: &'static str,
    ) {
        record.set_state(SessionState::Evicting);
        state.sessions_deleted += 1;
        inner.notify();

        let inner = Arc::clone(inner);
        tokio::spawn(async move {
            if let Err(err) = inner.client.delete_session(record.handle()).await {
                tracing::warn!(
                    session = record.name(),
                    error = %err,
                    reason,
                    "failed to delete session"
                );
            }
            record.set_state(SessionState::Deleted);
        });
    }
}

/// Pull every idle session matching the predicate out of both queues,
/// preserving order among the kept ones.
fn drain_idle(
    state: &mut PoolState,
    predicate: impl Fn(&SessionRecord) -> bool,
) -> Vec<Arc<SessionRecord>> {
    let mut drained = Vec::new();
    for queue in [&mut state.idle_read, &mut state.idle_write] {
        let mut kept = VecDeque::with_capacity(queue.len());
        while let Some(record) = queue.pop_front() {
            if predicate(&record) {
                drained.push(record);
            } else {
                kept.push_back(record);
            }
        }
        *queue = kept;
    }
    drained
}
