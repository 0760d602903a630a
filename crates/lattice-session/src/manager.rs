//! Session manager: per-database pool registry and maintenance ticker

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;

use lattice_core::{DatabaseId, Result, ServiceClient};

use crate::pool::{PoolOptions, PoolStats, SessionPool};
use crate::session::{Session, SessionKind};

/// Process-wide registry of session pools
///
/// Maps each database to its [`SessionPool`], creating pools lazily on first
/// use. A single background ticker drives every pool's maintenance at the
/// configured cadence; a cadence of zero disables it, for embedders and
/// tests that drive [`SessionPool::maintain`] directly.
pub struct SessionManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    client: Arc<dyn ServiceClient>,
    options: PoolOptions,
    pools: RwLock<HashMap<DatabaseId, Arc<SessionPool>>>,
    ticker: CancellationToken,
}

impl SessionManager {
    /// Create a manager sharing one service client and one set of pool
    /// options across all databases.
    ///
    /// Must be called from within a tokio runtime when the maintenance
    /// ticker is enabled.
    ///
    /// # Errors
    /// Returns `Configuration` if the options are inconsistent.
    pub fn new(client: Arc<dyn ServiceClient>, options: PoolOptions) -> Result<Self> {
        options.validate()?;
        let inner = Arc::new(ManagerInner {
            client,
            options,
            pools: RwLock::new(HashMap::new()),
            ticker: CancellationToken::new(),
        });
        if !inner.options.maintenance_delay().is_zero() {
            spawn_ticker(&inner);
        }
        Ok(Self { inner })
    }

    /// Get the pool for a database, creating it on first use.
    pub fn pool(&self, database: &DatabaseId) -> Result<Arc<SessionPool>> {
        if let Some(pool) = self.inner.pools.read().get(database) {
            return Ok(Arc::clone(pool));
        }

        let mut pools = self.inner.pools.write();
        // Racing callers may have created it while the lock was dropped.
        if let Some(pool) = pools.get(database) {
            return Ok(Arc::clone(pool));
        }
        tracing::debug!(database = %database, "creating session pool");
        let pool = Arc::new(SessionPool::new(
            Arc::clone(&self.inner.client),
            database.clone(),
            self.inner.options.clone(),
        )?);
        pools.insert(database.clone(), Arc::clone(&pool));
        Ok(pool)
    }

    /// Acquire a session on the given database.
    #[tracing::instrument(skip(self, database), fields(database = %database))]
    pub async fn acquire(&self, database: &DatabaseId, kind: SessionKind) -> Result<Session> {
        self.pool(database)?.acquire(kind).await
    }

    /// Statistics for a database's pool, if one exists.
    pub fn stats(&self, database: &DatabaseId) -> Option<PoolStats> {
        self.inner
            .pools
            .read()
            .get(database)
            .map(|pool| pool.stats())
    }

    /// Shut down the ticker and every pool, waiting for outstanding
    /// sessions to drain.
    #[tracing::instrument(skip(self))]
    pub async fn shutdown(&self) {
        self.inner.ticker.cancel();
        let pools: Vec<_> = self.inner.pools.read().values().cloned().collect();
        for pool in pools {
            pool.shutdown().await;
        }
    }
}

/// Background loop fanning maintenance ticks out to every pool.
fn spawn_ticker(inner: &Arc<ManagerInner>) {
    let weak: Weak<ManagerInner> = Arc::downgrade(inner);
    let token = inner.ticker.clone();
    let delay = inner.options.maintenance_delay();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                () = token.cancelled() => break,
                () = tokio::time::sleep(delay) => {}
            }
            let Some(inner) = weak.upgrade() else {
                break;
            };
            let pools: Vec<_> = inner.pools.read().values().cloned().collect();
            for pool in pools {
                pool.maintain();
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use lattice_core::{LatticeError, SessionHandle, TransactionId};

    use super::*;

    struct CountingClient {
        creates: AtomicUsize,
    }

    impl CountingClient {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                creates: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl ServiceClient for CountingClient {
        async fn create_session(&self, database: &DatabaseId) -> Result<SessionHandle> {
            let n = self.creates.fetch_add(1, Ordering::SeqCst);
            Ok(SessionHandle::new(format!("{database}/sessions/{n}")))
        }

        async fn delete_session(&self, _session: &SessionHandle) -> Result<()> {
            Ok(())
        }

        async fn execute_sql(&self, _session: &SessionHandle, _sql: &str) -> Result<()> {
            Ok(())
        }

        async fn begin_transaction(&self, _session: &SessionHandle) -> Result<TransactionId> {
            Ok(TransactionId::new("txn-0"))
        }
    }

    fn options() -> PoolOptions {
        PoolOptions::new(2, 10).with_maintenance_delay_ms(0)
    }

    #[tokio::test]
    async fn same_database_gets_same_pool() {
        let manager = SessionManager::new(CountingClient::new(), options()).unwrap();
        let db = DatabaseId::new("inst/db-a");
        let first = manager.pool(&db).unwrap();
        let second = manager.pool(&db).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn databases_get_distinct_pools() {
        let manager = SessionManager::new(CountingClient::new(), options()).unwrap();
        let a = manager.pool(&DatabaseId::new("inst/db-a")).unwrap();
        let b = manager.pool(&DatabaseId::new("inst/db-b")).unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn invalid_options_are_rejected() {
        let result = SessionManager::new(CountingClient::new(), PoolOptions::new(5, 0));
        assert!(matches!(result, Err(LatticeError::Configuration(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn ticker_fills_registered_pools() {
        let client = CountingClient::new();
        let manager = SessionManager::new(
            Arc::clone(&client) as Arc<dyn ServiceClient>,
            PoolOptions::new(2, 10).with_maintenance_delay_ms(1_000),
        )
        .unwrap();
        let db = DatabaseId::new("inst/db-a");
        let pool = manager.pool(&db).unwrap();

        tokio::time::sleep(Duration::from_millis(1_100)).await;
        assert_eq!(pool.stats().idle_total(), 2);
        assert_eq!(client.creates.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_delay_disables_the_ticker() {
        let client = CountingClient::new();
        let manager =
            SessionManager::new(Arc::clone(&client) as Arc<dyn ServiceClient>, options()).unwrap();
        let db = DatabaseId::new("inst/db-a");
        let pool = manager.pool(&db).unwrap();

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(pool.stats().idle_total(), 0);
        assert_eq!(client.creates.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_closes_every_pool() {
        let manager = SessionManager::new(CountingClient::new(), options()).unwrap();
        let db = DatabaseId::new("inst/db-a");
        let pool = manager.pool(&db).unwrap();
        pool.maintain();
        tokio::time::sleep(Duration::from_millis(10)).await;

        manager.shutdown().await;

        assert!(pool.stats().shutdown);
        assert_eq!(pool.stats().idle_total(), 0);
        let result = manager.acquire(&db, SessionKind::ReadOnly).await;
        assert!(matches!(result, Err(LatticeError::InvalidState(_))));
    }
}
