//! Service client trait

use std::sync::Arc;

use async_trait::async_trait;

use crate::{DatabaseId, Result, SessionHandle, TransactionId};

/// RPC surface of the Lattice service consumed by the client.
///
/// Every method maps to one service RPC. Calls are cancellable by dropping
/// the returned future. Implementations classify failures through
/// [`LatticeError::is_retryable`](crate::LatticeError::is_retryable):
/// transient transport errors come back as `Unavailable` or `Timeout`,
/// everything else is final.
#[async_trait]
pub trait ServiceClient: Send + Sync + 'static {
    /// Create a new session on the given database.
    async fn create_session(&self, database: &DatabaseId) -> Result<SessionHandle>;

    /// Delete a session. The session must not be used afterwards.
    async fn delete_session(&self, session: &SessionHandle) -> Result<()>;

    /// Execute a statement on a session.
    ///
    /// Also serves as the keepalive probe: any successful statement resets
    /// the service's idle timer for the session.
    async fn execute_sql(&self, session: &SessionHandle, sql: &str) -> Result<()>;

    /// Begin a read/write transaction on a session and return its id.
    async fn begin_transaction(&self, session: &SessionHandle) -> Result<TransactionId>;
}

#[async_trait]
impl<T: ServiceClient> ServiceClient for Arc<T> {
    async fn create_session(&self, database: &DatabaseId) -> Result<SessionHandle> {
        (**self).create_session(database).await
    }

    async fn delete_session(&self, session: &SessionHandle) -> Result<()> {
        (**self).delete_session(session).await
    }

    async fn execute_sql(&self, session: &SessionHandle, sql: &str) -> Result<()> {
        (**self).execute_sql(session, sql).await
    }

    async fn begin_transaction(&self, session: &SessionHandle) -> Result<TransactionId> {
        (**self).begin_transaction(session).await
    }
}
