//! Lattice Session - session pooling for the Lattice database client
//!
//! Creating a session on the service costs a round-trip, idle sessions are
//! evicted server-side unless exercised, and each client is capped in how
//! many sessions it may hold. This crate amortizes all of that:
//!
//! - `SessionPool` - Per-database pool with a warm reserve, FIFO admission
//!   at the session cap, keepalive refresh, local eviction and graceful
//!   shutdown
//! - `SessionManager` - Registry creating pools per database and driving
//!   their maintenance from a single ticker
//! - `Session` - Checkout handle that returns its session on drop

mod manager;
mod pool;
mod session;

pub use manager::SessionManager;
pub use pool::{ExhaustedBehavior, Jitter, PoolOptions, PoolStats, SessionPool};
pub use session::{Session, SessionKind};
