//! Per-database session pool
//!
//! This module keeps a warm reserve of server-side sessions, caps total
//! outstanding sessions, refreshes idle sessions ahead of server-side
//! eviction and drops sessions past their local age limit.

mod options;
pub(crate) mod pool;
mod stats;
mod waiters;


pub use options::{ExhaustedBehavior, Jitter, PoolOptions};
pub use pool::SessionPool;
pub use stats::PoolStats;
