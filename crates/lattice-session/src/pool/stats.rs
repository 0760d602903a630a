//! Pool statistics types

use serde::{Deserialize, Serialize};

/// Snapshot of a session pool's current state
///
/// Taken atomically under the pool lock and returned by value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    /// Number of sessions currently checked out
    pub active: usize,
    /// Number of creation requests in flight
    pub in_flight: usize,
    /// Idle read-only sessions available in the pool
    pub idle_read: usize,
    /// Idle read/write sessions available in the pool
    pub idle_write: usize,
    /// Number of acquirers queued for a session
    pub waiting: usize,
    /// Whether the pool has been shut down
    pub shutdown: bool,
    /// Total sessions ever created by this pool
    pub sessions_created: u64,
    /// Total sessions ever deleted by this pool
    pub sessions_deleted: u64,
}

impl PoolStats {
    /// Total idle sessions across both flavors.
    pub fn idle_total(&self) -> usize {
        self.idle_read + self.idle_write
    }

    /// Total outstanding sessions: checked out, being created, or idle.
    pub fn total(&self) -> usize {
        self.active + self.in_flight + self.idle_total()
    }

    /// Check if the pool has no reusable capacity left for the given cap.
    pub fn is_full(&self, max_sessions: usize) -> bool {
        self.total() >= max_sessions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn totals_add_up() {
        let stats = PoolStats {
            active: 4,
            in_flight: 2,
            idle_read: 3,
            idle_write: 1,
            ..Default::default()
        };
        assert_eq!(stats.idle_total(), 4);
        assert_eq!(stats.total(), 10);
        assert!(stats.is_full(10));
        assert!(!stats.is_full(11));
    }

    #[test]
    fn snapshot_round_trips_through_serde() {
        let stats = PoolStats {
            active: 1,
            idle_read: 2,
            sessions_created: 7,
            ..Default::default()
        };
        let json = serde_json::to_string(&stats).expect("serialize");
        let back: PoolStats = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(stats, back);
    }
}
