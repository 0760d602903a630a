//! Pool configuration types

use std::time::Duration;

use serde::{Deserialize, Serialize};

use lattice_core::{LatticeError, Result};

/// Behavior of an acquisition that finds the pool at its session cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExhaustedBehavior {
    /// Queue the caller until a session is released.
    Block,
    /// Fail the acquisition immediately.
    Fail,
}

/// Randomization applied to a session deadline.
///
/// Spreads refresh and eviction work over time so a pool filled in one burst
/// does not probe or drop every session in the same tick. A jitter of
/// fraction `f` shrinks a delay by up to `f` of itself.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Jitter {
    fraction: f64,
}

impl Jitter {
    /// No randomization. Deadlines land exactly where the delay says;
    /// used by tests that assert exact times.
    pub const NONE: Jitter = Jitter { fraction: 0.0 };

    /// Jitter by up to `fraction` (clamped to [0, 1]) of the base delay.
    pub fn new(fraction: f64) -> Self {
        Self {
            fraction: fraction.clamp(0.0, 1.0),
        }
    }

    /// Get the jitter fraction.
    pub fn fraction(&self) -> f64 {
        self.fraction
    }

    /// Shrink `delay` by `fraction * roll` of itself, `roll` in [0, 1).
    pub fn apply(&self, delay: Duration, roll: f64) -> Duration {
        if self.fraction == 0.0 {
            return delay;
        }
        delay.mul_f64(1.0 - self.fraction * roll.clamp(0.0, 1.0))
    }
}

impl Default for Jitter {
    /// Default jitter: up to 10% of the base delay
    fn default() -> Self {
        Self { fraction: 0.1 }
    }
}

/// Configuration for a session pool
///
/// Controls pool sizing, deadlines, and acquisition behavior. Immutable
/// once a pool is constructed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolOptions {
    /// Floor for warm sessions (idle + being created)
    min_sessions: usize,
    /// Hard cap for total outstanding sessions (active + in flight + idle)
    max_sessions: usize,
    /// Maximum concurrent session-creation RPCs
    max_concurrent_creates: usize,
    /// Target fraction of the warm floor kept as read/write sessions (0..1)
    write_fraction: f64,
    /// Delay in milliseconds before an idle session must be probed to stay alive
    refresh_delay_ms: u64,
    /// Age in milliseconds at which a session is dropped locally
    eviction_delay_ms: u64,
    /// Randomization applied to refresh deadlines
    refresh_jitter: Jitter,
    /// Randomization applied to eviction deadlines
    eviction_jitter: Jitter,
    /// Cadence in milliseconds of the background maintenance tick; zero disables it
    maintenance_delay_ms: u64,
    /// Timeout in milliseconds when acquiring a session
    acquire_timeout_ms: u64,
    /// What an acquisition does when the pool is at its cap
    exhausted_behavior: ExhaustedBehavior,
}

impl PoolOptions {
    /// Create pool options with the given warm floor and session cap.
    pub fn new(min_sessions: usize, max_sessions: usize) -> Self {
        Self {
            min_sessions,
            max_sessions,
            max_concurrent_creates: 10,
            write_fraction: 0.2,
            refresh_delay_ms: 15 * 60 * 1_000,
            eviction_delay_ms: 100 * 60 * 1_000,
            refresh_jitter: Jitter::default(),
            eviction_jitter: Jitter::default(),
            maintenance_delay_ms: 30_000,
            acquire_timeout_ms: 60_000,
            exhausted_behavior: ExhaustedBehavior::Block,
        }
    }

    /// Set the maximum number of concurrent session-creation RPCs.
    pub fn with_max_concurrent_creates(mut self, limit: usize) -> Self {
        self.max_concurrent_creates = limit;
        self
    }

    /// Set the target fraction of warm sessions kept as read/write.
    pub fn with_write_fraction(mut self, fraction: f64) -> Self {
        self.write_fraction = fraction;
        self
    }

    /// Set the idle refresh delay in milliseconds.
    pub fn with_refresh_delay_ms(mut self, delay_ms: u64) -> Self {
        self.refresh_delay_ms = delay_ms;
        self
    }

    /// Set the local eviction delay in milliseconds.
    pub fn with_eviction_delay_ms(mut self, delay_ms: u64) -> Self {
        self.eviction_delay_ms = delay_ms;
        self
    }

    /// Set the refresh deadline jitter.
    pub fn with_refresh_jitter(mut self, jitter: Jitter) -> Self {
        self.refresh_jitter = jitter;
        self
    }

    /// Set the eviction deadline jitter.
    pub fn with_eviction_jitter(mut self, jitter: Jitter) -> Self {
        self.eviction_jitter = jitter;
        self
    }

    /// Set the background maintenance cadence in milliseconds. Zero disables
    /// the background tick; maintenance then only runs when driven directly.
    pub fn with_maintenance_delay_ms(mut self, delay_ms: u64) -> Self {
        self.maintenance_delay_ms = delay_ms;
        self
    }

    /// Set the acquisition timeout in milliseconds.
    pub fn with_acquire_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.acquire_timeout_ms = timeout_ms;
        self
    }

    /// Set the at-capacity acquisition behavior.
    pub fn with_exhausted_behavior(mut self, behavior: ExhaustedBehavior) -> Self {
        self.exhausted_behavior = behavior;
        self
    }

    /// Get the warm session floor.
    pub fn min_sessions(&self) -> usize {
        self.min_sessions
    }

    /// Get the total session cap.
    pub fn max_sessions(&self) -> usize {
        self.max_sessions
    }

    /// Get the creation RPC concurrency limit.
    pub fn max_concurrent_creates(&self) -> usize {
        self.max_concurrent_creates
    }

    /// Get the read/write fraction of the warm floor.
    pub fn write_fraction(&self) -> f64 {
        self.write_fraction
    }

    /// Number of read/write sessions the warm floor targets.
    pub fn write_target(&self) -> usize {
        (self.min_sessions as f64 * self.write_fraction).ceil() as usize
    }

    /// Get the idle refresh delay as a Duration.
    pub fn refresh_delay(&self) -> Duration {
        Duration::from_millis(self.refresh_delay_ms)
    }

    /// Get the local eviction delay as a Duration.
    pub fn eviction_delay(&self) -> Duration {
        Duration::from_millis(self.eviction_delay_ms)
    }

    /// Get the refresh deadline jitter.
    pub fn refresh_jitter(&self) -> Jitter {
        self.refresh_jitter
    }

    /// Get the eviction deadline jitter.
    pub fn eviction_jitter(&self) -> Jitter {
        self.eviction_jitter
    }

    /// Get the background maintenance cadence as a Duration.
    pub fn maintenance_delay(&self) -> Duration {
        Duration::from_millis(self.maintenance_delay_ms)
    }

    /// Get the acquisition timeout as a Duration.
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    /// Get the at-capacity acquisition behavior.
    pub fn exhausted_behavior(&self) -> ExhaustedBehavior {
        self.exhausted_behavior
    }

    /// Validate the options, returning an error if they are inconsistent.
    pub fn validate(&self) -> Result<()> {
        if self.max_sessions == 0 {
            return Err(LatticeError::Configuration(
                "max_sessions must be greater than 0".into(),
            ));
        }
        if self.min_sessions > self.max_sessions {
            return Err(LatticeError::Configuration(format!(
                "min_sessions ({}) cannot exceed max_sessions ({})",
                self.min_sessions, self.max_sessions
            )));
        }
        if self.max_concurrent_creates == 0 {
            return Err(LatticeError::Configuration(
                "max_concurrent_creates must be greater than 0".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.write_fraction) {
            return Err(LatticeError::Configuration(format!(
                "write_fraction ({}) must be within [0, 1]",
                self.write_fraction
            )));
        }
        if self.refresh_delay_ms > self.eviction_delay_ms {
            return Err(LatticeError::Configuration(format!(
                "refresh_delay_ms ({}) cannot exceed eviction_delay_ms ({})",
                self.refresh_delay_ms, self.eviction_delay_ms
            )));
        }
        Ok(())
    }
}

impl Default for PoolOptions {
    /// Create default pool options
    ///
    /// Defaults:
    /// - min_sessions: 10
    /// - max_sessions: 100
    /// - max_concurrent_creates: 10
    /// - write_fraction: 0.2
    /// - refresh_delay: 15 minutes
    /// - eviction_delay: 100 minutes
    /// - maintenance_delay: 30 seconds
    /// - acquire_timeout: 60 seconds
    /// - exhausted_behavior: Block
    fn default() -> Self {
        Self::new(10, 100)
    }
}
