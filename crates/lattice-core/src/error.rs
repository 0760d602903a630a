//! Error types for Lattice

use thiserror::Error;

/// Core error type for Lattice operations
///
/// Variants carry rendered messages rather than error sources so the type
/// stays `Clone`: the session layer stores the most recent service error and
/// surfaces it to any number of concurrent callers.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LatticeError {
    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("Cancelled")]
    Cancelled,

    #[error("Unavailable: {0}")]
    Unavailable(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Unknown error: {0}")]
    Unknown(String),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl LatticeError {
    /// Whether retrying the failed operation may succeed.
    ///
    /// Transient transport and deadline failures are worth retrying;
    /// everything else is treated as final.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LatticeError::Unavailable(_) | LatticeError::Timeout(_)
        )
    }
}

/// Result type alias for Lattice operations
pub type Result<T> = std::result::Result<T, LatticeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_errors_are_retryable() {
        assert!(LatticeError::Unavailable("backend draining".into()).is_retryable());
        assert!(LatticeError::Timeout("deadline exceeded".into()).is_retryable());
    }

    #[test]
    fn terminal_errors_are_not_retryable() {
        assert!(!LatticeError::Internal("assertion failed".into()).is_retryable());
        assert!(!LatticeError::Cancelled.is_retryable());
        assert!(!LatticeError::InvalidState("pool is shut down".into()).is_retryable());
        assert!(!LatticeError::ResourceExhausted("at capacity".into()).is_retryable());
    }
}
