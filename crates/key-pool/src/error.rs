//! Error types for pool operations

use std::time::Duration;

/// Errors from pool construction and key acquisition.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Rejected at construction: empty key list, duplicate or blank ids,
    /// negative cooldown. Fatal to pool creation.
    #[error("invalid pool configuration: {0}")]
    Configuration(String),

    /// Every key is cooling down. Expected and recoverable; the caller decides
    /// whether to back off, queue, or fail its own request.
    #[error("all {total} keys are cooling down, next key eligible in {retry_after:?}")]
    Exhausted { total: usize, retry_after: Duration },
}

impl Error {
    /// Time until the soonest key becomes eligible, if this is an exhaustion error.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Error::Exhausted { retry_after, .. } => Some(*retry_after),
            Error::Configuration(_) => None,
        }
    }
}

/// Result alias for pool operations.
pub type Result<T> = std::result::Result<T, Error>;
