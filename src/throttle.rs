//! Copy throttling interface.
//!
//! The copier consults a throttler between chunks; the replica-lag
//! implementation lives with the replication tooling and is attached through
//! the component factory when a replica DSN is configured.

use async_trait::async_trait;

/// Errors from throttler setup or teardown.
#[derive(Debug, thiserror::Error)]
pub enum ThrottleError {
    /// The replica connection could not be used for lag sampling.
    #[error("replica is not usable for lag monitoring: {0}")]
    ReplicaUnusable(String),
    /// Implementation-specific failure.
    #[error("{0}")]
    Other(String),
}

/// Gates copy progress on an external signal such as replica lag.
#[async_trait]
pub trait Throttler: Send + Sync {
    /// Start any background sampling the throttler needs.
    async fn open(&self) -> Result<(), ThrottleError>;

    /// Stop sampling.
    async fn close(&self) -> Result<(), ThrottleError>;

    /// Whether the copier should hold off right now.
    fn is_throttled(&self) -> bool;
}

/// A throttler that never throttles.
#[derive(Debug, Default)]
pub struct NoopThrottler;

#[async_trait]
impl Throttler for NoopThrottler {
    async fn open(&self) -> Result<(), ThrottleError> {
        Ok(())
    }

    async fn close(&self) -> Result<(), ThrottleError> {
        Ok(())
    }

    fn is_throttled(&self) -> bool {
        false
    }
}
