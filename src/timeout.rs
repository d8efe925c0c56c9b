//! Per-attempt deadline for outbound calls
//!
//! Wraps an async operation and converts an elapsed deadline into a
//! `Timeout`-kind fabric error. Uses `tokio::time::timeout`; on expiry the
//! inner future is dropped, so cancellation-unsafe work may leave partial
//! state behind.

use crate::FabricError;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

/// Maximum allowed timeout (30 days); guards accidental `u64::MAX`-style
/// configuration while still permitting long jobs.
pub const MAX_TIMEOUT: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Errors returned when configuring timeouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutError {
    /// Duration must be greater than zero.
    ZeroDuration,
    /// Duration exceeded the allowed maximum.
    ExceedsMaximum { requested: Duration, limit: Duration },
}

impl std::fmt::Display for TimeoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TimeoutError::ZeroDuration => write!(f, "timeout duration must be > 0"),
            TimeoutError::ExceedsMaximum { requested, limit } => {
                write!(f, "timeout duration {:?} exceeds maximum allowed {:?}", requested, limit)
            }
        }
    }
}

impl std::error::Error for TimeoutError {}

/// Policy that bounds the duration of a single attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutPolicy {
    duration: Duration,
}

impl TimeoutPolicy {
    #[must_use = "the result must be checked for validation errors"]
    pub fn new(duration: Duration) -> Result<Self, TimeoutError> {
        if duration.is_zero() {
            return Err(TimeoutError::ZeroDuration);
        }
        if duration > MAX_TIMEOUT {
            return Err(TimeoutError::ExceedsMaximum { requested: duration, limit: MAX_TIMEOUT });
        }
        Ok(Self { duration })
    }

    #[must_use]
    #[inline]
    pub fn duration(&self) -> Duration {
        self.duration
    }

    pub async fn execute<T, Fut, Op>(&self, mut operation: Op) -> Result<T, FabricError>
    where
        T: Send,
        Fut: Future<Output = Result<T, FabricError>> + Send,
        Op: FnMut() -> Fut + Send,
    {
        let started = Instant::now();
        match tokio::time::timeout(self.duration, operation()).await {
            Ok(result) => result,
            Err(_) => Err(FabricError::timeout(started.elapsed(), self.duration)),
        }
    }
}
