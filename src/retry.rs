//! Retry policy for outbound calls
//!
//! Retries are driven by error kind: only kinds the policy considers
//! transient are attempted again. The loop is bounded three ways: attempt
//! count, the configured overall timeout, and the caller's own deadline
//! (dropping the future cancels the loop).

use crate::error::ErrorKind;
use crate::{Backoff, FabricError, Jitter, Sleeper, TokioSleeper};
use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Clone)]
pub struct RetryPolicy {
    max_attempts: usize,
    backoff: Backoff,
    jitter: Jitter,
    should_retry: Arc<dyn Fn(&FabricError) -> bool + Send + Sync>,
    overall_timeout: Option<Duration>,
    sleeper: Arc<dyn Sleeper>,
    stats: Arc<RetryStats>,
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("backoff", &self.backoff)
            .field("jitter", &self.jitter)
            .field("overall_timeout", &self.overall_timeout)
            .finish()
    }
}

#[derive(Debug, Default)]
struct RetryStats {
    attempts: AtomicU64,
    retried_calls: AtomicU64,
    total_delay_millis: AtomicU64,
}

/// Cumulative retry counters for introspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct RetryStatsSnapshot {
    /// Individual attempts issued, including first tries
    pub attempts: u64,
    /// Calls that needed at least one retry
    pub retried_calls: u64,
    /// Total time spent sleeping between attempts, in milliseconds
    pub total_delay_millis: u64,
}

impl RetryPolicy {
    pub fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder::new()
    }

    pub fn stats(&self) -> RetryStatsSnapshot {
        RetryStatsSnapshot {
            attempts: self.stats.attempts.load(Ordering::Relaxed),
            retried_calls: self.stats.retried_calls.load(Ordering::Relaxed),
            total_delay_millis: self.stats.total_delay_millis.load(Ordering::Relaxed),
        }
    }

    pub async fn execute<T, Fut, Op>(&self, mut operation: Op) -> Result<T, FabricError>
    where
        T: Send,
        Fut: Future<Output = Result<T, FabricError>> + Send,
        Op: FnMut() -> Fut + Send,
    {
        let started = Instant::now();
        let mut retried = false;

        for attempt in 1..=self.max_attempts {
            self.stats.attempts.fetch_add(1, Ordering::Relaxed);

            let err = match operation().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if !(self.should_retry)(&err) {
                return Err(err);
            }
            if attempt == self.max_attempts {
                return Err(err);
            }
            if let Some(limit) = self.overall_timeout {
                if started.elapsed() >= limit {
                    tracing::debug!(attempt, "retry loop hit overall timeout");
                    return Err(err);
                }
            }

            let mut delay = self.jitter.apply(self.backoff.delay(attempt));
            // Jitter never undercuts the configured floor.
            if delay < self.backoff.initial() {
                delay = self.backoff.initial();
            }
            if let Some(limit) = self.overall_timeout {
                let remaining = limit.saturating_sub(started.elapsed());
                delay = delay.min(remaining);
            }

            if !retried {
                retried = true;
                self.stats.retried_calls.fetch_add(1, Ordering::Relaxed);
            }
            self.stats.total_delay_millis.fetch_add(delay.as_millis() as u64, Ordering::Relaxed);

            tracing::debug!(attempt, kind = %err.kind(), delay_ms = delay.as_millis() as u64, "retrying after failure");
            self.sleeper.sleep(delay).await;
        }

        unreachable!("retry loop returns inside the attempt loop")
    }
}

/// Errors returned when building a retry policy.
#[derive(Debug, PartialEq, Eq)]
pub enum BuildError {
    InvalidMaxAttempts(usize),
}

impl std::fmt::Display for BuildError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BuildError::InvalidMaxAttempts(n) => {
                write!(f, "max_attempts must be > 0 (got {})", n)
            }
        }
    }
}

impl std::error::Error for BuildError {}

pub struct RetryPolicyBuilder {
    max_attempts: usize,
    backoff: Backoff,
    jitter: Jitter,
    should_retry: Arc<dyn Fn(&FabricError) -> bool + Send + Sync>,
    overall_timeout: Option<Duration>,
    sleeper: Arc<dyn Sleeper>,
}

impl std::fmt::Debug for RetryPolicyBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicyBuilder")
            .field("max_attempts", &self.max_attempts)
            .field("backoff", &self.backoff)
            .field("jitter", &self.jitter)
            .field("overall_timeout", &self.overall_timeout)
            .finish_non_exhaustive()
    }
}

impl RetryPolicyBuilder {
    pub fn new() -> Self {
        Self {
            max_attempts: 3,
            backoff: Backoff::exponential(Duration::from_millis(100)),
            jitter: Jitter::Factor(0.2),
            should_retry: Arc::new(|err: &FabricError| err.is_retryable()),
            overall_timeout: Some(Duration::from_secs(10)),
            sleeper: Arc::new(TokioSleeper),
        }
    }

    pub fn max_attempts(mut self, attempts: usize) -> Result<Self, BuildError> {
        if attempts == 0 {
            return Err(BuildError::InvalidMaxAttempts(attempts));
        }
        self.max_attempts = attempts;
        Ok(self)
    }

    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = jitter;
        self
    }

    /// Retry exactly the given kinds, replacing the error-flag default.
    pub fn retry_kinds(mut self, kinds: impl IntoIterator<Item = ErrorKind>) -> Self {
        let kinds: HashSet<ErrorKind> = kinds.into_iter().collect();
        self.should_retry = Arc::new(move |err: &FabricError| kinds.contains(&err.kind()));
        self
    }

    pub fn should_retry<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&FabricError) -> bool + Send + Sync + 'static,
    {
        self.should_retry = Arc::new(predicate);
        self
    }

    /// Bound the whole retry loop; `None` leaves only attempt-count bounds.
    pub fn overall_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.overall_timeout = timeout;
        self
    }

    pub fn with_sleeper<S>(mut self, sleeper: S) -> Self
    where
        S: Sleeper + 'static,
    {
        self.sleeper = Arc::new(sleeper);
        self
    }

    pub fn build(self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            backoff: self.backoff,
            jitter: self.jitter,
            should_retry: self.should_retry,
            overall_timeout: self.overall_timeout,
            sleeper: self.sleeper,
            stats: Arc::new(RetryStats::default()),
        }
    }
}

impl Default for RetryPolicyBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{InstantSleeper, TrackingSleeper};
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn success_on_first_attempt() {
        let policy = RetryPolicy::builder().with_sleeper(InstantSleeper).build();
        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = counter.clone();

        let result = policy
            .execute(|| {
                let counter = counter_clone.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, FabricError>(42)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(policy.stats().retried_calls, 0);
    }

    #[tokio::test]
    async fn retries_transient_errors_then_succeeds() {
        let policy = RetryPolicy::builder()
            .max_attempts(5)
            .unwrap()
            .with_sleeper(InstantSleeper)
            .build();
        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = counter.clone();

        let result = policy
            .execute(|| {
                let counter = counter_clone.clone();
                async move {
                    let n = counter.fetch_add(1, Ordering::SeqCst);
                    if n < 2 {
                        Err(FabricError::network("connection refused"))
                    } else {
                        Ok(7)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
        let stats = policy.stats();
        assert_eq!(stats.attempts, 3);
        assert_eq!(stats.retried_calls, 1);
    }

    #[tokio::test]
    async fn stops_at_max_attempts_with_last_error() {
        let policy = RetryPolicy::builder()
            .max_attempts(3)
            .unwrap()
            .with_sleeper(InstantSleeper)
            .build();
        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = counter.clone();

        let result: Result<(), _> = policy
            .execute(|| {
                let counter = counter_clone.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(FabricError::network("still down"))
                }
            })
            .await;

        assert_eq!(counter.load(Ordering::SeqCst), 3);
        assert_eq!(result.unwrap_err().kind(), ErrorKind::Network);
    }

    #[tokio::test]
    async fn non_retryable_kinds_fail_fast() {
        let policy = RetryPolicy::builder()
            .max_attempts(5)
            .unwrap()
            .with_sleeper(InstantSleeper)
            .build();
        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = counter.clone();

        let result: Result<(), _> = policy
            .execute(|| {
                let counter = counter_clone.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(FabricError::validation("empty resource_id"))
                }
            })
            .await;

        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(result.unwrap_err().is_validation());
    }

    #[tokio::test]
    async fn circuit_open_is_not_retried() {
        let policy = RetryPolicy::builder()
            .max_attempts(5)
            .unwrap()
            .with_sleeper(InstantSleeper)
            .build();
        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = counter.clone();

        let result: Result<(), _> = policy
            .execute(|| {
                let counter = counter_clone.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(FabricError::circuit_open(5, Duration::from_millis(100)))
                }
            })
            .await;

        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(result.unwrap_err().is_circuit_open());
    }

    #[tokio::test]
    async fn delays_follow_backoff_within_jitter_bounds() {
        let sleeper = TrackingSleeper::new();
        let initial = Duration::from_millis(100);
        let max = Duration::from_millis(400);
        let policy = RetryPolicy::builder()
            .max_attempts(4)
            .unwrap()
            .backoff(Backoff::new(initial, 2.0, max).unwrap())
            .with_jitter(Jitter::factor(0.25).unwrap())
            .with_sleeper(sleeper.clone())
            .build();

        let _: Result<(), _> =
            policy.execute(|| async { Err(FabricError::network("down")) }).await;

        let calls = sleeper.calls();
        assert_eq!(calls.len(), 3);
        for delay in calls {
            assert!(delay >= initial, "delay {:?} below initial", delay);
            assert!(delay <= max.mul_f64(1.25), "delay {:?} above jittered max", delay);
        }
    }

    #[tokio::test]
    async fn custom_kind_set_controls_eligibility() {
        let policy = RetryPolicy::builder()
            .max_attempts(3)
            .unwrap()
            .retry_kinds([ErrorKind::System])
            .with_sleeper(InstantSleeper)
            .build();
        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = counter.clone();

        // Network is transient by default but excluded by the custom set.
        let result: Result<(), _> = policy
            .execute(|| {
                let counter = counter_clone.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(FabricError::network("down"))
                }
            })
            .await;

        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn overall_timeout_stops_the_loop() {
        let policy = RetryPolicy::builder()
            .max_attempts(100)
            .unwrap()
            .backoff(Backoff::new(Duration::from_millis(20), 1.0, Duration::from_millis(20)).unwrap())
            .with_jitter(Jitter::None)
            .overall_timeout(Some(Duration::from_millis(60)))
            .build();
        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = counter.clone();

        let result: Result<(), _> = policy
            .execute(|| {
                let counter = counter_clone.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(FabricError::network("down"))
                }
            })
            .await;

        assert!(result.is_err());
        let attempts = counter.load(Ordering::SeqCst);
        assert!(attempts < 100, "loop should stop well before max_attempts, ran {}", attempts);
    }

    #[test]
    fn zero_max_attempts_is_rejected() {
        assert_eq!(
            RetryPolicy::builder().max_attempts(0).unwrap_err(),
            BuildError::InvalidMaxAttempts(0)
        );
    }
}
