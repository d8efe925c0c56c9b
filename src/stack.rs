//! Composition of the resilience layers for one RPC target
//!
//! Execution order is `retry(circuit_breaker(timeout(call)))`, the
//! classifier annotating errors at the boundary and the fallback consulted
//! only after the retry loop has given up. Circuit-open rejections are never
//! retried, so an open circuit fails fast without touching the callee.

use crate::fallback::{FallbackPolicy, Fingerprint};
use crate::{
    CircuitBreakerConfig, CircuitBreakerPolicy, CircuitBreakerSnapshot, FabricError, RetryPolicy,
    RetryStatsSnapshot, TimeoutError, TimeoutPolicy,
};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Applied to every attempt even when the caller did not set a deadline.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(5);

/// Per-target stats for the gateway's introspection surface.
#[derive(Debug, Clone, serde::Serialize)]
pub struct StackStats {
    pub service: String,
    pub circuit_breaker: Option<CircuitBreakerSnapshot>,
    pub retry: Option<RetryStatsSnapshot>,
}

/// Resilience layers wrapping every call to one target service.
#[derive(Debug, Clone)]
pub struct ResilienceStack {
    service: String,
    timeout: Option<TimeoutPolicy>,
    circuit_breaker: Option<CircuitBreakerPolicy>,
    retry: Option<RetryPolicy>,
}

impl ResilienceStack {
    pub fn builder(service: impl Into<String>) -> ResilienceStackBuilder {
        ResilienceStackBuilder::new(service)
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn stats(&self) -> StackStats {
        StackStats {
            service: self.service.clone(),
            circuit_breaker: self.circuit_breaker.as_ref().map(|cb| cb.snapshot()),
            retry: self.retry.as_ref().map(|r| r.stats()),
        }
    }

    /// Run an operation through the configured layers. Errors come back
    /// annotated with the target service and method.
    pub async fn execute<T, Fut, Op>(&self, method: &str, operation: Op) -> Result<T, FabricError>
    where
        T: Send,
        Fut: Future<Output = Result<T, FabricError>> + Send,
        Op: FnMut() -> Fut + Send,
    {
        let op_cell = Arc::new(Mutex::new(operation));

        let attempt = || {
            let op = op_cell.clone();
            let breaker = self.circuit_breaker.clone();
            let timeout = self.timeout;
            async move {
                let run = move || {
                    let op = op.clone();
                    async move {
                        match timeout {
                            Some(deadline) => {
                                deadline
                                    .execute(|| {
                                        let mut guard = op
                                            .lock()
                                            .unwrap_or_else(|poisoned| poisoned.into_inner());
                                        (*guard)()
                                    })
                                    .await
                            }
                            None => {
                                // The guard must drop before the await.
                                let fut = {
                                    let mut guard = op
                                        .lock()
                                        .unwrap_or_else(|poisoned| poisoned.into_inner());
                                    (*guard)()
                                };
                                fut.await
                            }
                        }
                    }
                };
                match breaker {
                    Some(breaker) => breaker.execute(run).await,
                    None => run().await,
                }
            }
        };

        let result = match &self.retry {
            Some(retry) => retry.execute(attempt).await,
            None => attempt().await,
        };

        result.map_err(|err| err.with_target(&self.service, method))
    }

    /// Like [`execute`](Self::execute), consulting the fallback policy when
    /// the layered call fails for good. Successful responses are written
    /// through to the fallback cache.
    pub async fn execute_with_fallback<T, Fut, Op>(
        &self,
        method: &str,
        fingerprint: Fingerprint,
        fallback: &FallbackPolicy<T>,
        operation: Op,
    ) -> Result<T, FabricError>
    where
        T: Clone + Send + Sync + 'static,
        Fut: Future<Output = Result<T, FabricError>> + Send,
        Op: FnMut() -> Fut + Send,
    {
        let started = Instant::now();
        match self.execute(method, operation).await {
            Ok(value) => {
                fallback.record_success(&fingerprint, &value);
                Ok(value)
            }
            Err(err) => fallback.resolve(&fingerprint, err, started.elapsed()).await,
        }
    }
}

pub struct ResilienceStackBuilder {
    service: String,
    timeout: Option<TimeoutPolicy>,
    circuit_breaker: Option<CircuitBreakerPolicy>,
    retry: Option<RetryPolicy>,
}

impl ResilienceStackBuilder {
    /// Start from the defaults: 5 s per-attempt timeout, default breaker,
    /// default retry.
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            timeout: Some(
                TimeoutPolicy::new(DEFAULT_CALL_TIMEOUT).expect("default call timeout is valid"),
            ),
            circuit_breaker: Some(CircuitBreakerPolicy::with_config(
                CircuitBreakerConfig::default(),
            )),
            retry: Some(RetryPolicy::builder().build()),
        }
    }

    pub fn timeout(mut self, duration: Duration) -> Result<Self, TimeoutError> {
        self.timeout = Some(TimeoutPolicy::new(duration)?);
        Ok(self)
    }

    pub fn no_timeout(mut self) -> Self {
        self.timeout = None;
        self
    }

    pub fn circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = Some(CircuitBreakerPolicy::with_config(config));
        self
    }

    /// Install an already-built breaker (shared clocks in tests).
    pub fn circuit_breaker_policy(mut self, policy: CircuitBreakerPolicy) -> Self {
        self.circuit_breaker = Some(policy);
        self
    }

    pub fn no_circuit_breaker(mut self) -> Self {
        self.circuit_breaker = None;
        self
    }

    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    pub fn no_retry(mut self) -> Self {
        self.retry = None;
        self
    }

    pub fn build(self) -> ResilienceStack {
        ResilienceStack {
            service: self.service,
            timeout: self.timeout,
            circuit_breaker: self.circuit_breaker,
            retry: self.retry,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::fallback::FallbackStrategy;
    use crate::{Backoff, ErrorKind, InstantSleeper, Jitter};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fast_retry(max_attempts: usize) -> RetryPolicy {
        RetryPolicy::builder()
            .max_attempts(max_attempts)
            .unwrap()
            .backoff(Backoff::new(Duration::from_millis(1), 1.0, Duration::from_millis(1)).unwrap())
            .with_jitter(Jitter::None)
            .with_sleeper(InstantSleeper)
            .build()
    }

    #[tokio::test]
    async fn retries_transient_failures_then_succeeds() {
        let stack = ResilienceStack::builder("high-go-press-counter")
            .retry(fast_retry(3))
            .build();

        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_clone = attempts.clone();
        let result = stack
            .execute("Increment", move || {
                let attempts = attempts_clone.clone();
                async move {
                    let n = attempts.fetch_add(1, Ordering::SeqCst);
                    if n < 2 {
                        Err(FabricError::network("unavailable"))
                    } else {
                        Ok::<_, FabricError>(5i64)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 5);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn errors_come_back_annotated_with_target() {
        let stack = ResilienceStack::builder("high-go-press-counter")
            .retry(fast_retry(1))
            .build();

        let err = stack
            .execute("Get", || async { Err::<(), _>(FabricError::network("down")) })
            .await
            .unwrap_err();
        let target = err.target().unwrap();
        assert_eq!(target.service, "high-go-press-counter");
        assert_eq!(target.method, "Get");
    }

    #[tokio::test]
    async fn breaker_opens_and_open_circuit_is_not_retried() {
        let clock = ManualClock::new();
        let breaker = CircuitBreakerPolicy::with_config(CircuitBreakerConfig {
            failure_threshold: 3,
            success_threshold: 1,
            timeout: Duration::from_millis(100),
            max_requests: 1,
            stat_window: Duration::from_secs(60),
        })
        .with_clock(clock.clone());

        let stack = ResilienceStack::builder("high-go-press-counter")
            .circuit_breaker_policy(breaker)
            .retry(fast_retry(3))
            .build();

        // One gateway call = three attempts = three breaker failures.
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_clone = attempts.clone();
        let err = stack
            .execute("Increment", move || {
                let attempts = attempts_clone.clone();
                async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(FabricError::network("unavailable"))
                }
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Network);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);

        // Circuit now open: next call fails fast without running the
        // operation and without retrying.
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_clone = attempts.clone();
        let err = stack
            .execute("Increment", move || {
                let attempts = attempts_clone.clone();
                async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, FabricError>(1)
                }
            })
            .await
            .unwrap_err();
        assert!(err.is_circuit_open());
        assert_eq!(attempts.load(Ordering::SeqCst), 0);

        // After the open interval a probe goes through.
        clock.advance(150);
        let ok = stack.execute("Increment", || async { Ok::<_, FabricError>(9) }).await;
        assert_eq!(ok.unwrap(), 9);
    }

    #[tokio::test]
    async fn per_attempt_timeout_is_classified_and_retried() {
        let stack = ResilienceStack::builder("high-go-press-counter")
            .timeout(Duration::from_millis(20))
            .unwrap()
            .retry(fast_retry(2))
            .build();

        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_clone = attempts.clone();
        let err = stack
            .execute("Get", move || {
                let attempts = attempts_clone.clone();
                async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(500)).await;
                    Ok::<_, FabricError>(())
                }
            })
            .await
            .unwrap_err();

        assert!(err.is_timeout());
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn fallback_engages_only_after_retry_exhaustion() {
        let stack = ResilienceStack::builder("high-go-press-counter")
            .retry(fast_retry(3))
            .no_circuit_breaker()
            .build();
        let fallback = FallbackPolicy::builder(FallbackStrategy::Default(0i64)).build();

        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_clone = attempts.clone();
        let value = stack
            .execute_with_fallback(
                "Get",
                Fingerprint::new("counter.get:a:like"),
                &fallback,
                move || {
                    let attempts = attempts_clone.clone();
                    async move {
                        attempts.fetch_add(1, Ordering::SeqCst);
                        Err::<i64, _>(FabricError::network("down"))
                    }
                },
            )
            .await;

        // All retries ran before the fallback produced the default.
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert_eq!(value.unwrap(), 0);
    }

    #[tokio::test]
    async fn successful_calls_fill_the_fallback_cache() {
        let stack = ResilienceStack::builder("high-go-press-counter")
            .retry(fast_retry(1))
            .no_circuit_breaker()
            .build();
        let fallback: FallbackPolicy<i64> =
            FallbackPolicy::builder(FallbackStrategy::Cache).build();
        let fingerprint = Fingerprint::new("counter.get:a:like");

        let ok = stack
            .execute_with_fallback("Get", fingerprint.clone(), &fallback, || async {
                Ok::<_, FabricError>(5i64)
            })
            .await;
        assert_eq!(ok.unwrap(), 5);

        let degraded = stack
            .execute_with_fallback("Get", fingerprint, &fallback, || async {
                Err::<i64, _>(FabricError::network("down"))
            })
            .await;
        assert_eq!(degraded.unwrap(), 5);
    }

    #[tokio::test]
    async fn stats_expose_breaker_and_retry_state() {
        let stack = ResilienceStack::builder("high-go-press-counter")
            .retry(fast_retry(2))
            .build();
        let _ = stack
            .execute("Get", || async { Err::<(), _>(FabricError::network("down")) })
            .await;

        let stats = stack.stats();
        assert_eq!(stats.service, "high-go-press-counter");
        assert!(stats.circuit_breaker.is_some());
        assert_eq!(stats.retry.unwrap().attempts, 2);
    }
}
