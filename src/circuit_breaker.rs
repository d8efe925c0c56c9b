//! Circuit breaker protecting one RPC target
//!
//! State machine:
//! - `Closed`: calls pass; `failure_threshold` consecutive failures open the
//!   circuit.
//! - `Open`: calls fail fast with a circuit-open error; after `timeout` the
//!   next caller moves the circuit to half-open.
//! - `HalfOpen`: at most `max_requests` probe calls run concurrently;
//!   `success_threshold` consecutive successes close the circuit, any
//!   failure reopens it.
//!
//! Composite state lives under one mutex; callers never read counters
//! without it.

use crate::clock::{Clock, MonotonicClock};
use crate::FabricError;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures in `Closed` before opening
    pub failure_threshold: usize,
    /// Consecutive half-open successes before closing
    pub success_threshold: usize,
    /// How long the circuit stays open before probing
    pub timeout: Duration,
    /// Concurrent probe calls permitted while half-open
    pub max_requests: usize,
    /// Width of the rolling request/failure window in the stats snapshot
    pub stat_window: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            timeout: Duration::from_secs(30),
            max_requests: 1,
            stat_window: Duration::from_secs(60),
        }
    }
}

impl CircuitBreakerConfig {
    /// A breaker that never opens.
    pub fn disabled() -> Self {
        Self { failure_threshold: usize::MAX, ..Self::default() }
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: usize,
    half_open_successes: usize,
    half_open_in_flight: usize,
    opened_at_millis: u64,
    window_started_millis: u64,
    window_requests: u64,
    window_failures: u64,
}

impl BreakerState {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            half_open_successes: 0,
            half_open_in_flight: 0,
            opened_at_millis: 0,
            window_started_millis: 0,
            window_requests: 0,
            window_failures: 0,
        }
    }

    fn record_outcome(&mut self, now: u64, window: Duration, failed: bool) {
        if now.saturating_sub(self.window_started_millis) >= window.as_millis() as u64 {
            self.window_started_millis = now;
            self.window_requests = 0;
            self.window_failures = 0;
        }
        self.window_requests += 1;
        if failed {
            self.window_failures += 1;
        }
    }
}

/// Observable snapshot of breaker state and counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct CircuitBreakerSnapshot {
    pub state: CircuitState,
    pub consecutive_failures: usize,
    pub half_open_successes: usize,
    /// Time until the open circuit admits a probe; zero unless open
    pub open_remaining_millis: u64,
    pub window_requests: u64,
    pub window_failures: u64,
}

#[derive(Clone)]
pub struct CircuitBreakerPolicy {
    inner: Arc<Mutex<BreakerState>>,
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for CircuitBreakerPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreakerPolicy").field("config", &self.config).finish()
    }
}

impl CircuitBreakerPolicy {
    pub fn new(failure_threshold: usize, timeout: Duration) -> Self {
        Self::with_config(CircuitBreakerConfig {
            failure_threshold,
            timeout,
            ..CircuitBreakerConfig::default()
        })
    }

    pub fn with_config(config: CircuitBreakerConfig) -> Self {
        Self {
            inner: Arc::new(Mutex::new(BreakerState::new())),
            config,
            clock: Arc::new(MonotonicClock::default()),
        }
    }

    /// Override the clock (deterministic tests).
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn snapshot(&self) -> CircuitBreakerSnapshot {
        let inner = self.lock();
        let open_remaining_millis = if inner.state == CircuitState::Open {
            (self.config.timeout.as_millis() as u64)
                .saturating_sub(self.clock.now_millis().saturating_sub(inner.opened_at_millis))
        } else {
            0
        };
        CircuitBreakerSnapshot {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            half_open_successes: inner.half_open_successes,
            open_remaining_millis,
            window_requests: inner.window_requests,
            window_failures: inner.window_failures,
        }
    }

    pub async fn execute<T, Fut, Op>(&self, mut operation: Op) -> Result<T, FabricError>
    where
        T: Send,
        Fut: Future<Output = Result<T, FabricError>> + Send,
        Op: FnMut() -> Fut + Send,
    {
        let probing = self.admit()?;

        let result = operation().await;
        match &result {
            Ok(_) => self.on_success(probing),
            Err(_) => self.on_failure(probing),
        }
        result
    }

    /// Decide whether a call may proceed. Returns whether the call runs as a
    /// half-open probe.
    fn admit(&self) -> Result<bool, FabricError> {
        let now = self.clock.now_millis();
        let mut inner = self.lock();

        match inner.state {
            CircuitState::Closed => Ok(false),
            CircuitState::Open => {
                let elapsed = now.saturating_sub(inner.opened_at_millis);
                if elapsed >= self.config.timeout.as_millis() as u64 {
                    inner.state = CircuitState::HalfOpen;
                    inner.half_open_successes = 0;
                    inner.half_open_in_flight = 1;
                    tracing::info!("circuit breaker: open -> half-open");
                    Ok(true)
                } else {
                    let retry_after = Duration::from_millis(
                        (self.config.timeout.as_millis() as u64).saturating_sub(elapsed),
                    );
                    Err(FabricError::circuit_open(inner.consecutive_failures, retry_after))
                }
            }
            CircuitState::HalfOpen => {
                if inner.half_open_in_flight >= self.config.max_requests {
                    Err(FabricError::circuit_open(inner.consecutive_failures, Duration::ZERO))
                } else {
                    inner.half_open_in_flight += 1;
                    Ok(true)
                }
            }
        }
    }

    fn on_success(&self, probing: bool) {
        let now = self.clock.now_millis();
        let mut inner = self.lock();
        inner.record_outcome(now, self.config.stat_window, false);

        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures = 0;
            }
            CircuitState::HalfOpen => {
                if probing {
                    inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
                }
                inner.half_open_successes += 1;
                if inner.half_open_successes >= self.config.success_threshold {
                    inner.state = CircuitState::Closed;
                    inner.consecutive_failures = 0;
                    inner.half_open_successes = 0;
                    inner.half_open_in_flight = 0;
                    inner.opened_at_millis = 0;
                    tracing::info!("circuit breaker: half-open -> closed");
                }
            }
            // A probe's success can land after a concurrent failure reopened
            // the circuit; the reopen wins.
            CircuitState::Open => {}
        }
    }

    fn on_failure(&self, probing: bool) {
        let now = self.clock.now_millis();
        let mut inner = self.lock();
        inner.record_outcome(now, self.config.stat_window, true);
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);

        match inner.state {
            CircuitState::Closed => {
                if inner.consecutive_failures >= self.config.failure_threshold {
                    inner.state = CircuitState::Open;
                    inner.opened_at_millis = now;
                    tracing::warn!(
                        failures = inner.consecutive_failures,
                        threshold = self.config.failure_threshold,
                        "circuit breaker: closed -> open"
                    );
                }
            }
            CircuitState::HalfOpen => {
                let _ = probing;
                inner.state = CircuitState::Open;
                inner.opened_at_millis = now;
                inner.half_open_successes = 0;
                inner.half_open_in_flight = 0;
                tracing::warn!("circuit breaker: probe failed, half-open -> open");
            }
            CircuitState::Open => {}
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerState> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn breaker(failures: usize, timeout_ms: u64, clock: &ManualClock) -> CircuitBreakerPolicy {
        CircuitBreakerPolicy::with_config(CircuitBreakerConfig {
            failure_threshold: failures,
            success_threshold: 1,
            timeout: Duration::from_millis(timeout_ms),
            max_requests: 1,
            stat_window: Duration::from_secs(60),
        })
        .with_clock(clock.clone())
    }

    async fn fail(breaker: &CircuitBreakerPolicy) -> Result<(), FabricError> {
        breaker.execute(|| async { Err::<(), _>(FabricError::network("down")) }).await
    }

    async fn succeed(breaker: &CircuitBreakerPolicy) -> Result<u32, FabricError> {
        breaker.execute(|| async { Ok::<_, FabricError>(42) }).await
    }

    #[tokio::test]
    async fn starts_closed_and_passes_calls() {
        let clock = ManualClock::new();
        let breaker = breaker(3, 1000, &clock);
        assert_eq!(succeed(&breaker).await.unwrap(), 42);
        assert_eq!(breaker.snapshot().state, CircuitState::Closed);
    }

    #[tokio::test]
    async fn opens_after_threshold_failures_and_fails_fast() {
        let clock = ManualClock::new();
        let breaker = breaker(3, 1000, &clock);
        for _ in 0..3 {
            let _ = fail(&breaker).await;
        }
        assert_eq!(breaker.snapshot().state, CircuitState::Open);

        // Fast-fail without running the operation.
        let executed = Arc::new(AtomicUsize::new(0));
        let executed_clone = executed.clone();
        let result = breaker
            .execute(|| {
                let executed = executed_clone.clone();
                async move {
                    executed.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, FabricError>(1)
                }
            })
            .await;
        assert!(result.unwrap_err().is_circuit_open());
        assert_eq!(executed.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn probes_after_timeout_and_closes_on_success() {
        let clock = ManualClock::new();
        let breaker = breaker(2, 100, &clock);
        for _ in 0..2 {
            let _ = fail(&breaker).await;
        }
        assert!(fail(&breaker).await.unwrap_err().is_circuit_open());

        clock.advance(150);
        assert_eq!(succeed(&breaker).await.unwrap(), 42);
        assert_eq!(breaker.snapshot().state, CircuitState::Closed);
        assert_eq!(breaker.snapshot().consecutive_failures, 0);
    }

    #[tokio::test]
    async fn failed_probe_reopens() {
        let clock = ManualClock::new();
        let breaker = breaker(2, 100, &clock);
        for _ in 0..2 {
            let _ = fail(&breaker).await;
        }
        clock.advance(150);
        let _ = fail(&breaker).await; // probe fails
        assert_eq!(breaker.snapshot().state, CircuitState::Open);
        assert!(succeed(&breaker).await.unwrap_err().is_circuit_open());
    }

    #[tokio::test]
    async fn success_threshold_requires_consecutive_probe_successes() {
        let clock = ManualClock::new();
        let breaker = CircuitBreakerPolicy::with_config(CircuitBreakerConfig {
            failure_threshold: 1,
            success_threshold: 2,
            timeout: Duration::from_millis(100),
            max_requests: 1,
            stat_window: Duration::from_secs(60),
        })
        .with_clock(clock.clone());

        let _ = fail(&breaker).await;
        clock.advance(150);

        assert!(succeed(&breaker).await.is_ok());
        assert_eq!(breaker.snapshot().state, CircuitState::HalfOpen);

        assert!(succeed(&breaker).await.is_ok());
        assert_eq!(breaker.snapshot().state, CircuitState::Closed);
    }

    #[tokio::test]
    async fn half_open_limits_concurrent_probes() {
        let clock = ManualClock::new();
        let breaker = CircuitBreakerPolicy::with_config(CircuitBreakerConfig {
            failure_threshold: 1,
            success_threshold: 2,
            timeout: Duration::from_millis(100),
            max_requests: 1,
            stat_window: Duration::from_secs(60),
        })
        .with_clock(clock.clone());

        let _ = fail(&breaker).await;
        clock.advance(150);

        let gate = Arc::new(tokio::sync::Semaphore::new(0));
        let gate_probe = gate.clone();
        let probe_breaker = breaker.clone();
        let probe = tokio::spawn(async move {
            probe_breaker
                .execute(move || {
                    let gate = gate_probe.clone();
                    async move {
                        let _permit = gate.acquire().await.expect("gate closed");
                        Ok::<_, FabricError>(1)
                    }
                })
                .await
        });

        // Give the probe time to occupy the half-open slot.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(succeed(&breaker).await.unwrap_err().is_circuit_open());

        gate.add_permits(1);
        assert_eq!(probe.await.unwrap().unwrap(), 1);
    }

    #[tokio::test]
    async fn closed_successes_reset_failure_count() {
        let clock = ManualClock::new();
        let breaker = breaker(3, 1000, &clock);
        let _ = fail(&breaker).await;
        let _ = fail(&breaker).await;
        let _ = succeed(&breaker).await;
        let _ = fail(&breaker).await;
        let _ = fail(&breaker).await;
        // Reset after success, so only two consecutive failures so far.
        assert_eq!(breaker.snapshot().state, CircuitState::Closed);
    }

    #[tokio::test]
    async fn disabled_breaker_never_opens() {
        let breaker = CircuitBreakerPolicy::with_config(CircuitBreakerConfig::disabled());
        for _ in 0..100 {
            let _ = fail(&breaker).await;
        }
        assert_eq!(breaker.snapshot().state, CircuitState::Closed);
        assert!(succeed(&breaker).await.is_ok());
    }

    #[tokio::test]
    async fn snapshot_reports_open_remaining() {
        let clock = ManualClock::new();
        let breaker = breaker(1, 200, &clock);
        let _ = fail(&breaker).await;
        clock.advance(50);
        let snapshot = breaker.snapshot();
        assert_eq!(snapshot.state, CircuitState::Open);
        assert_eq!(snapshot.open_remaining_millis, 150);
    }
}
