//! Degraded responses after the retry loop gives up
//!
//! A fallback policy pairs a strategy (cached response, preconfigured
//! default, precomputed static value, or a call to a backup target) with
//! trigger conditions that decide when degrading beats surfacing the error.
//! Successful primary responses are written through to the cache so the
//! `Cache` strategy has something to serve.

use crate::clock::{Clock, MonotonicClock};
use crate::FabricError;
use futures::future::BoxFuture;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

/// Minimum observations before the error-rate trigger may fire.
const ERROR_RATE_MIN_SAMPLES: u64 = 10;

/// Cache key for one logical request.
///
/// Built by the caller from the request's identifying fields (for example
/// `"counter.get:article_001:like"`), so two different requests never share
/// an entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Producer of a backup response.
pub type AlternativeFn<T> =
    Arc<dyn Fn() -> BoxFuture<'static, Result<T, FabricError>> + Send + Sync>;

/// How a degraded response is produced.
#[derive(Clone)]
pub enum FallbackStrategy<T> {
    /// Serve the last successful response for the same request, if fresh
    Cache,
    /// Serve a preconfigured default
    Default(T),
    /// Serve a precomputed response
    Static(T),
    /// Call a backup target
    Alternative(AlternativeFn<T>),
}

impl<T> std::fmt::Debug for FallbackStrategy<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cache => f.write_str("Cache"),
            Self::Default(_) => f.write_str("Default"),
            Self::Static(_) => f.write_str("Static"),
            Self::Alternative(_) => f.write_str("Alternative"),
        }
    }
}

/// Condition under which the fallback engages. An empty trigger list means
/// "always".
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FallbackTrigger {
    /// The final error is a circuit-open rejection
    CircuitOpen,
    /// Failure ratio over the trigger window reached the threshold
    ErrorRate { threshold: f64 },
    /// The failed call took at least this long
    Latency { threshold: Duration },
}

struct CacheEntry<T> {
    value: T,
    stored_at_millis: u64,
}

/// TTL cache keyed by request fingerprint.
///
/// Fingerprints are caller-built strings, so distinct requests cannot
/// collide by construction.
pub struct ResponseCache<T> {
    ttl: Duration,
    entries: RwLock<HashMap<String, CacheEntry<T>>>,
    clock: Arc<dyn Clock>,
}

impl<T: Clone> ResponseCache<T> {
    fn new(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self { ttl, entries: RwLock::new(HashMap::new()), clock }
    }

    pub fn put(&self, key: &Fingerprint, value: T) {
        let now = self.clock.now_millis();
        let mut entries =
            self.entries.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        // Drop anything already expired while we hold the write lock anyway.
        let ttl_millis = self.ttl.as_millis() as u64;
        entries.retain(|_, entry| now.saturating_sub(entry.stored_at_millis) < ttl_millis);
        entries.insert(key.as_str().to_owned(), CacheEntry { value, stored_at_millis: now });
    }

    pub fn get(&self, key: &Fingerprint) -> Option<T> {
        let now = self.clock.now_millis();
        let entries = self.entries.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        let entry = entries.get(key.as_str())?;
        if now.saturating_sub(entry.stored_at_millis) < self.ttl.as_millis() as u64 {
            Some(entry.value.clone())
        } else {
            None
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(|poisoned| poisoned.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

struct WindowBucket {
    second: u64,
    total: u64,
    failures: u64,
}

/// Per-second ring of call outcomes backing the error-rate trigger.
struct OutcomeWindow {
    width: Duration,
    buckets: Mutex<VecDeque<WindowBucket>>,
    clock: Arc<dyn Clock>,
}

impl OutcomeWindow {
    fn new(width: Duration, clock: Arc<dyn Clock>) -> Self {
        Self { width, buckets: Mutex::new(VecDeque::new()), clock }
    }

    fn record(&self, failed: bool) {
        let second = self.clock.now_millis() / 1000;
        let horizon = second.saturating_sub(self.width.as_secs().max(1));
        let mut buckets = self.buckets.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        while buckets.front().is_some_and(|b| b.second < horizon) {
            buckets.pop_front();
        }
        match buckets.back_mut() {
            Some(bucket) if bucket.second == second => {
                bucket.total += 1;
                if failed {
                    bucket.failures += 1;
                }
            }
            _ => {
                buckets.push_back(WindowBucket {
                    second,
                    total: 1,
                    failures: u64::from(failed),
                });
            }
        }
    }

    fn error_rate(&self) -> Option<f64> {
        let second = self.clock.now_millis() / 1000;
        let horizon = second.saturating_sub(self.width.as_secs().max(1));
        let buckets = self.buckets.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let (total, failures) = buckets
            .iter()
            .filter(|b| b.second >= horizon)
            .fold((0u64, 0u64), |(t, f), b| (t + b.total, f + b.failures));
        if total < ERROR_RATE_MIN_SAMPLES {
            return None;
        }
        Some(failures as f64 / total as f64)
    }
}

/// Fallback policy for one call site.
pub struct FallbackPolicy<T> {
    strategy: FallbackStrategy<T>,
    triggers: Vec<FallbackTrigger>,
    cache: ResponseCache<T>,
    window: OutcomeWindow,
}

impl<T> std::fmt::Debug for FallbackPolicy<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FallbackPolicy")
            .field("strategy", &self.strategy)
            .field("triggers", &self.triggers)
            .finish()
    }
}

impl<T> FallbackPolicy<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn builder(strategy: FallbackStrategy<T>) -> FallbackPolicyBuilder<T> {
        FallbackPolicyBuilder::new(strategy)
    }

    /// Record a successful primary call; fills the cache opportunistically.
    pub fn record_success(&self, key: &Fingerprint, value: &T) {
        self.window.record(false);
        self.cache.put(key, value.clone());
    }

    fn should_trigger(&self, err: &FabricError, latency: Duration) -> bool {
        if self.triggers.is_empty() {
            return true;
        }
        self.triggers.iter().any(|trigger| match trigger {
            FallbackTrigger::CircuitOpen => err.is_circuit_open(),
            FallbackTrigger::ErrorRate { threshold } => {
                self.window.error_rate().is_some_and(|rate| rate >= *threshold)
            }
            FallbackTrigger::Latency { threshold } => latency >= *threshold,
        })
    }

    /// Attempt a degraded response for a failed call. Surfaces the original
    /// error when no trigger fires or the strategy has nothing to offer.
    pub async fn resolve(
        &self,
        key: &Fingerprint,
        err: FabricError,
        latency: Duration,
    ) -> Result<T, FabricError> {
        self.window.record(true);
        if !self.should_trigger(&err, latency) {
            return Err(err);
        }

        match &self.strategy {
            FallbackStrategy::Cache => match self.cache.get(key) {
                Some(value) => {
                    tracing::info!(key = key.as_str(), "serving cached fallback response");
                    Ok(value)
                }
                None => Err(err),
            },
            FallbackStrategy::Default(value) | FallbackStrategy::Static(value) => {
                tracing::info!(key = key.as_str(), "serving configured fallback response");
                Ok(value.clone())
            }
            FallbackStrategy::Alternative(backup) => match backup().await {
                Ok(value) => Ok(value),
                Err(alt_err) => {
                    tracing::warn!(error = %alt_err, "alternative fallback target failed");
                    Err(err)
                }
            },
        }
    }

    #[cfg(test)]
    fn cache(&self) -> &ResponseCache<T> {
        &self.cache
    }
}

pub struct FallbackPolicyBuilder<T> {
    strategy: FallbackStrategy<T>,
    triggers: Vec<FallbackTrigger>,
    cache_ttl: Duration,
    trigger_window: Duration,
    clock: Arc<dyn Clock>,
}

impl<T> FallbackPolicyBuilder<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(strategy: FallbackStrategy<T>) -> Self {
        Self {
            strategy,
            triggers: Vec::new(),
            cache_ttl: Duration::from_secs(60),
            trigger_window: Duration::from_secs(60),
            clock: Arc::new(MonotonicClock::default()),
        }
    }

    pub fn trigger(mut self, trigger: FallbackTrigger) -> Self {
        self.triggers.push(trigger);
        self
    }

    pub fn cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    /// Width of the window the error-rate trigger aggregates over.
    pub fn trigger_window(mut self, window: Duration) -> Self {
        self.trigger_window = window;
        self
    }

    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn build(self) -> FallbackPolicy<T> {
        FallbackPolicy {
            strategy: self.strategy,
            triggers: self.triggers,
            cache: ResponseCache::new(self.cache_ttl, self.clock.clone()),
            window: OutcomeWindow::new(self.trigger_window, self.clock),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn key(name: &str) -> Fingerprint {
        Fingerprint::new(name)
    }

    #[tokio::test]
    async fn cache_strategy_serves_last_success() {
        let policy: FallbackPolicy<i64> =
            FallbackPolicy::builder(FallbackStrategy::Cache).build();
        policy.record_success(&key("get:a:like"), &5);

        let out = policy
            .resolve(&key("get:a:like"), FabricError::network("down"), Duration::ZERO)
            .await;
        assert_eq!(out.unwrap(), 5);
    }

    #[tokio::test]
    async fn cache_miss_surfaces_original_error() {
        let policy: FallbackPolicy<i64> =
            FallbackPolicy::builder(FallbackStrategy::Cache).build();
        let out = policy
            .resolve(&key("get:a:like"), FabricError::network("down"), Duration::ZERO)
            .await;
        assert!(out.unwrap_err().is_retryable());
    }

    #[tokio::test]
    async fn cache_entries_expire() {
        let clock = ManualClock::new();
        let policy: FallbackPolicy<i64> = FallbackPolicy::builder(FallbackStrategy::Cache)
            .cache_ttl(Duration::from_millis(100))
            .with_clock(clock.clone())
            .build();
        policy.record_success(&key("get:a:like"), &5);
        clock.advance(150);

        let out = policy
            .resolve(&key("get:a:like"), FabricError::network("down"), Duration::ZERO)
            .await;
        assert!(out.is_err());
    }

    #[tokio::test]
    async fn distinct_fingerprints_do_not_collide() {
        let policy: FallbackPolicy<i64> =
            FallbackPolicy::builder(FallbackStrategy::Cache).build();
        policy.record_success(&key("get:a:like"), &5);
        policy.record_success(&key("get:a:view"), &9);
        assert_eq!(policy.cache().len(), 2);

        let out = policy
            .resolve(&key("get:a:view"), FabricError::network("down"), Duration::ZERO)
            .await;
        assert_eq!(out.unwrap(), 9);
    }

    #[tokio::test]
    async fn default_strategy_always_answers() {
        let policy = FallbackPolicy::builder(FallbackStrategy::Default(0i64)).build();
        let out = policy
            .resolve(&key("get:a:like"), FabricError::system("boom"), Duration::ZERO)
            .await;
        assert_eq!(out.unwrap(), 0);
    }

    #[tokio::test]
    async fn circuit_open_trigger_filters_other_errors() {
        let policy = FallbackPolicy::builder(FallbackStrategy::Default(0i64))
            .trigger(FallbackTrigger::CircuitOpen)
            .build();

        let passed = policy
            .resolve(&key("k"), FabricError::system("boom"), Duration::ZERO)
            .await;
        assert!(passed.is_err());

        let degraded = policy
            .resolve(
                &key("k"),
                FabricError::circuit_open(5, Duration::from_millis(50)),
                Duration::ZERO,
            )
            .await;
        assert_eq!(degraded.unwrap(), 0);
    }

    #[tokio::test]
    async fn latency_trigger_uses_call_elapsed() {
        let policy = FallbackPolicy::builder(FallbackStrategy::Static(1i64))
            .trigger(FallbackTrigger::Latency { threshold: Duration::from_millis(200) })
            .build();

        let fast = policy
            .resolve(&key("k"), FabricError::network("down"), Duration::from_millis(10))
            .await;
        assert!(fast.is_err());

        let slow = policy
            .resolve(&key("k"), FabricError::network("down"), Duration::from_millis(500))
            .await;
        assert_eq!(slow.unwrap(), 1);
    }

    #[tokio::test]
    async fn error_rate_trigger_needs_enough_samples() {
        let clock = ManualClock::new();
        let policy = FallbackPolicy::builder(FallbackStrategy::Default(0i64))
            .trigger(FallbackTrigger::ErrorRate { threshold: 0.5 })
            .with_clock(clock.clone())
            .build();

        // Too few observations: trigger stays quiet.
        let out = policy
            .resolve(&key("k"), FabricError::network("down"), Duration::ZERO)
            .await;
        assert!(out.is_err());

        // Flood with failures until the window has enough samples.
        for _ in 0..ERROR_RATE_MIN_SAMPLES {
            let _ = policy
                .resolve(&key("k"), FabricError::network("down"), Duration::ZERO)
                .await;
        }
        let out = policy
            .resolve(&key("k"), FabricError::network("down"), Duration::ZERO)
            .await;
        assert_eq!(out.unwrap(), 0);
    }

    #[tokio::test]
    async fn alternative_strategy_calls_backup() {
        let backup: AlternativeFn<i64> = Arc::new(|| Box::pin(async { Ok(77) }));
        let policy = FallbackPolicy::builder(FallbackStrategy::Alternative(backup)).build();
        let out = policy
            .resolve(&key("k"), FabricError::network("down"), Duration::ZERO)
            .await;
        assert_eq!(out.unwrap(), 77);
    }

    #[tokio::test]
    async fn failed_alternative_surfaces_primary_error() {
        let backup: AlternativeFn<i64> =
            Arc::new(|| Box::pin(async { Err(FabricError::network("backup down too")) }));
        let policy = FallbackPolicy::builder(FallbackStrategy::Alternative(backup)).build();
        let out = policy
            .resolve(&key("k"), FabricError::system("primary boom"), Duration::ZERO)
            .await;
        let err = out.unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::System);
    }
}
