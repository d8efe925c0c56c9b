#![forbid(unsafe_code)]

//! # highpress
//!
//! Resilience fabric for the highpress counter service: the policies that
//! wrap every outbound RPC between the gateway and its backend workers.
//!
//! ## Features
//!
//! - **Error taxonomy** with retryability, target and request-id annotation
//! - **Retry** with exponential backoff and bounded jitter
//! - **Circuit breakers** with bounded half-open probing
//! - **Fallbacks** (cache / default / static / alternative) behind trigger
//!   conditions
//! - **Bulkheads** for bounded fan-out
//! - **Policy composition** via builder pattern
//!
//! The heavy clients live in the member crates: channel pools over tonic in
//! `highpress-pool`, the registry in `highpress-registry`, Kafka in
//! `highpress-events`, the store in `highpress-kv`.
//!
//! ## Quick start
//!
//! ```rust
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use std::sync::Arc;
//! use std::time::Duration;
//! use highpress::{
//!     Backoff, FabricError, InstantSleeper, Jitter, ResilienceStack, RetryPolicy,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), FabricError> {
//!     let retry = RetryPolicy::builder()
//!         .max_attempts(3)
//!         .expect("max_attempts > 0")
//!         .backoff(Backoff::exponential(Duration::from_millis(100)))
//!         .with_jitter(Jitter::factor(0.2).expect("valid jitter"))
//!         .with_sleeper(InstantSleeper)
//!         .build();
//!
//!     let stack = ResilienceStack::builder("high-go-press-counter")
//!         .retry(retry)
//!         .build();
//!
//!     let attempts = Arc::new(AtomicUsize::new(0));
//!     let attempts_clone = attempts.clone();
//!     let value = stack
//!         .execute("Increment", move || {
//!             let attempts = attempts_clone.clone();
//!             async move {
//!                 if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
//!                     Err(FabricError::network("transient failure"))
//!                 } else {
//!                     Ok(41i64 + 1)
//!                 }
//!             }
//!         })
//!         .await?;
//!     assert_eq!(value, 42);
//!     Ok(())
//! }
//! ```

mod backoff;
mod bulkhead;
mod circuit_breaker;
mod clock;
mod error;
mod fallback;
mod jitter;
mod retry;
mod sleeper;
mod stack;
mod timeout;

// Re-exports
pub use backoff::{Backoff, BackoffError, MAX_BACKOFF};
pub use bulkhead::BulkheadPolicy;
pub use circuit_breaker::{
    CircuitBreakerConfig, CircuitBreakerPolicy, CircuitBreakerSnapshot, CircuitState,
};
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use error::{CallTarget, ErrorKind, FabricError};
pub use fallback::{
    AlternativeFn, FallbackPolicy, FallbackPolicyBuilder, FallbackStrategy, FallbackTrigger,
    Fingerprint, ResponseCache,
};
pub use jitter::{Jitter, JitterError};
pub use retry::{BuildError, RetryPolicy, RetryPolicyBuilder, RetryStatsSnapshot};
pub use sleeper::{InstantSleeper, Sleeper, TokioSleeper, TrackingSleeper};
pub use stack::{ResilienceStack, ResilienceStackBuilder, StackStats, DEFAULT_CALL_TIMEOUT};
pub use timeout::{TimeoutError, TimeoutPolicy, MAX_TIMEOUT};

pub mod prelude;
