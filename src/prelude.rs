//! Convenient re-exports for common highpress types.
pub use crate::{
    Backoff, BulkheadPolicy, CircuitBreakerConfig, CircuitBreakerPolicy, CircuitState, ErrorKind,
    FabricError, FallbackPolicy, FallbackStrategy, FallbackTrigger, Fingerprint, Jitter,
    ResilienceStack, ResilienceStackBuilder, RetryPolicy, TimeoutPolicy,
};
