//! Error taxonomy for the request fabric
//!
//! Every error that crosses a service boundary is classified into a closed
//! set of kinds. The kind decides retryability, the canonical RPC status and
//! the HTTP status the gateway responds with; the wire mappings live with the
//! transports, this module only owns the taxonomy.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Closed classification of fabric errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed or missing request data
    Validation,
    /// A domain precondition failed
    Business,
    /// The store or an internal component failed
    System,
    /// Transport unavailable
    Network,
    /// Deadline exceeded
    Timeout,
    /// Resource exhausted / throttled
    RateLimit,
    /// A circuit breaker short-circuited the call
    CircuitOpen,
    /// The caller gave up
    Cancelled,
    /// Anything that defies classification
    Unknown,
}

impl ErrorKind {
    /// Kinds the retry layer considers transient by default.
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Network | Self::Timeout | Self::RateLimit)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::Business => "business",
            Self::System => "system",
            Self::Network => "network",
            Self::Timeout => "timeout",
            Self::RateLimit => "rate_limit",
            Self::CircuitOpen => "circuit_open",
            Self::Cancelled => "cancelled",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The service/method a failed call was addressed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallTarget {
    pub service: String,
    pub method: String,
}

impl fmt::Display for CallTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.service, self.method)
    }
}

/// Classified error annotated with its call target and request id.
#[derive(Debug)]
pub struct FabricError {
    kind: ErrorKind,
    message: String,
    target: Option<CallTarget>,
    request_id: Option<String>,
    retryable: bool,
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl FabricError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            target: None,
            request_id: None,
            retryable: kind.is_retryable(),
            source: None,
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn business(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Business, message)
    }

    pub fn system(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::System, message)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Network, message)
    }

    pub fn timeout(elapsed: Duration, limit: Duration) -> Self {
        Self::new(
            ErrorKind::Timeout,
            format!("operation timed out after {:?} (limit: {:?})", elapsed, limit),
        )
    }

    pub fn rate_limit(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::RateLimit, message)
    }

    pub fn circuit_open(failure_count: usize, retry_after: Duration) -> Self {
        Self::new(
            ErrorKind::CircuitOpen,
            format!("circuit open ({} failures, retry after {:?})", failure_count, retry_after),
        )
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Cancelled, message)
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unknown, message)
    }

    /// Attach the call target; an existing annotation is kept.
    pub fn with_target(mut self, service: impl Into<String>, method: impl Into<String>) -> Self {
        if self.target.is_none() {
            self.target = Some(CallTarget { service: service.into(), method: method.into() });
        }
        self
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// Override the kind-derived retryability.
    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn target(&self) -> Option<&CallTarget> {
        self.target.as_ref()
    }

    pub fn request_id(&self) -> Option<&str> {
        self.request_id.as_deref()
    }

    pub fn is_retryable(&self) -> bool {
        self.retryable
    }

    pub fn is_circuit_open(&self) -> bool {
        self.kind == ErrorKind::CircuitOpen
    }

    pub fn is_timeout(&self) -> bool {
        self.kind == ErrorKind::Timeout
    }

    pub fn is_validation(&self) -> bool {
        self.kind == ErrorKind::Validation
    }

    pub fn is_rate_limit(&self) -> bool {
        self.kind == ErrorKind::RateLimit
    }
}

impl fmt::Display for FabricError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)?;
        if let Some(target) = &self.target {
            write!(f, " (target: {})", target)?;
        }
        if let Some(request_id) = &self.request_id {
            write!(f, " (request: {})", request_id)?;
        }
        Ok(())
    }
}

impl std::error::Error for FabricError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_ref().map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;
    use std::io;

    #[test]
    fn default_retryability_follows_kind() {
        assert!(FabricError::network("conn refused").is_retryable());
        assert!(FabricError::timeout(Duration::from_secs(6), Duration::from_secs(5)).is_retryable());
        assert!(FabricError::rate_limit("throttled").is_retryable());
        assert!(!FabricError::validation("empty id").is_retryable());
        assert!(!FabricError::circuit_open(3, Duration::from_millis(100)).is_retryable());
        assert!(!FabricError::cancelled("caller went away").is_retryable());
    }

    #[test]
    fn retryability_can_be_overridden() {
        let err = FabricError::unknown("weird").with_retryable(true);
        assert!(err.is_retryable());
        assert_eq!(err.kind(), ErrorKind::Unknown);
    }

    #[test]
    fn display_includes_annotations() {
        let err = FabricError::network("connect refused")
            .with_target("high-go-press-counter", "Increment")
            .with_request_id("req-42");
        let msg = err.to_string();
        assert!(msg.contains("network"));
        assert!(msg.contains("high-go-press-counter/Increment"));
        assert!(msg.contains("req-42"));
    }

    #[test]
    fn with_target_keeps_first_annotation() {
        let err = FabricError::system("boom")
            .with_target("counter", "Get")
            .with_target("analytics", "TopCounters");
        assert_eq!(err.target().unwrap().service, "counter");
    }

    #[test]
    fn source_is_preserved() {
        let io_err = io::Error::new(io::ErrorKind::ConnectionRefused, "refused");
        let err = FabricError::network("dial failed").with_source(io_err);
        assert_eq!(err.source().unwrap().to_string(), "refused");
    }

    #[test]
    fn timeout_message_carries_both_durations() {
        let err = FabricError::timeout(Duration::from_millis(5100), Duration::from_secs(5));
        assert!(err.to_string().contains("5.1"));
        assert!(err.is_timeout());
    }

    #[test]
    fn kind_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorKind::CircuitOpen).unwrap();
        assert_eq!(json, "\"circuit_open\"");
        let kind: ErrorKind = serde_json::from_str("\"rate_limit\"").unwrap();
        assert_eq!(kind, ErrorKind::RateLimit);
    }
}
