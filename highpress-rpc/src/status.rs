//! Mappings between the fabric error taxonomy and the wire
//!
//! Each [`ErrorKind`] has one canonical gRPC status code. The reverse
//! mapping classifies statuses coming back from callees, including the
//! transport-level failures tonic reports as `Unknown`.

use crate::pb::highpress::common::v1::{Status as WireStatus, Timestamp};
use highpress::{ErrorKind, FabricError};
use tonic::Code;

/// Canonical gRPC code for an error kind.
pub fn kind_to_code(kind: ErrorKind) -> Code {
    match kind {
        ErrorKind::Validation => Code::InvalidArgument,
        ErrorKind::Business => Code::FailedPrecondition,
        ErrorKind::System => Code::Internal,
        ErrorKind::Network => Code::Unavailable,
        ErrorKind::Timeout => Code::DeadlineExceeded,
        ErrorKind::RateLimit => Code::ResourceExhausted,
        ErrorKind::CircuitOpen => Code::Unavailable,
        ErrorKind::Cancelled => Code::Cancelled,
        ErrorKind::Unknown => Code::Unknown,
    }
}

/// Classify a gRPC code into the closed taxonomy.
pub fn code_to_kind(code: Code) -> ErrorKind {
    match code {
        Code::InvalidArgument => ErrorKind::Validation,
        Code::FailedPrecondition | Code::NotFound | Code::AlreadyExists | Code::Aborted => {
            ErrorKind::Business
        }
        Code::Internal | Code::DataLoss | Code::Unimplemented => ErrorKind::System,
        Code::Unavailable => ErrorKind::Network,
        Code::DeadlineExceeded => ErrorKind::Timeout,
        Code::ResourceExhausted => ErrorKind::RateLimit,
        Code::Cancelled => ErrorKind::Cancelled,
        _ => ErrorKind::Unknown,
    }
}

/// Convert a fabric error into the status sent to RPC callers.
pub fn to_status(err: &FabricError) -> tonic::Status {
    tonic::Status::new(kind_to_code(err.kind()), err.to_string())
}

/// Classify a status returned by a callee.
///
/// Dial and readiness failures surface from tonic as `Unknown` with a
/// transport message rather than `Unavailable`; those are reclassified as
/// network errors so the retry layer treats them as transient. `Aborted`
/// keeps its business classification but stays retryable, matching the
/// store's contention semantics.
pub fn classify_status(status: tonic::Status) -> FabricError {
    let code = status.code();
    let message = status.message().to_owned();

    let kind = if code == Code::Unknown && looks_like_transport_failure(&message) {
        ErrorKind::Network
    } else {
        code_to_kind(code)
    };

    let err = FabricError::new(kind, message).with_source(status);
    if code == Code::Aborted {
        err.with_retryable(true)
    } else {
        err
    }
}

fn looks_like_transport_failure(message: &str) -> bool {
    message.contains("Service was not ready")
        || message.contains("transport error")
        || message.contains("connection refused")
        || message.contains("broken pipe")
}

impl WireStatus {
    /// Successful envelope.
    pub fn ok() -> Self {
        Self { success: true, message: String::new(), code: 0 }
    }

    /// Failure envelope carrying the kind's canonical code.
    pub fn error(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { success: false, message: message.into(), code: kind_to_code(kind) as i32 }
    }
}

impl Timestamp {
    /// Current wall-clock time.
    pub fn now() -> Self {
        let now = chrono::Utc::now();
        Self { seconds: now.timestamp(), nanos: now.timestamp_subsec_nanos() as i32 }
    }
}
