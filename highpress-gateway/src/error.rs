//! HTTP envelopes and the error-kind to status-code mapping

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use highpress::{ErrorKind, FabricError};
use serde::Serialize;

/// Success envelope: `{"status": "success", "data": ...}`.
#[derive(Debug, Serialize)]
pub struct Envelope<T> {
    pub status: &'static str,
    pub data: T,
}

pub fn success<T: Serialize>(data: T) -> Json<Envelope<T>> {
    Json(Envelope { status: "success", data })
}

/// Error envelope: `{"status": "error", "message", "code"}`.
#[derive(Debug)]
pub struct ApiError {
    kind: ErrorKind,
    message: String,
    request_id: Option<String>,
}

impl ApiError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self { kind: ErrorKind::Validation, message: message.into(), request_id: None }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }
}

impl From<FabricError> for ApiError {
    fn from(err: FabricError) -> Self {
        Self {
            kind: err.kind(),
            message: err.message().to_owned(),
            request_id: err.request_id().map(str::to_owned),
        }
    }
}

/// Canonical HTTP status for each error kind.
pub fn http_status(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Validation => StatusCode::BAD_REQUEST,
        ErrorKind::Business => StatusCode::PRECONDITION_FAILED,
        ErrorKind::System => StatusCode::INTERNAL_SERVER_ERROR,
        ErrorKind::Network => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
        ErrorKind::RateLimit => StatusCode::TOO_MANY_REQUESTS,
        ErrorKind::CircuitOpen => StatusCode::SERVICE_UNAVAILABLE,
        // Client closed request, in the nginx tradition.
        ErrorKind::Cancelled => StatusCode::from_u16(499).unwrap_or(StatusCode::BAD_REQUEST),
        ErrorKind::Unknown => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    status: &'static str,
    message: String,
    code: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    request_id: Option<String>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            status: "error",
            message: self.message,
            code: self.kind.as_str(),
            request_id: self.request_id,
        };
        (http_status(self.kind), Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_kind_maps_to_its_canonical_status() {
        assert_eq!(http_status(ErrorKind::Validation), StatusCode::BAD_REQUEST);
        assert_eq!(http_status(ErrorKind::Business), StatusCode::PRECONDITION_FAILED);
        assert_eq!(http_status(ErrorKind::System), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(http_status(ErrorKind::Network), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(http_status(ErrorKind::Timeout), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(http_status(ErrorKind::RateLimit), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(http_status(ErrorKind::CircuitOpen), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(http_status(ErrorKind::Cancelled).as_u16(), 499);
        assert_eq!(http_status(ErrorKind::Unknown), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn api_error_carries_kind_from_fabric_error() {
        let err: ApiError = FabricError::circuit_open(5, std::time::Duration::from_millis(40))
            .with_request_id("req-1")
            .into();
        assert_eq!(err.kind(), ErrorKind::CircuitOpen);
    }
}
