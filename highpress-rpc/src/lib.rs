//! Wire types and vendored gRPC stubs for the highpress services
//!
//! The prost messages and tonic client/server stubs under [`pb`] are
//! vendored (see `build.rs` for regeneration instructions), so building this
//! crate does not require protoc. [`status`] maps the fabric error taxonomy
//! onto gRPC status codes and back.

mod pb;
pub mod status;

pub use pb::highpress::{analytics, common, counter};

/// Registered service name of the gateway.
pub const GATEWAY_SERVICE: &str = "high-go-press-gateway";
/// Registered service name of the counter worker.
pub const COUNTER_SERVICE: &str = "high-go-press-counter";
/// Registered service name of the analytics worker.
pub const ANALYTICS_SERVICE: &str = "high-go-press-analytics";
