//! The counter event record

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Default topic counter events land on.
pub const DEFAULT_TOPIC: &str = "counter-events";

/// Record header carrying the event type.
pub const HEADER_EVENT_TYPE: &str = "event_type";
/// Record header carrying the emitting worker.
pub const HEADER_SOURCE: &str = "source";
/// Record header carrying the event id.
pub const HEADER_EVENT_ID: &str = "event_id";

/// Event type emitted on every successful increment.
pub const EVENT_TYPE_INCREMENTED: &str = "counter_incremented";

/// One successful counter mutation, emitted to the log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CounterEvent {
    pub event_id: String,
    pub resource_id: String,
    pub counter_type: String,
    pub delta: i64,
    /// Post-increment value.
    pub new_value: i64,
    pub timestamp: DateTime<Utc>,
    /// Identifier of the emitting worker.
    pub source: String,
}

impl CounterEvent {
    pub fn new(
        resource_id: impl Into<String>,
        counter_type: impl Into<String>,
        delta: i64,
        new_value: i64,
        source: impl Into<String>,
    ) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            resource_id: resource_id.into(),
            counter_type: counter_type.into(),
            delta,
            new_value,
            timestamp: Utc::now(),
            source: source.into(),
        }
    }

    /// Partition key; pins all events for one counter to one partition so
    /// per-counter order is preserved.
    pub fn partition_key(&self) -> String {
        format!("{}:{}", self.resource_id, self.counter_type)
    }
}
