//! Counter event log
//!
//! The producer side hands successful mutations to Kafka without putting
//! the broker on the synchronous response path; the consumer side pulls
//! partitioned records under a group id with at-least-once delivery.
//! Per-counter ordering comes from the partition key
//! `{resource_id}:{counter_type}`.

mod consumer;
mod event;
mod producer;

pub use consumer::{
    ConsumerConfig, ConsumerError, ConsumerGroup, ConsumerStats, HandlerError, OffsetReset,
};
pub use event::{
    CounterEvent, DEFAULT_TOPIC, EVENT_TYPE_INCREMENTED, HEADER_EVENT_ID, HEADER_EVENT_TYPE,
    HEADER_SOURCE,
};
pub use producer::{
    Compression, DeliveryMode, EventProducer, KafkaProducer, MockProducer, ProducerConfig,
    ProducerError, ProducerMode, ProducerStats,
};

use std::sync::Arc;

/// Build the configured producer, honoring `KAFKA_MODE` / `KAFKA_BROKERS`.
pub fn build_producer(
    mut config: ProducerConfig,
) -> Result<Arc<dyn EventProducer>, ProducerError> {
    config.apply_env();
    match config.mode {
        ProducerMode::Mock => {
            tracing::info!("using mock event producer");
            Ok(Arc::new(MockProducer::new()))
        }
        ProducerMode::Real => Ok(Arc::new(KafkaProducer::new(&config)?)),
    }
}
