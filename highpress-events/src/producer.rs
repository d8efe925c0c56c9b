//! Event producers
//!
//! The Kafka producer runs in one of two delivery modes. In async mode
//! `send` enqueues into a bounded buffer and returns; a background writer
//! batches records by size or linger interval and observes delivery
//! results itself, so a broker outage can never unwind a caller whose
//! mutation already committed. Sync mode awaits the broker ack and is
//! reserved for callers that must see durability.

use crate::event::{
    CounterEvent, HEADER_EVENT_ID, HEADER_EVENT_TYPE, HEADER_SOURCE, EVENT_TYPE_INCREMENTED,
};
use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::ClientConfig;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// Which producer implementation to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProducerMode {
    Real,
    Mock,
}

/// Whether `send` waits for the broker ack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    Async,
    Sync,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Compression {
    None,
    Gzip,
    Snappy,
    Lz4,
    Zstd,
}

impl Compression {
    fn as_kafka(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Gzip => "gzip",
            Self::Snappy => "snappy",
            Self::Lz4 => "lz4",
            Self::Zstd => "zstd",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProducerConfig {
    #[serde(default = "default_mode")]
    pub mode: ProducerMode,
    #[serde(default = "default_brokers")]
    pub brokers: Vec<String>,
    #[serde(default = "default_topic")]
    pub topic: String,
    #[serde(default = "default_delivery")]
    pub delivery: DeliveryMode,
    /// Records per batch in async mode.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Flush interval when a batch does not fill up.
    #[serde(default = "default_linger_ms")]
    pub linger_ms: u64,
    #[serde(default = "default_compression")]
    pub compression: Compression,
    #[serde(default = "default_idempotent")]
    pub idempotent: bool,
    #[serde(default = "default_retries")]
    pub retries: u32,
    /// Async-mode buffer capacity; overflow drops the event (counted).
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

fn default_mode() -> ProducerMode {
    ProducerMode::Real
}

fn default_brokers() -> Vec<String> {
    vec!["127.0.0.1:9092".to_owned()]
}

fn default_topic() -> String {
    crate::event::DEFAULT_TOPIC.to_owned()
}

fn default_delivery() -> DeliveryMode {
    DeliveryMode::Async
}

fn default_batch_size() -> usize {
    100
}

fn default_linger_ms() -> u64 {
    50
}

fn default_compression() -> Compression {
    Compression::Lz4
}

fn default_idempotent() -> bool {
    true
}

fn default_retries() -> u32 {
    3
}

fn default_queue_capacity() -> usize {
    10_000
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            mode: default_mode(),
            brokers: default_brokers(),
            topic: default_topic(),
            delivery: default_delivery(),
            batch_size: default_batch_size(),
            linger_ms: default_linger_ms(),
            compression: default_compression(),
            idempotent: default_idempotent(),
            retries: default_retries(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

impl ProducerConfig {
    /// Apply the `KAFKA_MODE` / `KAFKA_BROKERS` environment overrides.
    pub fn apply_env(&mut self) {
        if let Ok(mode) = std::env::var("KAFKA_MODE") {
            match mode.to_ascii_lowercase().as_str() {
                "mock" => self.mode = ProducerMode::Mock,
                "real" => self.mode = ProducerMode::Real,
                other => tracing::warn!(mode = other, "ignoring unknown KAFKA_MODE"),
            }
        }
        if let Ok(brokers) = std::env::var("KAFKA_BROKERS") {
            let brokers: Vec<String> = brokers
                .split(',')
                .map(|broker| broker.trim().to_owned())
                .filter(|broker| !broker.is_empty())
                .collect();
            if !brokers.is_empty() {
                self.brokers = brokers;
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProducerError {
    #[error("send buffer full, event dropped")]
    QueueFull,
    #[error("producer closed")]
    Closed,
    #[error("kafka error: {0}")]
    Kafka(String),
    #[error("event serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Cumulative delivery counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProducerStats {
    pub sent: u64,
    pub failed: u64,
    pub dropped: u64,
}

#[derive(Debug, Default)]
struct Counters {
    sent: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> ProducerStats {
        ProducerStats {
            sent: self.sent.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

/// Event log producer.
#[async_trait]
pub trait EventProducer: Send + Sync + 'static {
    /// Hand an event to the log. In async mode this returns once the event
    /// is buffered; delivery failures are counted and logged, never
    /// returned here.
    async fn send(&self, event: CounterEvent) -> Result<(), ProducerError>;

    /// Drain buffered events; called during shutdown.
    async fn flush(&self, timeout: Duration) -> Result<(), ProducerError>;

    /// Mode label reported by health endpoints.
    fn mode(&self) -> &'static str;

    fn stats(&self) -> ProducerStats;
}

enum Command {
    Record(CounterEvent),
    Flush(oneshot::Sender<()>),
}

/// Kafka-backed producer.
pub struct KafkaProducer {
    inner: FutureProducer,
    topic: String,
    delivery: DeliveryMode,
    queue: Option<mpsc::Sender<Command>>,
    counters: Arc<Counters>,
}

impl std::fmt::Debug for KafkaProducer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KafkaProducer")
            .field("topic", &self.topic)
            .field("delivery", &self.delivery)
            .finish()
    }
}

impl KafkaProducer {
    pub fn new(config: &ProducerConfig) -> Result<Self, ProducerError> {
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", config.brokers.join(","))
            .set("message.timeout.ms", "5000")
            .set("compression.type", config.compression.as_kafka())
            .set("acks", "all")
            .set("retries", config.retries.to_string())
            .set("linger.ms", config.linger_ms.to_string())
            .set("client.id", "highpress-producer");
        if config.idempotent {
            client_config.set("enable.idempotence", "true");
        }
        let inner: FutureProducer =
            client_config.create().map_err(|e| ProducerError::Kafka(e.to_string()))?;

        let counters = Arc::new(Counters::default());
        let queue = match config.delivery {
            DeliveryMode::Sync => None,
            DeliveryMode::Async => {
                let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
                // The writer exits on its own once every sender is gone.
                tokio::spawn(batch_writer(
                    inner.clone(),
                    config.topic.clone(),
                    config.batch_size.max(1),
                    Duration::from_millis(config.linger_ms.max(1)),
                    rx,
                    counters.clone(),
                ));
                Some(tx)
            }
        };

        tracing::info!(
            topic = %config.topic,
            brokers = %config.brokers.join(","),
            delivery = ?config.delivery,
            "kafka producer ready"
        );
        Ok(Self {
            inner,
            topic: config.topic.clone(),
            delivery: config.delivery,
            queue,
            counters,
        })
    }
}

#[async_trait]
impl EventProducer for KafkaProducer {
    async fn send(&self, event: CounterEvent) -> Result<(), ProducerError> {
        match (&self.queue, self.delivery) {
            (Some(queue), DeliveryMode::Async) => {
                match queue.try_send(Command::Record(event)) {
                    Ok(()) => Ok(()),
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                        tracing::warn!("event send buffer full, dropping event");
                        Err(ProducerError::QueueFull)
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => Err(ProducerError::Closed),
                }
            }
            _ => {
                deliver(&self.inner, &self.topic, &event, &self.counters)
                    .await
                    .map_err(|e| ProducerError::Kafka(e))
            }
        }
    }

    async fn flush(&self, timeout: Duration) -> Result<(), ProducerError> {
        if let Some(queue) = &self.queue {
            let (tx, rx) = oneshot::channel();
            queue.send(Command::Flush(tx)).await.map_err(|_| ProducerError::Closed)?;
            tokio::time::timeout(timeout, rx)
                .await
                .map_err(|_| ProducerError::Kafka("flush timed out".to_owned()))?
                .map_err(|_| ProducerError::Closed)?;
        }
        Ok(())
    }

    fn mode(&self) -> &'static str {
        match self.delivery {
            DeliveryMode::Async => "kafka-async",
            DeliveryMode::Sync => "kafka-sync",
        }
    }

    fn stats(&self) -> ProducerStats {
        self.counters.snapshot()
    }
}

/// Background writer for async mode: batch by size or linger interval.
async fn batch_writer(
    producer: FutureProducer,
    topic: String,
    batch_size: usize,
    linger: Duration,
    mut queue: mpsc::Receiver<Command>,
    counters: Arc<Counters>,
) {
    let mut batch: Vec<CounterEvent> = Vec::with_capacity(batch_size);
    let mut linger_tick = tokio::time::interval(linger);
    linger_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            command = queue.recv() => {
                match command {
                    Some(Command::Record(event)) => {
                        batch.push(event);
                        if batch.len() >= batch_size {
                            dispatch(&producer, &topic, &mut batch, &counters).await;
                        }
                    }
                    Some(Command::Flush(ack)) => {
                        dispatch(&producer, &topic, &mut batch, &counters).await;
                        let _ = ack.send(());
                    }
                    None => {
                        dispatch(&producer, &topic, &mut batch, &counters).await;
                        return;
                    }
                }
            }
            _ = linger_tick.tick() => {
                if !batch.is_empty() {
                    dispatch(&producer, &topic, &mut batch, &counters).await;
                }
            }
        }
    }
}

/// Fire one batch and observe every delivery result.
async fn dispatch(
    producer: &FutureProducer,
    topic: &str,
    batch: &mut Vec<CounterEvent>,
    counters: &Counters,
) {
    if batch.is_empty() {
        return;
    }
    let mut in_flight = FuturesUnordered::new();
    for event in batch.drain(..) {
        in_flight.push(async move {
            deliver(producer, topic, &event, counters).await
        });
    }
    while let Some(result) = in_flight.next().await {
        if let Err(e) = result {
            tracing::warn!(error = %e, "event delivery failed");
        }
    }
}

async fn deliver(
    producer: &FutureProducer,
    topic: &str,
    event: &CounterEvent,
    counters: &Counters,
) -> Result<(), String> {
    let payload = match serde_json::to_vec(event) {
        Ok(payload) => payload,
        Err(e) => {
            counters.failed.fetch_add(1, Ordering::Relaxed);
            return Err(format!("serialize: {}", e));
        }
    };
    let key = event.partition_key();
    let headers = OwnedHeaders::new()
        .insert(Header { key: HEADER_EVENT_TYPE, value: Some(EVENT_TYPE_INCREMENTED) })
        .insert(Header { key: HEADER_SOURCE, value: Some(event.source.as_str()) })
        .insert(Header { key: HEADER_EVENT_ID, value: Some(event.event_id.as_str()) });
    let record = FutureRecord::to(topic).key(&key).payload(&payload).headers(headers);

    match producer.send(record, Duration::from_secs(5)).await {
        Ok(_) => {
            counters.sent.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
        Err((e, _)) => {
            counters.failed.fetch_add(1, Ordering::Relaxed);
            Err(e.to_string())
        }
    }
}

/// In-memory producer selected by `mode: mock` or `KAFKA_MODE=mock`.
#[derive(Debug, Default)]
pub struct MockProducer {
    events: std::sync::Mutex<Vec<CounterEvent>>,
    counters: Counters,
}

impl MockProducer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything sent so far, in order.
    pub fn events(&self) -> Vec<CounterEvent> {
        self.events.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).clone()
    }
}

#[async_trait]
impl EventProducer for MockProducer {
    async fn send(&self, event: CounterEvent) -> Result<(), ProducerError> {
        self.events.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).push(event);
        self.counters.sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn flush(&self, _timeout: Duration) -> Result<(), ProducerError> {
        Ok(())
    }

    fn mode(&self) -> &'static str {
        "mock"
    }

    fn stats(&self) -> ProducerStats {
        self.counters.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults_match_deployment_expectations() {
        let config = ProducerConfig::default();
        assert_eq!(config.mode, ProducerMode::Real);
        assert_eq!(config.topic, "counter-events");
        assert_eq!(config.delivery, DeliveryMode::Async);
        assert_eq!(config.batch_size, 100);
        assert!(config.idempotent);
    }

    #[test]
    fn env_overrides_select_mock_and_brokers() {
        std::env::set_var("KAFKA_MODE", "mock");
        std::env::set_var("KAFKA_BROKERS", "broker-a:9092, broker-b:9092");
        let mut config = ProducerConfig::default();
        config.apply_env();
        std::env::remove_var("KAFKA_MODE");
        std::env::remove_var("KAFKA_BROKERS");

        assert_eq!(config.mode, ProducerMode::Mock);
        assert_eq!(config.brokers, vec!["broker-a:9092", "broker-b:9092"]);
    }

    #[tokio::test]
    async fn mock_producer_records_events_in_order() {
        let producer = MockProducer::new();
        producer.send(CounterEvent::new("a", "like", 1, 1, "w")).await.unwrap();
        producer.send(CounterEvent::new("a", "like", 1, 2, "w")).await.unwrap();
        producer.flush(Duration::from_secs(1)).await.unwrap();

        let events = producer.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].new_value, 1);
        assert_eq!(events[1].new_value, 2);
        assert_eq!(producer.stats().sent, 2);
        assert_eq!(producer.mode(), "mock");
    }
}
