//! Consumer-group runner
//!
//! Pulls partitioned records under a group id with manual commits. The
//! policy is skip-and-continue: a handler failure is logged and counted,
//! and the offset is committed anyway so one bad record cannot wedge a
//! partition. Callers wanting a dead-letter queue implement it in the
//! handler.

use crate::event::CounterEvent;
use rdkafka::client::ClientContext;
use rdkafka::config::RDKafkaLogLevel;
use rdkafka::consumer::{
    BaseConsumer, CommitMode, Consumer, ConsumerContext, Rebalance, StreamConsumer,
};
use rdkafka::message::Message;
use rdkafka::ClientConfig;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Where a fresh group starts reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OffsetReset {
    Earliest,
    Latest,
}

impl OffsetReset {
    fn as_kafka(self) -> &'static str {
        match self {
            Self::Earliest => "earliest",
            Self::Latest => "latest",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerConfig {
    #[serde(default = "default_brokers")]
    pub brokers: Vec<String>,
    #[serde(default = "default_group_id")]
    pub group_id: String,
    #[serde(default = "default_topics")]
    pub topics: Vec<String>,
    #[serde(default = "default_offset_reset")]
    pub auto_offset_reset: OffsetReset,
    #[serde(default = "default_session_timeout_ms")]
    pub session_timeout_ms: u64,
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
}

fn default_brokers() -> Vec<String> {
    vec!["127.0.0.1:9092".to_owned()]
}

fn default_group_id() -> String {
    "high-go-press-analytics".to_owned()
}

fn default_topics() -> Vec<String> {
    vec![crate::event::DEFAULT_TOPIC.to_owned()]
}

fn default_offset_reset() -> OffsetReset {
    OffsetReset::Earliest
}

fn default_session_timeout_ms() -> u64 {
    10_000
}

fn default_heartbeat_interval_ms() -> u64 {
    3_000
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            brokers: default_brokers(),
            group_id: default_group_id(),
            topics: default_topics(),
            auto_offset_reset: default_offset_reset(),
            session_timeout_ms: default_session_timeout_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConsumerError {
    #[error("consumer configuration rejected: {0}")]
    Config(String),
    #[error("kafka error: {0}")]
    Kafka(String),
}

/// Cumulative handler counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ConsumerStats {
    pub processed: u64,
    pub failed: u64,
}

#[derive(Debug, Default)]
struct Counters {
    processed: AtomicU64,
    failed: AtomicU64,
}

/// Logs partition assignment changes around group rebalances.
struct RebalanceLogger;

impl ClientContext for RebalanceLogger {}

impl ConsumerContext for RebalanceLogger {
    fn pre_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance<'_>) {
        tracing::info!(?rebalance, "consumer group pre-rebalance");
    }

    fn post_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance<'_>) {
        tracing::info!(?rebalance, "consumer group post-rebalance");
    }
}

type LoggingConsumer = StreamConsumer<RebalanceLogger>;

/// Handler outcome; errors are logged and skipped.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

pub struct ConsumerGroup {
    consumer: LoggingConsumer,
    group_id: String,
    counters: Arc<Counters>,
}

impl std::fmt::Debug for ConsumerGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumerGroup").field("group_id", &self.group_id).finish()
    }
}

impl ConsumerGroup {
    pub fn new(config: &ConsumerConfig) -> Result<Self, ConsumerError> {
        let consumer: LoggingConsumer = ClientConfig::new()
            .set("group.id", &config.group_id)
            .set("bootstrap.servers", config.brokers.join(","))
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", config.auto_offset_reset.as_kafka())
            .set("session.timeout.ms", config.session_timeout_ms.to_string())
            .set("heartbeat.interval.ms", config.heartbeat_interval_ms.to_string())
            .set_log_level(RDKafkaLogLevel::Warning)
            .create_with_context(RebalanceLogger)
            .map_err(|e| ConsumerError::Config(e.to_string()))?;

        let topics: Vec<&str> = config.topics.iter().map(String::as_str).collect();
        consumer
            .subscribe(&topics)
            .map_err(|e| ConsumerError::Config(e.to_string()))?;

        tracing::info!(
            group = %config.group_id,
            topics = ?config.topics,
            offset_reset = ?config.auto_offset_reset,
            "consumer group subscribed"
        );
        Ok(Self {
            consumer,
            group_id: config.group_id.clone(),
            counters: Arc::new(Counters::default()),
        })
    }

    pub fn stats(&self) -> ConsumerStats {
        ConsumerStats {
            processed: self.counters.processed.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }

    /// Consume until `shutdown` flips. Offsets advance only after the
    /// handler returns; failed records are counted and skipped.
    pub async fn run<H, Fut>(
        &self,
        handler: H,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), ConsumerError>
    where
        H: Fn(CounterEvent) -> Fut + Send + Sync,
        Fut: Future<Output = Result<(), HandlerError>> + Send,
    {
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    tracing::info!(group = %self.group_id, "consumer group stopping");
                    return Ok(());
                }
                received = self.consumer.recv() => {
                    let message = match received {
                        Ok(message) => message,
                        Err(e) => {
                            tracing::error!(group = %self.group_id, error = %e, "consumer poll failed");
                            tokio::time::sleep(Duration::from_secs(1)).await;
                            continue;
                        }
                    };

                    match parse_event(message.payload()) {
                        Ok(event) => match handler(event).await {
                            Ok(()) => {
                                self.counters.processed.fetch_add(1, Ordering::Relaxed);
                            }
                            Err(e) => {
                                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                                tracing::error!(
                                    group = %self.group_id,
                                    partition = message.partition(),
                                    offset = message.offset(),
                                    error = %e,
                                    "handler failed, skipping record"
                                );
                            }
                        },
                        Err(e) => {
                            self.counters.failed.fetch_add(1, Ordering::Relaxed);
                            tracing::error!(
                                group = %self.group_id,
                                partition = message.partition(),
                                offset = message.offset(),
                                error = %e,
                                "malformed record, skipping"
                            );
                        }
                    }

                    // Skip-and-continue: commit past the record either way.
                    if let Err(e) = self.consumer.commit_message(&message, CommitMode::Async) {
                        tracing::warn!(group = %self.group_id, error = %e, "offset commit failed");
                    }
                }
            }
        }
    }
}

fn parse_event(payload: Option<&[u8]>) -> Result<CounterEvent, HandlerError> {
    let payload = payload.ok_or("empty record payload")?;
    Ok(serde_json::from_slice(payload)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults_follow_the_deployment_contract() {
        let config = ConsumerConfig::default();
        assert_eq!(config.group_id, "high-go-press-analytics");
        assert_eq!(config.topics, vec!["counter-events"]);
        assert_eq!(config.auto_offset_reset, OffsetReset::Earliest);
        assert_eq!(config.session_timeout_ms, 10_000);
        assert_eq!(config.heartbeat_interval_ms, 3_000);
    }

    #[test]
    fn offset_reset_maps_to_kafka_values() {
        assert_eq!(OffsetReset::Earliest.as_kafka(), "earliest");
        assert_eq!(OffsetReset::Latest.as_kafka(), "latest");
    }

    #[test]
    fn parse_event_rejects_empty_and_malformed_payloads() {
        assert!(parse_event(None).is_err());
        assert!(parse_event(Some(b"not json")).is_err());

        let event = CounterEvent::new("a", "like", 1, 1, "w");
        let payload = serde_json::to_vec(&event).unwrap();
        assert_eq!(parse_event(Some(&payload)).unwrap(), event);
    }
}
