//! Counter RPC service
//!
//! The synchronous contract is durability in the store: an acknowledged
//! increment has already committed at the KV layer. Event emission rides
//! the async producer and may lag or fail without retracting the ack.

use crate::config::BatchConfig;
use futures::future::join_all;
use highpress::{BulkheadPolicy, FabricError};
use highpress_events::{CounterEvent, EventProducer};
use highpress_kv::{counter_key, CounterStore};
use highpress_rpc::common::v1::{Status as WireStatus, Timestamp};
use highpress_rpc::counter::v1::counter_service_server::CounterService;
use highpress_rpc::counter::v1::{
    BatchGetRequest, BatchGetResponse, BatchIncrementRequest, BatchIncrementResponse,
    CounterValue, GetRequest, GetResponse, HealthRequest, HealthResponse, IncrementOperation,
    IncrementRequest, IncrementResponse, IncrementResult,
};
use highpress_rpc::status::to_status;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tonic::{Request, Response, Status};

#[derive(Clone)]
pub struct CounterWorker {
    store: Arc<dyn CounterStore>,
    producer: Arc<dyn EventProducer>,
    /// Identifier stamped into emitted events.
    source: String,
    batch: BatchConfig,
    sync_gate: BulkheadPolicy,
    emitted: Arc<AtomicU64>,
    emit_failures: Arc<AtomicU64>,
}

impl CounterWorker {
    pub fn new(
        store: Arc<dyn CounterStore>,
        producer: Arc<dyn EventProducer>,
        source: impl Into<String>,
        batch: BatchConfig,
    ) -> Self {
        Self {
            store,
            producer,
            source: source.into(),
            batch,
            sync_gate: BulkheadPolicy::new(batch.sync_concurrency.max(1)),
            emitted: Arc::new(AtomicU64::new(0)),
            emit_failures: Arc::new(AtomicU64::new(0)),
        }
    }

    fn validate(resource_id: &str, counter_type: &str) -> Result<(), FabricError> {
        if resource_id.trim().is_empty() {
            return Err(FabricError::validation("resource_id must not be empty"));
        }
        if counter_type.trim().is_empty() {
            return Err(FabricError::validation("counter_type must not be empty"));
        }
        Ok(())
    }

    /// Commit one increment and emit its event. The ack reflects the store
    /// write; emission failures are counted and logged only.
    async fn apply_increment(
        &self,
        resource_id: &str,
        counter_type: &str,
        delta: i64,
    ) -> Result<i64, FabricError> {
        Self::validate(resource_id, counter_type)?;
        let delta = if delta == 0 { 1 } else { delta };

        let key = counter_key(resource_id, counter_type);
        let value = self.store.increment(&key, delta).await?;

        let event = CounterEvent::new(resource_id, counter_type, delta, value, &self.source);
        match self.producer.send(event).await {
            Ok(()) => {
                self.emitted.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.emit_failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    key = %key,
                    error = %e,
                    "event emission failed, ack stands"
                );
            }
        }
        Ok(value)
    }

    async fn run_gated_increment(&self, op: &IncrementOperation) -> IncrementResult {
        let outcome = self
            .sync_gate
            .run(|| self.apply_increment(&op.resource_id, &op.counter_type, op.delta))
            .await;
        match outcome {
            Ok(value) => IncrementResult {
                status: Some(WireStatus::ok()),
                resource_id: op.resource_id.clone(),
                counter_type: op.counter_type.clone(),
                current_value: value,
            },
            Err(e) => IncrementResult {
                status: Some(WireStatus::error(e.kind(), e.to_string())),
                resource_id: op.resource_id.clone(),
                counter_type: op.counter_type.clone(),
                current_value: 0,
            },
        }
    }

    /// Apply an accepted batch in chunks, pausing between chunks so the
    /// store is not saturated by a single large request.
    async fn process_batch_background(self, operations: Vec<IncrementOperation>) {
        let total = operations.len();
        let mut failed = 0usize;
        let chunk_size = self.batch.async_chunk_size.max(1);
        let pause = Duration::from_millis(self.batch.chunk_pause_ms);

        let chunks: Vec<&[IncrementOperation]> = operations.chunks(chunk_size).collect();
        let last = chunks.len().saturating_sub(1);
        for (index, chunk) in chunks.into_iter().enumerate() {
            let results = join_all(chunk.iter().map(|op| self.run_gated_increment(op))).await;
            failed += results
                .iter()
                .filter(|result| !result.status.as_ref().is_some_and(|s| s.success))
                .count();
            if index != last && !pause.is_zero() {
                tokio::time::sleep(pause).await;
            }
        }
        tracing::info!(total, failed, "background batch applied");
    }

    pub fn events_emitted(&self) -> u64 {
        self.emitted.load(Ordering::Relaxed)
    }

    pub fn event_send_failures(&self) -> u64 {
        self.emit_failures.load(Ordering::Relaxed)
    }
}

#[tonic::async_trait]
impl CounterService for CounterWorker {
    async fn increment(
        &self,
        request: Request<IncrementRequest>,
    ) -> Result<Response<IncrementResponse>, Status> {
        let req = request.into_inner();
        let value = self
            .apply_increment(&req.resource_id, &req.counter_type, req.delta)
            .await
            .map_err(|e| to_status(&e))?;

        Ok(Response::new(IncrementResponse {
            status: Some(WireStatus::ok()),
            resource_id: req.resource_id,
            counter_type: req.counter_type,
            current_value: value,
            timestamp: Some(Timestamp::now()),
        }))
    }

    async fn get(&self, request: Request<GetRequest>) -> Result<Response<GetResponse>, Status> {
        let req = request.into_inner();
        Self::validate(&req.resource_id, &req.counter_type).map_err(|e| to_status(&e))?;

        let key = counter_key(&req.resource_id, &req.counter_type);
        let value = self.store.get(&key).await.map_err(|e| to_status(&e.into()))?;

        Ok(Response::new(GetResponse {
            status: Some(WireStatus::ok()),
            resource_id: req.resource_id,
            counter_type: req.counter_type,
            value,
        }))
    }

    async fn batch_get(
        &self,
        request: Request<BatchGetRequest>,
    ) -> Result<Response<BatchGetResponse>, Status> {
        let req = request.into_inner();
        if req.queries.is_empty() {
            return Ok(Response::new(BatchGetResponse {
                status: Some(WireStatus::ok()),
                counters: Vec::new(),
            }));
        }
        for query in &req.queries {
            Self::validate(&query.resource_id, &query.counter_type).map_err(|e| to_status(&e))?;
        }

        let keys: Vec<String> = req
            .queries
            .iter()
            .map(|query| counter_key(&query.resource_id, &query.counter_type))
            .collect();
        let values = self.store.batch_get(&keys).await.map_err(|e| to_status(&e.into()))?;

        let counters = req
            .queries
            .into_iter()
            .zip(values)
            .map(|(query, value)| CounterValue {
                resource_id: query.resource_id,
                counter_type: query.counter_type,
                value,
            })
            .collect();
        Ok(Response::new(BatchGetResponse { status: Some(WireStatus::ok()), counters }))
    }

    async fn batch_increment(
        &self,
        request: Request<BatchIncrementRequest>,
    ) -> Result<Response<BatchIncrementResponse>, Status> {
        let req = request.into_inner();
        if req.operations.len() > self.batch.max_operations {
            let err = FabricError::validation(format!(
                "batch of {} operations exceeds the cap of {}",
                req.operations.len(),
                self.batch.max_operations
            ));
            return Err(to_status(&err));
        }
        if req.operations.is_empty() {
            return Ok(Response::new(BatchIncrementResponse {
                status: Some(WireStatus::ok()),
                accepted: false,
                results: Vec::new(),
            }));
        }

        if req.async_mode {
            let worker = self.clone();
            let operations = req.operations;
            tokio::spawn(async move {
                worker.process_batch_background(operations).await;
            });
            return Ok(Response::new(BatchIncrementResponse {
                status: Some(WireStatus::ok()),
                accepted: true,
                results: Vec::new(),
            }));
        }

        let results =
            join_all(req.operations.iter().map(|op| self.run_gated_increment(op))).await;
        Ok(Response::new(BatchIncrementResponse {
            status: Some(WireStatus::ok()),
            accepted: false,
            results,
        }))
    }

    async fn health(
        &self,
        _request: Request<HealthRequest>,
    ) -> Result<Response<HealthResponse>, Status> {
        let store_ok = self.store.ping().await.is_ok();
        let producer_stats = self.producer.stats();

        let mut details = HashMap::new();
        details.insert("store".to_owned(), if store_ok { "ok" } else { "unavailable" }.to_owned());
        details.insert("producer_mode".to_owned(), self.producer.mode().to_owned());
        details.insert("events_emitted".to_owned(), self.events_emitted().to_string());
        details
            .insert("event_send_failures".to_owned(), self.event_send_failures().to_string());
        details.insert("producer_sent".to_owned(), producer_stats.sent.to_string());
        details.insert("producer_failed".to_owned(), producer_stats.failed.to_string());
        details.insert("producer_dropped".to_owned(), producer_stats.dropped.to_string());

        let status = if store_ok {
            WireStatus::ok()
        } else {
            WireStatus::error(highpress::ErrorKind::System, "store unreachable")
        };
        Ok(Response::new(HealthResponse { status: Some(status), details }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use highpress_events::{MockProducer, ProducerError, ProducerStats};
    use highpress_kv::MemoryStore;
    use tonic::Code;

    fn worker_with(producer: Arc<dyn EventProducer>) -> (CounterWorker, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let worker = CounterWorker::new(
            store.clone(),
            producer,
            "counter-worker-test",
            BatchConfig::default(),
        );
        (worker, store)
    }

    fn mock_pair() -> (CounterWorker, Arc<MemoryStore>, Arc<MockProducer>) {
        let producer = Arc::new(MockProducer::new());
        let (worker, store) = worker_with(producer.clone());
        (worker, store, producer)
    }

    #[derive(Debug)]
    struct FailingProducer;

    #[async_trait]
    impl EventProducer for FailingProducer {
        async fn send(&self, _event: CounterEvent) -> Result<(), ProducerError> {
            Err(ProducerError::Kafka("broker down".into()))
        }

        async fn flush(&self, _timeout: Duration) -> Result<(), ProducerError> {
            Ok(())
        }

        fn mode(&self) -> &'static str {
            "failing"
        }

        fn stats(&self) -> ProducerStats {
            ProducerStats { sent: 0, failed: 0, dropped: 0 }
        }
    }

    #[tokio::test]
    async fn increment_commits_and_emits_one_event() {
        let (worker, store, producer) = mock_pair();

        let response = worker
            .increment(Request::new(IncrementRequest {
                resource_id: "article_001".into(),
                counter_type: "like".into(),
                delta: 1,
            }))
            .await
            .unwrap()
            .into_inner();

        assert!(response.status.unwrap().success);
        assert_eq!(response.current_value, 1);
        assert_eq!(store.get(&counter_key("article_001", "like")).await.unwrap(), 1);

        let events = producer.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].partition_key(), "article_001:like");
        assert_eq!(events[0].delta, 1);
        assert_eq!(events[0].new_value, 1);
        assert_eq!(events[0].source, "counter-worker-test");
    }

    #[tokio::test]
    async fn zero_delta_counts_as_one_and_is_not_idempotent() {
        let (worker, _store, _producer) = mock_pair();

        for expected in 1..=2 {
            let response = worker
                .increment(Request::new(IncrementRequest {
                    resource_id: "a".into(),
                    counter_type: "view".into(),
                    delta: 0,
                }))
                .await
                .unwrap()
                .into_inner();
            assert_eq!(response.current_value, expected);
        }
    }

    #[tokio::test]
    async fn missing_identifiers_reject_without_side_effects() {
        let (worker, store, producer) = mock_pair();

        let err = worker
            .increment(Request::new(IncrementRequest {
                resource_id: "".into(),
                counter_type: "like".into(),
                delta: 1,
            }))
            .await
            .unwrap_err();

        assert_eq!(err.code(), Code::InvalidArgument);
        assert_eq!(store.get(&counter_key("", "like")).await.unwrap(), 0);
        assert!(producer.events().is_empty());
    }

    #[tokio::test]
    async fn event_send_failure_does_not_unwind_the_ack() {
        let (worker, store) = worker_with(Arc::new(FailingProducer));

        let response = worker
            .increment(Request::new(IncrementRequest {
                resource_id: "article_001".into(),
                counter_type: "like".into(),
                delta: 1,
            }))
            .await
            .unwrap()
            .into_inner();

        assert_eq!(response.current_value, 1);
        assert_eq!(store.get(&counter_key("article_001", "like")).await.unwrap(), 1);
        assert_eq!(worker.event_send_failures(), 1);
    }

    #[tokio::test]
    async fn get_of_unknown_counter_is_zero() {
        let (worker, _store, _producer) = mock_pair();
        let response = worker
            .get(Request::new(GetRequest {
                resource_id: "nonexistent".into(),
                counter_type: "view".into(),
            }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(response.value, 0);
        assert!(response.status.unwrap().success);
    }

    #[tokio::test]
    async fn batch_get_empty_and_repeatable() {
        let (worker, _store, _producer) = mock_pair();

        let empty = worker
            .batch_get(Request::new(BatchGetRequest { queries: Vec::new() }))
            .await
            .unwrap()
            .into_inner();
        assert!(empty.status.unwrap().success);
        assert!(empty.counters.is_empty());

        for _ in 0..5 {
            worker
                .increment(Request::new(IncrementRequest {
                    resource_id: "article_001".into(),
                    counter_type: "like".into(),
                    delta: 1,
                }))
                .await
                .unwrap();
        }

        let request = || {
            Request::new(BatchGetRequest {
                queries: vec![
                    highpress_rpc::counter::v1::CounterQuery {
                        resource_id: "article_001".into(),
                        counter_type: "like".into(),
                    },
                    highpress_rpc::counter::v1::CounterQuery {
                        resource_id: "nonexistent".into(),
                        counter_type: "view".into(),
                    },
                ],
            })
        };
        let first = worker.batch_get(request()).await.unwrap().into_inner();
        let second = worker.batch_get(request()).await.unwrap().into_inner();

        assert_eq!(first.counters.len(), 2);
        assert_eq!(first.counters[0].value, 5);
        assert_eq!(first.counters[1].value, 0);
        assert_eq!(first.counters, second.counters);
    }

    #[tokio::test]
    async fn sync_batch_aggregates_per_operation_results() {
        let (worker, _store, _producer) = mock_pair();

        let response = worker
            .batch_increment(Request::new(BatchIncrementRequest {
                operations: vec![
                    IncrementOperation {
                        resource_id: "a".into(),
                        counter_type: "like".into(),
                        delta: 2,
                    },
                    IncrementOperation {
                        resource_id: "".into(),
                        counter_type: "like".into(),
                        delta: 1,
                    },
                    IncrementOperation {
                        resource_id: "b".into(),
                        counter_type: "view".into(),
                        delta: 3,
                    },
                ],
                async_mode: false,
            }))
            .await
            .unwrap()
            .into_inner();

        assert!(!response.accepted);
        assert_eq!(response.results.len(), 3);
        assert!(response.results[0].status.as_ref().unwrap().success);
        assert_eq!(response.results[0].current_value, 2);
        assert!(!response.results[1].status.as_ref().unwrap().success);
        assert!(response.results[2].status.as_ref().unwrap().success);
        assert_eq!(response.results[2].current_value, 3);
    }

    #[tokio::test]
    async fn oversized_batch_is_rejected() {
        let (worker, _store, _producer) = mock_pair();
        let operations = (0..1_001)
            .map(|i| IncrementOperation {
                resource_id: format!("r{}", i),
                counter_type: "like".into(),
                delta: 1,
            })
            .collect();

        let err = worker
            .batch_increment(Request::new(BatchIncrementRequest {
                operations,
                async_mode: false,
            }))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);
    }

    #[tokio::test]
    async fn async_batch_is_accepted_and_applied_in_background() {
        let (worker, store, _producer) = mock_pair();

        let response = worker
            .batch_increment(Request::new(BatchIncrementRequest {
                operations: vec![IncrementOperation {
                    resource_id: "a".into(),
                    counter_type: "like".into(),
                    delta: 4,
                }],
                async_mode: true,
            }))
            .await
            .unwrap()
            .into_inner();
        assert!(response.accepted);
        assert!(response.results.is_empty());

        // The background task lands shortly after the ack.
        let key = counter_key("a", "like");
        for _ in 0..50 {
            if store.get(&key).await.unwrap() == 4 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("background batch never applied");
    }

    #[tokio::test]
    async fn health_reports_store_and_producer_details() {
        let (worker, _store, _producer) = mock_pair();
        worker
            .increment(Request::new(IncrementRequest {
                resource_id: "a".into(),
                counter_type: "like".into(),
                delta: 1,
            }))
            .await
            .unwrap();

        let response = worker.health(Request::new(HealthRequest {})).await.unwrap().into_inner();
        assert!(response.status.unwrap().success);
        assert_eq!(response.details["producer_mode"], "mock");
        assert_eq!(response.details["events_emitted"], "1");
        assert_eq!(response.details["store"], "ok");
    }
}
