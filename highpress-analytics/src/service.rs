//! Analytics RPC service

use crate::aggregates::{Aggregate, AggregateStore};
use highpress::FabricError;
use highpress_rpc::analytics::v1::analytics_service_server::AnalyticsService;
use highpress_rpc::analytics::v1::{
    CounterAggregate, CounterStatsRequest, CounterStatsResponse, HealthRequest, HealthResponse,
    SystemMetricsRequest, SystemMetricsResponse, TopCountersRequest, TopCountersResponse,
};
use highpress_rpc::common::v1::{Status as WireStatus, Timestamp};
use highpress_rpc::status::to_status;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tonic::{Request, Response, Status};

const DEFAULT_PAGE_SIZE: i32 = 10;
const MAX_PAGE_SIZE: i32 = 100;

#[derive(Clone)]
pub struct AnalyticsWorker {
    aggregates: Arc<AggregateStore>,
    started: Instant,
    handler_errors: Arc<AtomicU64>,
}

impl AnalyticsWorker {
    pub fn new(aggregates: Arc<AggregateStore>, handler_errors: Arc<AtomicU64>) -> Self {
        Self { aggregates, started: Instant::now(), handler_errors }
    }

    fn to_wire(aggregate: Aggregate) -> CounterAggregate {
        CounterAggregate {
            resource_id: aggregate.resource_id,
            counter_type: aggregate.counter_type,
            value: aggregate.value,
            events: aggregate.events,
            last_updated: Some(Timestamp {
                seconds: aggregate.last_updated.timestamp(),
                nanos: aggregate.last_updated.timestamp_subsec_nanos() as i32,
            }),
        }
    }
}

#[tonic::async_trait]
impl AnalyticsService for AnalyticsWorker {
    async fn get_top_counters(
        &self,
        request: Request<TopCountersRequest>,
    ) -> Result<Response<TopCountersResponse>, Status> {
        let req = request.into_inner();
        let page = req.page.max(1);
        let page_size = if req.page_size <= 0 {
            DEFAULT_PAGE_SIZE
        } else {
            req.page_size.min(MAX_PAGE_SIZE)
        };

        let result =
            self.aggregates.top(&req.counter_type, page as usize, page_size as usize);
        Ok(Response::new(TopCountersResponse {
            status: Some(WireStatus::ok()),
            counters: result.counters.into_iter().map(Self::to_wire).collect(),
            page,
            page_size,
            has_next: result.has_next,
            total: result.total as i64,
        }))
    }

    async fn get_counter_stats(
        &self,
        request: Request<CounterStatsRequest>,
    ) -> Result<Response<CounterStatsResponse>, Status> {
        let req = request.into_inner();
        if req.resource_id.trim().is_empty() || req.counter_type.trim().is_empty() {
            let err = FabricError::validation("resource_id and counter_type must not be empty");
            return Err(to_status(&err));
        }

        // Unknown counters read as zero, matching the store contract.
        let stats = match self.aggregates.get(&req.resource_id, &req.counter_type) {
            Some(aggregate) => Self::to_wire(aggregate),
            None => CounterAggregate {
                resource_id: req.resource_id,
                counter_type: req.counter_type,
                value: 0,
                events: 0,
                last_updated: None,
            },
        };
        Ok(Response::new(CounterStatsResponse {
            status: Some(WireStatus::ok()),
            stats: Some(stats),
        }))
    }

    async fn get_system_metrics(
        &self,
        _request: Request<SystemMetricsRequest>,
    ) -> Result<Response<SystemMetricsResponse>, Status> {
        Ok(Response::new(SystemMetricsResponse {
            status: Some(WireStatus::ok()),
            total_counters: self.aggregates.counter_count() as i64,
            total_events: self.aggregates.total_events() as i64,
            uptime_seconds: self.started.elapsed().as_secs() as i64,
            handler_errors: self.handler_errors.load(Ordering::Relaxed) as i64,
        }))
    }

    async fn health(
        &self,
        _request: Request<HealthRequest>,
    ) -> Result<Response<HealthResponse>, Status> {
        let mut details = HashMap::new();
        details.insert("counters_tracked".to_owned(), self.aggregates.counter_count().to_string());
        details.insert("events_consumed".to_owned(), self.aggregates.total_events().to_string());
        details.insert(
            "handler_errors".to_owned(),
            self.handler_errors.load(Ordering::Relaxed).to_string(),
        );
        details
            .insert("uptime_seconds".to_owned(), self.started.elapsed().as_secs().to_string());
        Ok(Response::new(HealthResponse { status: Some(WireStatus::ok()), details }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use highpress_events::CounterEvent;
    use tonic::Code;

    fn worker() -> AnalyticsWorker {
        AnalyticsWorker::new(Arc::new(AggregateStore::new()), Arc::new(AtomicU64::new(0)))
    }

    fn seeded_worker(counters: usize) -> AnalyticsWorker {
        let worker = worker();
        for i in 0..counters {
            worker.aggregates.apply(&CounterEvent::new(
                format!("r{:02}", i),
                "like",
                1,
                i as i64,
                "w",
            ));
        }
        worker
    }

    #[tokio::test]
    async fn top_counters_defaults_page_and_size() {
        let worker = seeded_worker(15);
        let response = worker
            .get_top_counters(Request::new(TopCountersRequest {
                counter_type: "like".into(),
                page: 0,
                page_size: 0,
            }))
            .await
            .unwrap()
            .into_inner();

        assert_eq!(response.page, 1);
        assert_eq!(response.page_size, 10);
        assert_eq!(response.counters.len(), 10);
        assert!(response.has_next);
        assert_eq!(response.total, 15);
        // Ranked by value descending.
        assert_eq!(response.counters[0].value, 14);
    }

    #[tokio::test]
    async fn out_of_range_page_is_empty_without_next() {
        let worker = seeded_worker(5);
        let response = worker
            .get_top_counters(Request::new(TopCountersRequest {
                counter_type: "like".into(),
                page: 3,
                page_size: 10,
            }))
            .await
            .unwrap()
            .into_inner();
        assert!(response.counters.is_empty());
        assert!(!response.has_next);
        assert_eq!(response.total, 5);
    }

    #[tokio::test]
    async fn counter_stats_returns_zero_for_unknown() {
        let worker = worker();
        let response = worker
            .get_counter_stats(Request::new(CounterStatsRequest {
                resource_id: "nonexistent".into(),
                counter_type: "view".into(),
            }))
            .await
            .unwrap()
            .into_inner();

        let stats = response.stats.unwrap();
        assert_eq!(stats.value, 0);
        assert_eq!(stats.events, 0);
        assert!(stats.last_updated.is_none());
    }

    #[tokio::test]
    async fn counter_stats_validates_identifiers() {
        let worker = worker();
        let err = worker
            .get_counter_stats(Request::new(CounterStatsRequest {
                resource_id: "".into(),
                counter_type: "view".into(),
            }))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);
    }

    #[tokio::test]
    async fn system_metrics_reports_totals() {
        let worker = seeded_worker(3);
        worker.handler_errors.fetch_add(2, Ordering::Relaxed);

        let response = worker
            .get_system_metrics(Request::new(SystemMetricsRequest {}))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(response.total_counters, 3);
        assert_eq!(response.total_events, 3);
        assert_eq!(response.handler_errors, 2);
    }

    #[tokio::test]
    async fn health_carries_consumption_details() {
        let worker = seeded_worker(2);
        let response = worker.health(Request::new(HealthRequest {})).await.unwrap().into_inner();
        assert!(response.status.unwrap().success);
        assert_eq!(response.details["counters_tracked"], "2");
        assert_eq!(response.details["events_consumed"], "2");
    }
}
