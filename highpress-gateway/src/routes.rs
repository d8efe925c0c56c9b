//! HTTP surface of the gateway
//!
//! Thin adapters: bind the request, call through the resilient client,
//! translate error kinds to HTTP statuses. Every request gets a generated
//! request id that rides error envelopes and logs.

use crate::client::CounterClient;
use crate::error::{success, ApiError};
use crate::metrics::Metrics;
use axum::extract::rejection::JsonRejection;
use axum::extract::{MatchedPath, Path, Request, State};
use axum::http::header::CONTENT_TYPE;
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use highpress_pool::ChannelManager;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub counter: Arc<CounterClient>,
    pub pools: Arc<ChannelManager>,
    pub metrics: Arc<Metrics>,
    pub started: Instant,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/counter/increment", post(increment))
        .route("/api/v1/counter/{resource_id}/{counter_type}", get(get_counter))
        .route("/api/v1/counter/batch", post(batch_get))
        .route("/api/v1/health", get(health))
        .route("/metrics", get(metrics_text))
        .route("/api/v1/system/grpc-pools", get(pool_stats))
        .layer(middleware::from_fn_with_state(state.clone(), track_request))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn track_request(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let path = request
        .extensions()
        .get::<MatchedPath>()
        .map(|matched| matched.as_str().to_owned())
        .unwrap_or_else(|| request.uri().path().to_owned());
    let started = Instant::now();

    let response = next.run(request).await;

    state
        .metrics
        .http_requests
        .with_label_values(&[&path, response.status().as_str()])
        .inc();
    state
        .metrics
        .http_duration
        .with_label_values(&[&path])
        .observe(started.elapsed().as_secs_f64());
    response
}

fn new_request_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn require_ids(resource_id: &str, counter_type: &str) -> Result<(), ApiError> {
    if resource_id.trim().is_empty() || counter_type.trim().is_empty() {
        return Err(ApiError::validation("resource_id and counter_type are required"));
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
struct IncrementBody {
    #[serde(default)]
    resource_id: String,
    #[serde(default)]
    counter_type: String,
    #[serde(default)]
    delta: i64,
}

async fn increment(
    State(state): State<AppState>,
    payload: Result<Json<IncrementBody>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(body) = payload.map_err(|rejection| ApiError::validation(rejection.to_string()))?;
    require_ids(&body.resource_id, &body.counter_type)?;

    let request_id = new_request_id();
    let data = state
        .counter
        .increment(&request_id, &body.resource_id, &body.counter_type, body.delta)
        .await
        .map_err(ApiError::from)?;
    Ok(success(data))
}

async fn get_counter(
    State(state): State<AppState>,
    Path((resource_id, counter_type)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    require_ids(&resource_id, &counter_type)?;

    let request_id = new_request_id();
    let value = state
        .counter
        .get(&request_id, &resource_id, &counter_type)
        .await
        .map_err(ApiError::from)?;
    Ok(success(json!({
        "resource_id": resource_id,
        "counter_type": counter_type,
        "value": value,
    })))
}

#[derive(Debug, Deserialize)]
struct BatchBody {
    #[serde(default)]
    queries: Vec<BatchQuery>,
}

#[derive(Debug, Deserialize)]
struct BatchQuery {
    #[serde(default)]
    resource_id: String,
    #[serde(default)]
    counter_type: String,
}

#[derive(Debug, Serialize)]
struct BatchData {
    counters: Vec<crate::client::CounterValueData>,
    total: usize,
}

async fn batch_get(
    State(state): State<AppState>,
    payload: Result<Json<BatchBody>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(body) = payload.map_err(|rejection| ApiError::validation(rejection.to_string()))?;
    if body.queries.is_empty() {
        return Ok(success(BatchData { counters: Vec::new(), total: 0 }));
    }
    for query in &body.queries {
        require_ids(&query.resource_id, &query.counter_type)?;
    }

    let request_id = new_request_id();
    let queries: Vec<(String, String)> = body
        .queries
        .into_iter()
        .map(|query| (query.resource_id, query.counter_type))
        .collect();
    let counters =
        state.counter.batch_get(&request_id, queries).await.map_err(ApiError::from)?;
    let total = counters.len();
    Ok(success(BatchData { counters, total }))
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let request_id = new_request_id();
    // Best-effort probe of the counter worker; the gateway itself is
    // healthy either way.
    let counter_worker = match state.counter.health(&request_id).await {
        Ok(_) => "ok",
        Err(_) => "unreachable",
    };

    success(json!({
        "service": "high-go-press-gateway",
        "uptime_seconds": state.started.elapsed().as_secs(),
        "counter_worker": counter_worker,
    }))
}

async fn metrics_text(State(state): State<AppState>) -> Response {
    match state.metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [(CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

async fn pool_stats(State(state): State<AppState>) -> impl IntoResponse {
    let pools = state.pools.stats().await;
    let resilience = state.counter.stack_stats();
    success(json!({
        "pools": pools,
        "resilience": resilience,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use highpress::{
        Backoff, FallbackPolicy, FallbackStrategy, InstantSleeper, Jitter, ResilienceStack,
        RetryPolicy,
    };
    use highpress_pool::PoolConfig;
    use highpress_registry::StaticRegistry;
    use highpress_rpc::COUNTER_SERVICE;
    use http_body_util::BodyExt;
    use std::time::Duration;
    use tower::util::ServiceExt;

    async fn test_state() -> AppState {
        let registry = Arc::new(StaticRegistry::new());
        let pools = Arc::new(ChannelManager::new(
            registry,
            PoolConfig { grace_delay_ms: 5, refresh_interval_ms: 100, ..PoolConfig::default() },
        ));
        pools.register_service(COUNTER_SERVICE).await;

        let retry = RetryPolicy::builder()
            .max_attempts(2)
            .unwrap()
            .backoff(Backoff::new(Duration::from_millis(1), 1.0, Duration::from_millis(1)).unwrap())
            .with_jitter(Jitter::None)
            .with_sleeper(InstantSleeper)
            .build();
        let stack = ResilienceStack::builder(COUNTER_SERVICE).retry(retry).build();
        let fallback = FallbackPolicy::builder(FallbackStrategy::Cache).build();

        let metrics = Arc::new(Metrics::new().unwrap());
        let counter =
            Arc::new(CounterClient::new(pools.clone(), stack, Some(fallback), metrics.clone()));
        AppState { counter, pools, metrics, started: Instant::now() }
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post_json(uri: &str, body: &str) -> Request {
        axum::http::Request::builder()
            .method("POST")
            .uri(uri)
            .header(CONTENT_TYPE, "application/json")
            .body(axum::body::Body::from(body.to_owned()))
            .unwrap()
    }

    fn get_req(uri: &str) -> Request {
        axum::http::Request::builder()
            .method("GET")
            .uri(uri)
            .body(axum::body::Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn missing_identifiers_return_validation_envelope() {
        let app = router(test_state().await);
        let response = app
            .oneshot(post_json(
                "/api/v1/counter/increment",
                r#"{"resource_id": "", "counter_type": "like", "delta": 1}"#,
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["status"], "error");
        assert_eq!(body["code"], "validation");
    }

    #[tokio::test]
    async fn malformed_json_is_a_validation_error() {
        let app = router(test_state().await);
        let response =
            app.oneshot(post_json("/api/v1/counter/increment", "{not json")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["status"], "error");
    }

    #[tokio::test]
    async fn increment_without_healthy_instances_maps_to_503() {
        let app = router(test_state().await);
        let response = app
            .oneshot(post_json(
                "/api/v1/counter/increment",
                r#"{"resource_id": "article_001", "counter_type": "like", "delta": 1}"#,
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body = body_json(response).await;
        assert_eq!(body["status"], "error");
        assert_eq!(body["code"], "network");
    }

    #[tokio::test]
    async fn empty_batch_succeeds_without_calling_the_backend() {
        let app = router(test_state().await);
        let response =
            app.oneshot(post_json("/api/v1/counter/batch", r#"{"queries": []}"#)).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "success");
        assert_eq!(body["data"]["total"], 0);
    }

    #[tokio::test]
    async fn health_stays_up_when_the_worker_is_unreachable() {
        let app = router(test_state().await);
        let response = app.oneshot(get_req("/api/v1/health")).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "success");
        assert_eq!(body["data"]["counter_worker"], "unreachable");
    }

    #[tokio::test]
    async fn pool_introspection_lists_tracked_services() {
        let app = router(test_state().await);
        let response = app.oneshot(get_req("/api/v1/system/grpc-pools")).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["data"]["pools"][0]["service"], COUNTER_SERVICE);
        assert!(body["data"]["resilience"]["circuit_breaker"].is_object());
    }

    #[tokio::test]
    async fn metrics_endpoint_serves_prometheus_text() {
        let state = test_state().await;
        let app = router(state.clone());

        // Drive one request through so a counter exists.
        let _ = app.clone().oneshot(get_req("/api/v1/health")).await.unwrap();
        let response = app.oneshot(get_req("/metrics")).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let content_type = response.headers()[CONTENT_TYPE].to_str().unwrap().to_owned();
        assert!(content_type.starts_with("text/plain"));
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("highpress_http_requests_total"));
    }

    #[tokio::test]
    async fn counter_path_parameters_bind_in_order() {
        let app = router(test_state().await);
        // No backend: classified as network, but the route itself binds.
        let response =
            app.oneshot(get_req("/api/v1/counter/article_001/like")).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
