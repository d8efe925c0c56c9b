//! Resilient counter client
//!
//! Every outbound RPC goes channel-manager first, then through the
//! resilience stack: a fresh channel is checked out per attempt, the call
//! outcome is reported back into the pool, and failures come back
//! classified with the target and request id attached.

use crate::metrics::Metrics;
use highpress::{FabricError, FallbackPolicy, Fingerprint, ResilienceStack, StackStats};
use highpress_pool::ChannelManager;
use highpress_rpc::counter::v1::counter_service_client::CounterServiceClient;
use highpress_rpc::counter::v1::{
    BatchGetRequest, CounterQuery, GetRequest, HealthRequest, IncrementRequest,
};
use highpress_rpc::status::classify_status;
use highpress_rpc::COUNTER_SERVICE;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tonic::transport::Channel;

const MAX_MESSAGE_SIZE: usize = 4 * 1024 * 1024;

#[derive(Debug, Clone, Serialize)]
pub struct IncrementData {
    pub resource_id: String,
    pub counter_type: String,
    pub current_value: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CounterValueData {
    pub resource_id: String,
    pub counter_type: String,
    pub value: i64,
}

pub struct CounterClient {
    pools: Arc<ChannelManager>,
    stack: ResilienceStack,
    /// Cache-backed degradation for reads; mutations never degrade.
    get_fallback: Option<FallbackPolicy<i64>>,
    metrics: Arc<Metrics>,
}

impl CounterClient {
    pub fn new(
        pools: Arc<ChannelManager>,
        stack: ResilienceStack,
        get_fallback: Option<FallbackPolicy<i64>>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self { pools, stack, get_fallback, metrics }
    }

    pub fn stack_stats(&self) -> StackStats {
        self.stack.stats()
    }

    fn rpc(channel: Channel) -> CounterServiceClient<Channel> {
        CounterServiceClient::new(channel)
            .max_decoding_message_size(MAX_MESSAGE_SIZE)
            .max_encoding_message_size(MAX_MESSAGE_SIZE)
    }

    fn observe(&self, request_id: &str, err: FabricError) -> FabricError {
        self.metrics
            .rpc_failures
            .with_label_values(&[COUNTER_SERVICE, err.kind().as_str()])
            .inc();
        err.with_request_id(request_id)
    }

    pub async fn increment(
        &self,
        request_id: &str,
        resource_id: &str,
        counter_type: &str,
        delta: i64,
    ) -> Result<IncrementData, FabricError> {
        let pools = self.pools.clone();
        let resource_id = resource_id.to_owned();
        let counter_type = counter_type.to_owned();

        let result = self
            .stack
            .execute("Increment", move || {
                let pools = pools.clone();
                let resource_id = resource_id.clone();
                let counter_type = counter_type.clone();
                async move {
                    let (channel, endpoint) =
                        pools.checkout(COUNTER_SERVICE).await.map_err(FabricError::from)?;
                    let mut client = Self::rpc(channel);
                    let outcome = client
                        .increment(IncrementRequest { resource_id, counter_type, delta })
                        .await;
                    match outcome {
                        Ok(response) => {
                            pools.report_outcome(COUNTER_SERVICE, &endpoint, true).await;
                            Ok(response.into_inner())
                        }
                        Err(status) => {
                            pools.report_outcome(COUNTER_SERVICE, &endpoint, false).await;
                            Err(classify_status(status))
                        }
                    }
                }
            })
            .await;

        result
            .map(|response| IncrementData {
                resource_id: response.resource_id,
                counter_type: response.counter_type,
                current_value: response.current_value,
            })
            .map_err(|e| self.observe(request_id, e))
    }

    pub async fn get(
        &self,
        request_id: &str,
        resource_id: &str,
        counter_type: &str,
    ) -> Result<i64, FabricError> {
        let pools = self.pools.clone();
        let owned_resource = resource_id.to_owned();
        let owned_type = counter_type.to_owned();

        let operation = move || {
            let pools = pools.clone();
            let resource_id = owned_resource.clone();
            let counter_type = owned_type.clone();
            async move {
                let (channel, endpoint) =
                    pools.checkout(COUNTER_SERVICE).await.map_err(FabricError::from)?;
                let mut client = Self::rpc(channel);
                let outcome = client.get(GetRequest { resource_id, counter_type }).await;
                match outcome {
                    Ok(response) => {
                        pools.report_outcome(COUNTER_SERVICE, &endpoint, true).await;
                        Ok(response.into_inner().value)
                    }
                    Err(status) => {
                        pools.report_outcome(COUNTER_SERVICE, &endpoint, false).await;
                        Err(classify_status(status))
                    }
                }
            }
        };

        let result = match &self.get_fallback {
            Some(fallback) => {
                let fingerprint =
                    Fingerprint::new(format!("counter.get:{}:{}", resource_id, counter_type));
                self.stack.execute_with_fallback("Get", fingerprint, fallback, operation).await
            }
            None => self.stack.execute("Get", operation).await,
        };
        result.map_err(|e| self.observe(request_id, e))
    }

    pub async fn batch_get(
        &self,
        request_id: &str,
        queries: Vec<(String, String)>,
    ) -> Result<Vec<CounterValueData>, FabricError> {
        let pools = self.pools.clone();
        let queries = Arc::new(queries);

        let result = self
            .stack
            .execute("BatchGet", move || {
                let pools = pools.clone();
                let queries = queries.clone();
                async move {
                    let (channel, endpoint) =
                        pools.checkout(COUNTER_SERVICE).await.map_err(FabricError::from)?;
                    let mut client = Self::rpc(channel);
                    let request = BatchGetRequest {
                        queries: queries
                            .iter()
                            .map(|(resource_id, counter_type)| CounterQuery {
                                resource_id: resource_id.clone(),
                                counter_type: counter_type.clone(),
                            })
                            .collect(),
                    };
                    let outcome = client.batch_get(request).await;
                    match outcome {
                        Ok(response) => {
                            pools.report_outcome(COUNTER_SERVICE, &endpoint, true).await;
                            Ok(response.into_inner())
                        }
                        Err(status) => {
                            pools.report_outcome(COUNTER_SERVICE, &endpoint, false).await;
                            Err(classify_status(status))
                        }
                    }
                }
            })
            .await;

        result
            .map(|response| {
                response
                    .counters
                    .into_iter()
                    .map(|counter| CounterValueData {
                        resource_id: counter.resource_id,
                        counter_type: counter.counter_type,
                        value: counter.value,
                    })
                    .collect()
            })
            .map_err(|e| self.observe(request_id, e))
    }

    /// Counter-worker health, for the gateway's own health endpoint.
    pub async fn health(&self, request_id: &str) -> Result<HashMap<String, String>, FabricError> {
        let pools = self.pools.clone();
        let result = self
            .stack
            .execute("Health", move || {
                let pools = pools.clone();
                async move {
                    let (channel, endpoint) =
                        pools.checkout(COUNTER_SERVICE).await.map_err(FabricError::from)?;
                    let mut client = Self::rpc(channel);
                    match client.health(HealthRequest {}).await {
                        Ok(response) => {
                            pools.report_outcome(COUNTER_SERVICE, &endpoint, true).await;
                            Ok(response.into_inner().details)
                        }
                        Err(status) => {
                            pools.report_outcome(COUNTER_SERVICE, &endpoint, false).await;
                            Err(classify_status(status))
                        }
                    }
                }
            })
            .await;
        result.map_err(|e| self.observe(request_id, e))
    }
}
