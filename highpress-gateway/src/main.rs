use clap::Parser;
use highpress::{FallbackPolicy, FallbackStrategy, ResilienceStack};
use highpress_gateway::{router, AppState, CounterClient, GatewayConfig, Metrics};
use highpress_pool::ChannelManager;
use highpress_registry::{EtcdRegistry, Registration, Registry, StaticRegistry};
use highpress_rpc::{ANALYTICS_SERVICE, COUNTER_SERVICE, GATEWAY_SERVICE};
use std::future::IntoFuture;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::signal;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(name = "highpress-gateway", about = "HTTP edge gateway for the highpress fabric")]
struct Args {
    /// Configuration file (extension optional, may be absent).
    #[arg(long, default_value = "config/gateway")]
    config: String,
    /// Static counter backends (`host:port`, repeatable) instead of the
    /// registry; for local runs and tests.
    #[arg(long = "static-counter")]
    static_counters: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "highpress_gateway=info,highpress=info,tower_http=info".into()
            }),
        )
        .init();

    let args = Args::parse();
    let config = GatewayConfig::load(&args.config)?;
    info!(listen = %config.listen_addr, "starting gateway");

    // Registry-driven pools are the production path; a static set keeps
    // local runs registry-free.
    let mut registered_instance: Option<(Arc<EtcdRegistry>, String)> = None;
    let registry: Arc<dyn Registry> = if args.static_counters.is_empty() {
        let etcd = Arc::new(EtcdRegistry::connect(config.discovery.clone()).await?);
        let registration =
            Registration::new(GATEWAY_SERVICE, config.advertise_address.clone(), config.port())
                .with_tags(vec!["v2".into(), "microservice".into(), "gateway".into()]);
        let instance_id = registration.id.clone();
        etcd.register(registration).await?;
        registered_instance = Some((etcd.clone(), instance_id));
        etcd
    } else {
        let instances = args
            .static_counters
            .iter()
            .enumerate()
            .filter_map(|(index, hostport)| {
                let (address, port) = hostport.rsplit_once(':')?;
                Some(highpress_registry::ServiceInstance {
                    service: COUNTER_SERVICE.to_owned(),
                    instance_id: format!("static-{}", index),
                    address: address.to_owned(),
                    port: port.parse().ok()?,
                    tags: vec!["static".to_owned()],
                    health: highpress_registry::HealthStatus::Passing,
                })
            })
            .collect();
        Arc::new(StaticRegistry::new().with_service(COUNTER_SERVICE, instances))
    };

    let pools = Arc::new(ChannelManager::new(registry, config.pool.clone()));
    pools.register_service(COUNTER_SERVICE).await;
    pools.register_service(ANALYTICS_SERVICE).await;

    let mut stack_builder = ResilienceStack::builder(COUNTER_SERVICE)
        .timeout(Duration::from_millis(config.call_timeout_ms))?;
    stack_builder = if config.circuit_breaker.enabled {
        stack_builder.circuit_breaker(config.circuit_breaker.build())
    } else {
        stack_builder.no_circuit_breaker()
    };
    stack_builder = if config.retry.enabled {
        stack_builder.retry(config.retry.build()?)
    } else {
        stack_builder.no_retry()
    };
    let stack = stack_builder.build();

    let get_fallback = if config.fallback.enabled {
        let mut builder = FallbackPolicy::builder(FallbackStrategy::Cache)
            .cache_ttl(Duration::from_millis(config.fallback.cache_ttl_ms))
            .trigger_window(Duration::from_millis(config.fallback.trigger_window_ms));
        for trigger in &config.fallback.trigger_conditions {
            builder = builder.trigger(trigger.build());
        }
        Some(builder.build())
    } else {
        None
    };

    let metrics = Arc::new(Metrics::new()?);
    let counter =
        Arc::new(CounterClient::new(pools.clone(), stack, get_fallback, metrics.clone()));
    let state = AppState { counter, pools: pools.clone(), metrics, started: Instant::now() };

    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    info!(addr = %config.listen_addr, "gateway listening");

    let (signal_tx, signal_rx) = tokio::sync::oneshot::channel::<()>();
    let server = axum::serve(listener, router(state)).with_graceful_shutdown(async move {
        shutdown_signal().await;
        let _ = signal_tx.send(());
    });
    let mut server_task = tokio::spawn(server.into_future());

    // Orderly shutdown: leave the registry first, allow the drain window,
    // then tear the pools down.
    tokio::select! {
        joined = &mut server_task => {
            joined??;
        }
        _ = signal_rx => {
            if let Some((etcd, instance_id)) = &registered_instance {
                if let Err(e) = etcd.deregister(instance_id).await {
                    warn!(error = %e, "deregistration failed");
                }
            }
            match tokio::time::timeout(Duration::from_secs(config.drain_secs), &mut server_task)
                .await
            {
                Ok(joined) => joined??,
                Err(_) => {
                    warn!(
                        drain_secs = config.drain_secs,
                        "drain window elapsed, aborting in-flight requests"
                    );
                    server_task.abort();
                }
            }
        }
    }
    pools.close().await;
    info!("gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("shutdown signal received, draining");
}
