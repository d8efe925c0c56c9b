use clap::Parser;
use highpress_analytics::{AggregateStore, AnalyticsConfig, AnalyticsWorker};
use highpress_events::ConsumerGroup;
use highpress_registry::{EtcdRegistry, Registration, Registry};
use highpress_rpc::analytics::v1::analytics_service_server::AnalyticsServiceServer;
use highpress_rpc::ANALYTICS_SERVICE;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::watch;
use tracing::{info, warn};

const MAX_MESSAGE_SIZE: usize = 4 * 1024 * 1024;

#[derive(Debug, Parser)]
#[command(name = "highpress-analytics", about = "Analytics worker for the highpress fabric")]
struct Args {
    /// Configuration file (extension optional, may be absent).
    #[arg(long, default_value = "config/analytics")]
    config: String,
    /// Serve without registering in the service registry.
    #[arg(long)]
    no_register: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "highpress_analytics=info,highpress=info".into()),
        )
        .init();

    let args = Args::parse();
    let config = AnalyticsConfig::load(&args.config)?;
    info!(listen = %config.listen_addr, "starting analytics worker");

    let aggregates = Arc::new(AggregateStore::new());
    let handler_errors = Arc::new(AtomicU64::new(0));
    let worker = AnalyticsWorker::new(aggregates.clone(), handler_errors.clone());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Event consumption feeds the aggregates.
    let consumer = Arc::new(ConsumerGroup::new(&config.consumer)?);
    let consume_task = {
        let consumer = consumer.clone();
        let aggregates = aggregates.clone();
        let handler_errors = handler_errors.clone();
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            let handler = move |event: highpress_events::CounterEvent| {
                let aggregates = aggregates.clone();
                let handler_errors = handler_errors.clone();
                async move {
                    if event.resource_id.is_empty() || event.counter_type.is_empty() {
                        handler_errors.fetch_add(1, Ordering::Relaxed);
                        return Err("event missing counter identifiers".into());
                    }
                    aggregates.apply(&event);
                    Ok(())
                }
            };
            if let Err(e) = consumer.run(handler, shutdown).await {
                warn!(error = %e, "consumer loop terminated");
            }
        })
    };

    // Periodic revalidation against the durable store.
    let revalidate_task = {
        let aggregates = aggregates.clone();
        let kv = config.kv.clone();
        let period = Duration::from_secs(config.revalidate_secs.max(1));
        let mut shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            let store = match highpress_kv::build_store(&kv).await {
                Ok(store) => store,
                Err(e) => {
                    warn!(error = %e, "revalidation store unavailable, running cache-only");
                    return;
                }
            };
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => aggregates.reconcile(store.as_ref()).await,
                    _ = shutdown.changed() => return,
                }
            }
        })
    };

    let registration =
        Registration::new(ANALYTICS_SERVICE, config.advertise_address.clone(), config.port())
            .with_tags(vec!["v2".into(), "microservice".into(), "analytics".into()]);
    let instance_id = registration.id.clone();
    let registry: Option<Arc<EtcdRegistry>> = if args.no_register {
        None
    } else {
        match EtcdRegistry::connect(config.discovery.clone()).await {
            Ok(registry) => {
                let registry = Arc::new(registry);
                registry.register(registration).await?;
                Some(registry)
            }
            Err(e) => {
                warn!(error = %e, "registry unavailable, serving unregistered");
                None
            }
        }
    };

    let addr = config.listen_addr.parse()?;
    info!(%addr, "analytics worker listening");
    tonic::transport::Server::builder()
        .add_service(
            AnalyticsServiceServer::new(worker)
                .max_decoding_message_size(MAX_MESSAGE_SIZE)
                .max_encoding_message_size(MAX_MESSAGE_SIZE),
        )
        .serve_with_shutdown(addr, shutdown_signal())
        .await?;

    if let Some(registry) = registry {
        if let Err(e) = registry.deregister(&instance_id).await {
            warn!(error = %e, "deregistration failed");
        }
    }
    let _ = shutdown_tx.send(true);
    let _ = tokio::time::timeout(Duration::from_secs(5), consume_task).await;
    revalidate_task.abort();

    let stats = consumer.stats();
    info!(
        processed = stats.processed,
        failed = stats.failed,
        handler_errors = handler_errors.load(Ordering::Relaxed),
        "analytics worker stopped"
    );
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
