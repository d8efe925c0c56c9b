use clap::Parser;
use highpress_counter::{CounterWorker, WorkerConfig};
use highpress_registry::{EtcdRegistry, Registration, Registry};
use highpress_rpc::counter::v1::counter_service_server::CounterServiceServer;
use highpress_rpc::COUNTER_SERVICE;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{info, warn};

const MAX_MESSAGE_SIZE: usize = 4 * 1024 * 1024;

#[derive(Debug, Parser)]
#[command(name = "highpress-counter", about = "Counter worker for the highpress fabric")]
struct Args {
    /// Configuration file (extension optional, may be absent).
    #[arg(long, default_value = "config/counter")]
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
                .unwrap_or_else(|_| "highpress_counter=info,highpress=info".into()),
        )
        .init();

    let args = Args::parse();
    let config = WorkerConfig::load(&args.config)?;
    info!(listen = %config.listen_addr, "starting counter worker");

    let store = highpress_kv::build_store(&config.kv).await?;
    let producer = highpress_events::build_producer(config.producer.clone())?;

    let registration =
        Registration::new(COUNTER_SERVICE, config.advertise_address.clone(), config.port())
            .with_tags(vec!["v2".into(), "microservice".into(), "counter".into()]);
    let instance_id = registration.id.clone();
    let worker = CounterWorker::new(store, producer.clone(), instance_id.clone(), config.batch);

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
    info!(%addr, "counter worker listening");
    tonic::transport::Server::builder()
        .add_service(
            CounterServiceServer::new(worker)
                .max_decoding_message_size(MAX_MESSAGE_SIZE)
                .max_encoding_message_size(MAX_MESSAGE_SIZE),
        )
        .serve_with_shutdown(addr, shutdown_signal())
        .await?;

    // Orderly shutdown: drop out of discovery first, then flush events.
    if let Some(registry) = registry {
        if let Err(e) = registry.deregister(&instance_id).await {
            warn!(error = %e, "deregistration failed");
        }
    }
    if let Err(e) = producer.flush(Duration::from_secs(config.drain_secs)).await {
        warn!(error = %e, "producer flush incomplete");
    }
    info!("counter worker stopped");
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
