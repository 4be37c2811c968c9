//! Gateway service entry point.
//!
//! WebSocket messaging gateway; one of several stateless instances sharing a
//! partitioned event log.

use anyhow::Result;
use event_log::{EventLog, MemoryLog, NatsLog};
use gateway::ws_server::run_stale_reaper;
use gateway::{
    create_router, AppState, ConnectionRegistry, FanoutPublisher, GatewayConfig, GroupConsumer,
    HttpMembership, LogBackend, MembershipResolver, StaticMembership,
};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Starting Gateway service");

    let config = GatewayConfig::from_env()?;
    config.log_summary();

    PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], config.metrics_port))
        .install()?;
    info!("Prometheus metrics server started on port {}", config.metrics_port);

    let log: Arc<dyn EventLog> = match config.log_backend {
        LogBackend::Nats => Arc::new(NatsLog::connect(&config.nats_url, config.nats_log()).await?),
        LogBackend::Memory => {
            warn!("Using the in-process log: events never leave this instance");
            Arc::new(MemoryLog::new(config.log_partitions))
        }
    };

    let members: Arc<dyn MembershipResolver> = match &config.members_url {
        Some(url) => Arc::new(HttpMembership::new(url.clone(), config.receive_timeout)?),
        None => Arc::new(StaticMembership::new(config.static_members.clone())),
    };

    let registry = Arc::new(ConnectionRegistry::new());
    let publisher = Arc::new(FanoutPublisher::new(log.clone(), members, config.publisher()));
    let consumer = Arc::new(GroupConsumer::new(
        registry.clone(),
        log.clone(),
        config.consumer(),
    ));

    // Join the consumer group before accepting connections
    let (consumer_shutdown_tx, consumer_shutdown_rx) = mpsc::channel(1);
    let consumer_handle = consumer.spawn(consumer_shutdown_rx).await?;

    let (reaper_shutdown_tx, reaper_shutdown_rx) = mpsc::channel(1);
    let reaper_handle = tokio::spawn(run_stale_reaper(
        registry.clone(),
        config.ping_interval,
        config.stale_after,
        reaper_shutdown_rx,
    ));

    let state = Arc::new(AppState {
        instance_id: config.instance_id.clone(),
        registry,
        publisher,
        config: config.endpoint(),
    });
    let app = create_router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.http_port));
    let listener = TcpListener::bind(addr).await?;
    info!("Gateway {} listening on {}", config.instance_id, addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shutting down consumer...");
    let _ = consumer_shutdown_tx.send(()).await;
    let _ = reaper_shutdown_tx.send(()).await;
    if let Err(e) = consumer_handle.await {
        error!("Consumer task failed: {:?}", e);
    }
    let _ = reaper_handle.await;

    info!("Gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received terminate signal"),
    }
}
