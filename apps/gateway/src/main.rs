//! Arrakis Shard Gateway
//!
//! This is a scalable Discord gateway that:
//! - Runs every shard this process owns as its own state machine
//! - Shares identify buckets and sessions through NATS key-value when available
//! - Publishes dispatch events to NATS JetStream and routes bus commands back
//! - Exposes health/ready endpoints and Prometheus metrics

use anyhow::Result;
use arrakis_shard_gateway::config::GatewayConfig;
use arrakis_shard_gateway::events::{EventSink, NullSink};
use arrakis_shard_gateway::gateway::{DiscordBootstrap, Gateway};
use arrakis_shard_gateway::health::{self, AppState};
use arrakis_shard_gateway::identify::NatsLock;
use arrakis_shard_gateway::metrics::GatewayMetrics;
use arrakis_shard_gateway::nats::{self, NatsPublisher};
use arrakis_shard_gateway::session::NatsSessionStore;
use arrakis_shard_gateway::shard::{ShardContext, ShardState, WebSocketConnector};
use arrakis_shard_gateway::Cluster;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first to get log level
    let gateway_config = GatewayConfig::from_env()?;

    // Initialize tracing with configured log level
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(format!("arrakis_shard_gateway={}", gateway_config.log_level).parse()?)
                .add_directive("twilight_http=info".parse()?)
                .add_directive("async_nats=warn".parse()?),
        )
        .json()
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        mode = gateway_config.sharding.name(),
        encoding = %gateway_config.encoding,
        intents = gateway_config.intents.bits(),
        "Starting Arrakis Shard Gateway"
    );

    // Initialize metrics
    let metrics = Arc::new(GatewayMetrics::install()?);
    info!("Prometheus metrics initialized");

    // Connect to NATS if configured
    let nats = if let Some(ref url) = gateway_config.nats_url {
        match NatsPublisher::connect(url).await {
            Ok(publisher) => {
                metrics.set_nats_connected(true);
                Some(publisher)
            }
            Err(e) => {
                error!(error = %e, "Failed to connect to NATS - running in local mode");
                metrics.set_nats_connected(false);
                None
            }
        }
    } else {
        info!("No NATS_URL configured - running in local mode");
        None
    };

    let bootstrap = Arc::new(DiscordBootstrap::new(
        gateway_config.discord_token.clone(),
        gateway_config.api_proxy.clone(),
    ));
    let mut builder = Gateway::builder(bootstrap);
    if let Some(ref nats) = nats {
        let js = nats.jetstream();
        match NatsSessionStore::open(js, &gateway_config.session_bucket).await {
            Ok(store) => builder = builder.sessions(Arc::new(store)),
            Err(e) => warn!(error = %e, "Session bucket unavailable, sessions stay in memory"),
        }
        match NatsLock::open(js, &gateway_config.identify_bucket).await {
            Ok(lock) => builder = builder.identify_lock(Arc::new(lock)),
            Err(e) => warn!(error = %e, "Identify lease bucket unavailable, buckets stay local"),
        }
    }

    let gateway = match builder.build().await {
        Ok(gateway) => Arc::new(gateway),
        Err(e) => {
            error!(error = %e, "Gateway bootstrap failed, not starting any shard");
            return Err(e.into());
        }
    };

    let cluster_id = match gateway_config.sharding {
        arrakis_shard_gateway::ShardingMode::Clustered { cluster_id, .. } => cluster_id,
        _ => 0,
    };
    let shard_state = ShardState::new(cluster_id);

    let sink: Arc<dyn EventSink> = match nats {
        Some(ref nats) => Arc::clone(nats) as Arc<dyn EventSink>,
        None => Arc::new(NullSink),
    };
    let settings = gateway_config.shard_settings(&gateway.info().url);
    let ctx = ShardContext::new(Arc::clone(&gateway), Arc::new(WebSocketConnector))
        .with_sink(sink)
        .with_filter(gateway_config.events.clone())
        .with_metrics(Arc::clone(&metrics))
        .with_state(shard_state.clone());

    let cluster = Arc::new(Cluster::spawn(ctx, settings, &gateway_config.sharding)?);
    info!(
        cluster_id,
        total_shards = cluster.total_shards(),
        shard_count = cluster.len(),
        "Shard cluster created"
    );

    // Route bus commands to shards
    let commands = match nats {
        Some(ref nats) => {
            let js = nats.jetstream().clone();
            let subject = gateway_config.commands_subject.clone();
            let cluster = Arc::clone(&cluster);
            let metrics = Arc::clone(&metrics);
            Some(tokio::spawn(async move {
                nats::ensure_streams(&js, &subject).await?;
                let consumer = nats::commands::consumer(&js, &subject).await?;
                nats::commands::run(consumer, cluster, metrics).await
            }))
        }
        None => None,
    };

    // Start health server
    let app_state = AppState {
        shard_state,
        nats: nats.clone(),
        metrics: Arc::clone(&metrics),
    };

    let health_router = health::router(app_state);
    let addr: SocketAddr = ([0, 0, 0, 0], gateway_config.http_port).into();

    info!(port = gateway_config.http_port, "Starting HTTP server");

    let http_server = axum::serve(
        tokio::net::TcpListener::bind(addr).await?,
        health_router,
    );

    // Run until the HTTP server dies or a signal arrives
    tokio::select! {
        result = http_server => {
            if let Err(e) = result {
                error!(error = %e, "HTTP server error");
            }
        }
        _ = shutdown_signal() => {
            info!("Shutdown signal received");
        }
    }

    // Graceful shutdown
    info!("Shutting down gateway...");

    if let Some(commands) = commands {
        commands.abort();
    }
    cluster.destroy().await;

    if let Some(ref nats) = nats {
        nats.close().await;
    }

    info!("Gateway shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
