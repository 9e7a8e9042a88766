//! Campaign Delivery: multi-channel drip-campaign delivery engine.
//!
//! Loads configuration, wires the storage backends, and runs the worker pool,
//! the provider health loop and the HTTP API on one node.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use campaign_api::{ApiServer, AppState};
use campaign_channels::{
    AdapterSet, HealthChecker, MemoryUsageCounter, ProviderRegistry, RedisUsageCounter,
    SimulatedTransport, UsageCounter,
};
use campaign_core::clock::system_clock;
use campaign_core::config::{AppConfig, StorageBackend};
use campaign_core::event_bus::{EventSink, TracingSink};
use campaign_ledger::{LedgerStore, MemoryLedger, RedisLedger, WebhookReconciler};
use campaign_orchestrator::{
    AudienceSource, CampaignStore, DeliveryWorkerPool, MemoryAudience, MemoryCampaignStore,
    Orchestrator, RedisCampaignStore,
};
use campaign_scheduler::{MemoryTaskStore, RedisTaskStore, TaskStore};
use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "campaign-delivery")]
#[command(about = "Multi-channel drip-campaign delivery engine")]
#[command(version)]
struct Cli {
    /// Path to a TOML config file
    #[arg(long, env = "CAMPAIGN_DELIVERY_CONFIG")]
    config: Option<String>,

    /// Node identifier (overrides config)
    #[arg(long, env = "CAMPAIGN_DELIVERY__NODE_ID")]
    node_id: Option<String>,

    /// HTTP port (overrides config)
    #[arg(long, env = "CAMPAIGN_DELIVERY__API__HTTP_PORT")]
    http_port: Option<u16>,

    /// Concurrent delivery workers (overrides config)
    #[arg(long, env = "CAMPAIGN_DELIVERY__SCHEDULER__WORKERS")]
    workers: Option<usize>,

    /// Serve the API without running delivery workers
    #[arg(long, default_value_t = false)]
    api_only: bool,
}

struct Backends {
    campaigns: Arc<dyn CampaignStore>,
    tasks: Arc<dyn TaskStore>,
    ledger: Arc<dyn LedgerStore>,
    usage: Arc<dyn UsageCounter>,
}

async fn storage(config: &AppConfig) -> anyhow::Result<Backends> {
    match config.storage.backend {
        StorageBackend::Memory => {
            warn!("Using in-memory storage; state is lost on restart");
            Ok(Backends {
                campaigns: Arc::new(MemoryCampaignStore::new()),
                tasks: Arc::new(MemoryTaskStore::new()),
                ledger: Arc::new(MemoryLedger::new()),
                usage: Arc::new(MemoryUsageCounter::new()),
            })
        }
        StorageBackend::Redis => {
            let conn = campaign_scheduler::connect(&config.redis)
                .await
                .context("Redis connection required for the redis backend")?;
            let prefix = config.redis.key_prefix.as_str();
            Ok(Backends {
                campaigns: Arc::new(RedisCampaignStore::new(conn.clone(), prefix)),
                tasks: Arc::new(RedisTaskStore::new(conn.clone(), prefix)),
                ledger: Arc::new(RedisLedger::new(conn.clone(), prefix)),
                usage: Arc::new(RedisUsageCounter::new(conn, prefix)),
            })
        }
    }
}

fn audience(config: &AppConfig) -> anyhow::Result<Arc<dyn AudienceSource>> {
    match &config.audience.seed_file {
        Some(path) => Ok(Arc::new(MemoryAudience::from_seed_file(path)?)),
        None => {
            warn!("No audience seed file configured; audiences are empty");
            Ok(Arc::new(MemoryAudience::new()))
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "campaign_delivery=info,campaign_orchestrator=info,tower_http=info".into()
            }),
        )
        .json()
        .init();

    let cli = Cli::parse();

    info!("Campaign Delivery starting up");

    let mut config = AppConfig::load(cli.config.as_deref()).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        AppConfig::default()
    });

    if let Some(node_id) = cli.node_id {
        config.node_id = node_id;
    }
    if let Some(port) = cli.http_port {
        config.api.http_port = port;
    }
    if let Some(workers) = cli.workers {
        config.scheduler.workers = workers;
    }
    config.validate().context("invalid configuration")?;

    info!(
        node_id = %config.node_id,
        backend = ?config.storage.backend,
        workers = config.scheduler.workers,
        http_port = config.api.http_port,
        providers = config.providers.len(),
        "Configuration loaded"
    );

    let clock = system_clock();
    let backends = storage(&config).await?;
    let registry = Arc::new(ProviderRegistry::from_settings(
        config.providers.clone(),
        backends.usage,
        clock.clone(),
    )?);
    // Vendor HTTP is behind the transport seam; the simulated one answers
    // like each vendor does on success.
    let adapters = AdapterSet::with_transport(Arc::new(SimulatedTransport::new()));
    let events: Arc<dyn EventSink> = Arc::new(TracingSink);

    let orchestrator = Arc::new(
        Orchestrator::new(
            backends.campaigns,
            backends.tasks,
            backends.ledger.clone(),
            registry.clone(),
            adapters.clone(),
            audience(&config)?,
            clock.clone(),
        )
        .with_event_sink(events.clone())
        .with_scheduler_config(config.scheduler.clone())
        .with_delivery_config(config.delivery.clone()),
    );
    let health = Arc::new(HealthChecker::new(registry, adapters));
    let reconciler = Arc::new(WebhookReconciler::new(backends.ledger, events, clock));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::spawn(
        health
            .clone()
            .run(Duration::from_secs(config.health.interval_secs), shutdown_rx.clone()),
    );

    let workers = if cli.api_only {
        info!("Running in API-only mode (no delivery workers)");
        None
    } else {
        let pool = Arc::new(DeliveryWorkerPool::new(
            orchestrator.clone(),
            config.node_id.clone(),
        ));
        Some(tokio::spawn(pool.run(shutdown_rx)))
    };

    let api_server = ApiServer::new(
        config.clone(),
        AppState {
            orchestrator,
            reconciler,
            health,
            node_id: config.node_id.clone(),
            start_time: Instant::now(),
        },
    );

    if let Err(e) = api_server.start_metrics() {
        error!(error = %e, "Failed to start metrics exporter");
    }

    info!("Campaign Delivery is ready to serve traffic");

    tokio::select! {
        result = api_server.start_http() => {
            if let Err(e) = result {
                error!(error = %e, "HTTP server stopped");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
        }
    }

    let _ = shutdown_tx.send(true);
    if let Some(handle) = workers {
        if let Err(e) = handle.await {
            error!(error = %e, "Worker pool task panicked");
        }
    }
    info!("Campaign Delivery stopped");
    Ok(())
}
