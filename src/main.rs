mod api;
mod config;
mod delivery_log;
mod dispatch;
mod error;
mod gateway;
mod logging;
mod memory_store;
mod metrics;
mod models;
mod pg_store;
mod registry;
mod scheduler;
mod segment;
mod store;
mod template;
mod tenant;

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::{signal, sync::oneshot};
use tracing::{error, info};

use config::{Config, StoreBackend};
use delivery_log::DeliveryLog;
use dispatch::Dispatcher;
use gateway::{FcmGateway, PushGateway};
use memory_store::MemoryStore;
use pg_store::PgStore;
use registry::Registry;
use scheduler::Scheduler;
use segment::SegmentEngine;
use store::Store;

fn main() -> Result<()> {
    // Build custom runtime with explicit thread configuration
    let worker_threads = std::env::var("TOKIO_WORKER_THREADS")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or_else(num_cpus::get);

    println!("Starting with {} Tokio worker threads", worker_threads);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(worker_threads)
        .enable_all()
        .build()?;

    runtime.block_on(async {
        // Initialize logging first thing
        logging::setup_logging();

        // Load environment variables from .env file if present
        dotenv::dotenv().ok();

        info!("Starting notification dispatcher");

        let config = Config::from_env()?;
        info!(
            backend = ?config.store_backend,
            multi_tenant = config.multi_tenant,
            retention_days = config.retention_days,
            "Configuration loaded"
        );
        let run_once = std::env::args().nth(1).as_deref() == Some("dispatch-due");

        let gateway = Arc::new(FcmGateway::new(
            config.fcm_project_id.clone(),
            config.fcm_credentials.clone(),
            config.fcm_api_url.clone(),
            config.fcm_iid_url.clone(),
            config.gateway_timeout,
        )?);

        match config.store_backend {
            StoreBackend::Postgres => {
                let database_url = config
                    .database_url
                    .as_deref()
                    .context("DATABASE_URL must be set")?;
                let pool =
                    pg_store::init_db_pool(database_url, config.database_max_connections).await?;
                run(config, Arc::new(PgStore::new(pool)), gateway, run_once).await
            }
            StoreBackend::Memory => {
                info!("Using in-memory store; data is lost on restart");
                run(config, Arc::new(MemoryStore::new()), gateway, run_once).await
            }
        }
    })
}

async fn run<S, G>(config: Config, store: Arc<S>, gateway: Arc<G>, run_once: bool) -> Result<()>
where
    S: Store + Send + Sync + 'static,
    G: PushGateway + Send + Sync + 'static,
{
    let segments = Arc::new(SegmentEngine::new(
        store.clone(),
        Arc::new(config.segment_fields.clone()),
    ));
    let registry = Arc::new(Registry::new(store.clone(), gateway.clone()));
    let dispatcher = Arc::new(Dispatcher::new(
        store.clone(),
        gateway.clone(),
        segments.clone(),
        config.dispatch.clone(),
    ));
    let scheduler = Arc::new(Scheduler::new(
        store.clone(),
        dispatcher.clone(),
        registry.clone(),
    ));

    // One-shot mode for external cron triggers
    if run_once {
        let report = scheduler
            .dispatch_due(config.due_limit, config.due_tolerance_hours)
            .await?;
        info!(dispatched = report.dispatched(), errors = report.errors, "Due dispatch run complete");
        return Ok(());
    }

    // Create shutdown signal
    let (shutdown_tx, shutdown_rx) = oneshot::channel();

    let scheduler_handle = tokio::spawn(scheduler.clone().run(
        config.scheduler_interval,
        config.due_limit,
        config.due_tolerance_hours,
        shutdown_rx,
    ));

    let api_state = Arc::new(api::ApiState {
        log: DeliveryLog::new(store.clone()),
        store,
        registry,
        segments,
        dispatcher,
        scheduler,
        multi_tenant: config.multi_tenant,
        default_tenant: config.default_tenant(),
        due_limit: config.due_limit,
        due_tolerance_hours: config.due_tolerance_hours,
    });
    let api_router = api::create_api_router(api_state, config.features);

    let listener = tokio::net::TcpListener::bind(&config.api_bind_address)
        .await
        .with_context(|| format!("failed to bind {}", config.api_bind_address))?;
    info!("Starting API server on {}", config.api_bind_address);

    let api_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, api_router).await {
            error!("API server error: {}", e);
        }
    });

    // Handle graceful shutdown
    signal::ctrl_c().await?;
    info!("Received shutdown signal, shutting down gracefully");

    let _ = shutdown_tx.send(());
    let _ = scheduler_handle.await;
    api_handle.abort();

    info!("Shutdown complete");
    Ok(())
}
