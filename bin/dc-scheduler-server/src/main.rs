//! Dialcast Campaign Scheduler Server

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{routing::get, Json, Router};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::info;

use dc_config::AppConfig;
use dc_repository::PgCampaignRepository;
use dc_scheduler::{
    CallbackConsumer, ConsumerConfig, PerWorkerConnections, Scheduler, SchedulerConfig,
    WorkerConfig,
};
use dc_store::RedisStore;

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    scheduler_running: bool,
    active_workers: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dc_common::logging::init_logging("dc-scheduler-server");

    info!("Starting Dialcast campaign scheduler");

    let config = AppConfig::load()?;
    info!(
        check_interval_secs = config.scheduler.check_interval_secs,
        max_concurrent_campaigns = config.scheduler.max_concurrent_campaigns,
        "Scheduler configuration loaded"
    );

    let repository = Arc::new(PgCampaignRepository::connect(&config.database.url).await?);
    info!("Connected to campaign database");

    // The consumer owns its own store connection, independent of any worker.
    let consumer_store = Arc::new(RedisStore::connect(&config.redis.url).await?);
    info!("Connected to coordination store");

    let (shutdown_tx, _) = broadcast::channel(1);
    let consumer = CallbackConsumer::new(
        consumer_store,
        ConsumerConfig {
            default_retry_interval_secs: config.scheduler.default_retry_interval_secs,
            ..Default::default()
        },
    );
    tokio::spawn(consumer.run(shutdown_tx.subscribe()));

    let scheduler_config = SchedulerConfig {
        check_interval: Duration::from_secs(config.scheduler.check_interval_secs),
        max_concurrent_campaigns: config.scheduler.max_concurrent_campaigns,
        stop_timeout: Duration::from_secs(5),
        worker: WorkerConfig {
            default_max_attempts: config.scheduler.max_retry_attempts,
            default_retry_interval_secs: config.scheduler.default_retry_interval_secs,
            ..Default::default()
        },
    };
    let connections = Arc::new(PerWorkerConnections {
        database_url: config.database.url.clone(),
        redis_url: config.redis.url.clone(),
    });

    let scheduler = Arc::new(Scheduler::new(scheduler_config, repository, connections));
    scheduler.start().await;

    let scheduler_health = scheduler.clone();
    let app = Router::new()
        .route(
            "/q/health",
            get(move || {
                let scheduler = scheduler_health.clone();
                async move {
                    let running = scheduler.is_running().await;
                    let status = scheduler.status().await;
                    Json(HealthResponse {
                        status: if running { "UP".to_string() } else { "DOWN".to_string() },
                        scheduler_running: running,
                        active_workers: status.active_workers,
                    })
                }
            }),
        )
        .route("/q/health/live", get(|| async { Json(serde_json::json!({"status": "UP"})) }))
        .route("/q/health/ready", get(|| async { Json(serde_json::json!({"status": "UP"})) }));

    let addr = SocketAddr::from(([0, 0, 0, 0], config.http.port));
    info!(?addr, "HTTP server starting");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(scheduler, shutdown_tx))
        .await?;

    info!("Scheduler server stopped");
    Ok(())
}

async fn shutdown_signal(scheduler: Arc<Scheduler>, shutdown_tx: broadcast::Sender<()>) {
    tokio::signal::ctrl_c().await.expect("Failed to install CTRL+C handler");
    info!("Shutdown signal received");
    scheduler.stop().await;
    let _ = shutdown_tx.send(());
}
