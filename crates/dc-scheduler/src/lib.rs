//! Dialcast Campaign Scheduler
//!
//! This crate provides the distributed scheduling/retry engine:
//! - Scheduler: reconciles running campaign workers against the database
//! - CampaignWorker: per-campaign dispatch loop with pacing and dedup
//! - CallbackConsumer: drains Call Agent outcomes and drives the retry state machine
//! - policy: pure campaign eligibility checks and request builders

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use dc_common::Campaign;
use dc_repository::{CampaignRepository, PgCampaignRepository};
use dc_store::{CoordinationStore, RedisStore};

pub mod consumer;
pub mod policy;
pub mod worker;

pub use consumer::{CallbackConsumer, ConsumerConfig};
pub use worker::{CampaignWorker, Step, WorkerConfig};

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("Database error: {0}")]
    Database(String),
    #[error("Store error: {0}")]
    Store(#[from] dc_store::StoreError),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<anyhow::Error> for SchedulerError {
    fn from(e: anyhow::Error) -> Self {
        SchedulerError::Database(e.to_string())
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Gap between reconciliation cycles.
    pub check_interval: Duration,
    /// Upper bound on concurrently running campaign workers.
    pub max_concurrent_campaigns: usize,
    /// Bounded wait for a cooperative worker stop before detaching it.
    pub stop_timeout: Duration,
    /// Knobs handed to every spawned worker.
    pub worker: WorkerConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(60),
            max_concurrent_campaigns: 10,
            stop_timeout: Duration::from_secs(5),
            worker: WorkerConfig::default(),
        }
    }
}

/// Opens the per-worker connections.
///
/// Workers never share a database pool or a store connection; a saturated
/// pool or a wedged connection stays contained to one campaign.
#[async_trait]
pub trait WorkerConnections: Send + Sync {
    async fn open_repository(&self) -> anyhow::Result<Arc<dyn CampaignRepository>>;
    async fn open_store(&self) -> anyhow::Result<Arc<dyn CoordinationStore>>;
}

/// Production connections: a fresh Postgres pool and Redis connection per worker.
pub struct PerWorkerConnections {
    pub database_url: String,
    pub redis_url: String,
}

#[async_trait]
impl WorkerConnections for PerWorkerConnections {
    async fn open_repository(&self) -> anyhow::Result<Arc<dyn CampaignRepository>> {
        Ok(Arc::new(PgCampaignRepository::connect(&self.database_url).await?))
    }

    async fn open_store(&self) -> anyhow::Result<Arc<dyn CoordinationStore>> {
        Ok(Arc::new(RedisStore::connect(&self.redis_url).await?))
    }
}

struct WorkerHandle {
    campaign_name: String,
    stop: Arc<AtomicBool>,
    finished: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    pub active_workers: usize,
    pub max_concurrent_campaigns: usize,
    pub check_interval_secs: u64,
}

/// Reconciliation loop that keeps the set of live campaign workers aligned
/// with the database.
pub struct Scheduler {
    config: SchedulerConfig,
    repository: Arc<dyn CampaignRepository>,
    connections: Arc<dyn WorkerConnections>,
    workers: Mutex<HashMap<String, WorkerHandle>>,
    running: Arc<RwLock<bool>>,
}

impl Scheduler {
    pub fn new(
        config: SchedulerConfig,
        repository: Arc<dyn CampaignRepository>,
        connections: Arc<dyn WorkerConnections>,
    ) -> Self {
        Self {
            config,
            repository,
            connections,
            workers: Mutex::new(HashMap::new()),
            running: Arc::new(RwLock::new(false)),
        }
    }

    /// Start the reconciliation cycle in a background task.
    pub async fn start(self: &Arc<Self>) {
        let mut running = self.running.write().await;
        if *running {
            warn!("Scheduler already running");
            return;
        }
        *running = true;
        drop(running);

        info!(
            check_interval_secs = self.config.check_interval.as_secs(),
            max_concurrent_campaigns = self.config.max_concurrent_campaigns,
            "Starting campaign scheduler"
        );

        let scheduler = self.clone();
        tokio::spawn(async move {
            let mut ticker = interval(scheduler.config.check_interval);
            loop {
                ticker.tick().await;
                if !*scheduler.running.read().await {
                    break;
                }
                if let Err(e) = scheduler.run_cycle().await {
                    error!(error = %e, "Error in scheduler cycle");
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
            }
        });
    }

    /// One reconciliation pass: spawn for eligible campaigns, stop for
    /// stopped ones, sweep dead and finished workers.
    pub async fn run_cycle(&self) -> Result<(), SchedulerError> {
        debug!("Starting scheduler cycle");
        self.reconcile_running().await?;
        self.reconcile_stopped().await?;
        self.sweep_exited_workers().await;
        Ok(())
    }

    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }

    pub async fn status(&self) -> SchedulerStatus {
        SchedulerStatus {
            active_workers: self.workers.lock().await.len(),
            max_concurrent_campaigns: self.config.max_concurrent_campaigns,
            check_interval_secs: self.config.check_interval.as_secs(),
        }
    }

    /// Stop the cycle loop and every worker cooperatively.
    pub async fn stop(&self) {
        *self.running.write().await = false;

        let mut workers = self.workers.lock().await;
        for worker in workers.values() {
            worker.stop.store(true, Ordering::SeqCst);
        }
        for (campaign_id, mut worker) in workers.drain() {
            if tokio::time::timeout(self.config.stop_timeout, &mut worker.handle)
                .await
                .is_err()
            {
                warn!(campaign_id = %campaign_id, "Worker did not stop in time; detaching");
            }
        }
        info!("Campaign scheduler stopped");
    }

    async fn reconcile_running(&self) -> Result<(), SchedulerError> {
        let campaigns = self.repository.get_running_campaigns().await?;
        let active = policy::filter_active_campaigns(campaigns, Utc::now());
        debug!(count = active.len(), "Eligible running campaigns");

        // Sweep first so a campaign whose worker just exited (window closed,
        // crash) is immediately eligible for respawn this cycle.
        self.sweep_exited_workers().await;

        let mut workers = self.workers.lock().await;
        let cap = self.config.max_concurrent_campaigns;
        if workers.len() >= cap {
            warn!(current = workers.len(), cap, "Worker limit reached, deferring new campaigns");
            return Ok(());
        }

        for campaign in active {
            if workers.len() >= cap {
                warn!(cap, "Worker limit reached mid-cycle, remaining campaigns deferred");
                break;
            }
            if workers.contains_key(&campaign.id) {
                continue;
            }

            let pending = self
                .repository
                .get_pending_leads_for_campaign(&campaign.id)
                .await?;
            if pending.is_empty() {
                debug!(campaign_id = %campaign.id, "No pending leads, not spawning worker");
                continue;
            }

            info!(
                campaign_id = %campaign.id,
                campaign = %campaign.name,
                pending_leads = pending.len(),
                "Starting campaign worker"
            );
            let handle = self.spawn_worker(campaign.clone());
            workers.insert(campaign.id, handle);
            metrics::counter!("scheduler.workers.spawned_total").increment(1);
        }

        metrics::gauge!("scheduler.active_workers").set(workers.len() as f64);
        Ok(())
    }

    fn spawn_worker(&self, campaign: Campaign) -> WorkerHandle {
        let stop = Arc::new(AtomicBool::new(false));
        let finished = Arc::new(AtomicBool::new(false));
        let connections = self.connections.clone();
        let worker_config = self.config.worker.clone();
        let campaign_name = campaign.name.clone();

        let stop_flag = stop.clone();
        let finished_flag = finished.clone();
        let handle = tokio::spawn(async move {
            let repository = match connections.open_repository().await {
                Ok(repository) => repository,
                Err(e) => {
                    error!(campaign_id = %campaign.id, error = %e, "Failed to open worker database handle");
                    finished_flag.store(true, Ordering::SeqCst);
                    return;
                }
            };
            let store = match connections.open_store().await {
                Ok(store) => store,
                Err(e) => {
                    error!(campaign_id = %campaign.id, error = %e, "Failed to open worker store connection");
                    finished_flag.store(true, Ordering::SeqCst);
                    return;
                }
            };

            let worker = CampaignWorker::with_signals(
                campaign,
                repository,
                store,
                worker_config,
                stop_flag,
                finished_flag,
            );
            worker.run().await;
        });

        WorkerHandle {
            campaign_name,
            stop,
            finished,
            handle,
        }
    }

    /// Remove workers that reported themselves finished (campaign gone,
    /// window closed, stop honored) and workers whose task died without
    /// reporting completion.
    async fn sweep_exited_workers(&self) {
        let mut workers = self.workers.lock().await;
        let exited: Vec<String> = workers
            .iter()
            .filter(|(_, w)| w.handle.is_finished() || w.finished.load(Ordering::SeqCst))
            .map(|(id, _)| id.clone())
            .collect();

        for campaign_id in exited {
            if let Some(mut worker) = workers.remove(&campaign_id) {
                if worker.finished.load(Ordering::SeqCst) {
                    info!(
                        campaign_id = %campaign_id,
                        campaign = %worker.campaign_name,
                        "Cleaning up finished campaign worker"
                    );
                    // The flag is set on the worker's last line; give the
                    // task a moment to actually return.
                    let _ =
                        tokio::time::timeout(Duration::from_secs(1), &mut worker.handle).await;
                } else {
                    warn!(
                        campaign_id = %campaign_id,
                        campaign = %worker.campaign_name,
                        "Dead worker detected, cleaning up"
                    );
                    metrics::counter!("scheduler.workers.died_total").increment(1);
                }
            }
        }
    }

    async fn reconcile_stopped(&self) -> Result<(), SchedulerError> {
        let stopped = self.repository.get_stopped_campaigns().await?;
        let mut workers = self.workers.lock().await;

        for campaign in stopped {
            let Some(mut worker) = workers.remove(&campaign.id) else {
                continue;
            };

            info!(
                campaign_id = %campaign.id,
                campaign = %campaign.name,
                status = campaign.status.as_str(),
                "Stopping worker for stopped campaign"
            );
            worker.stop.store(true, Ordering::SeqCst);

            if tokio::time::timeout(self.config.stop_timeout, &mut worker.handle)
                .await
                .is_err()
            {
                warn!(campaign_id = %campaign.id, "Worker did not stop in time; detaching");
            }
        }
        Ok(())
    }

}
