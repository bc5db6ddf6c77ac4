//! Scheduler reconciliation tests with live workers over the in-memory
//! backends.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use dc_common::{Campaign, CampaignStatus, Lead};
use dc_repository::{CampaignRepository, MemoryCampaignRepository};
use dc_scheduler::{Scheduler, SchedulerConfig, WorkerConfig, WorkerConnections};
use dc_store::{CoordinationStore, MemoryStore};

fn campaign(id: &str, status: CampaignStatus) -> Campaign {
    Campaign {
        id: id.to_string(),
        tenant_id: "tenant-1".to_string(),
        name: format!("{id}-name"),
        status,
        start_time: None,
        end_time: None,
        script_id: None,
        call_interval: None,
        description: None,
        voice_id: None,
        email: None,
        max_call_time: None,
        time_of_day: None,
        max_callback: Some(3),
        callback_conditions: None,
    }
}

fn lead(id: &str, campaign_id: &str) -> Lead {
    Lead {
        id: id.to_string(),
        phone_number: format!("+8490{id}"),
        name: None,
        tenant_id: Some("tenant-1".to_string()),
        campaign_id: Some(campaign_id.to_string()),
    }
}

/// Test double: every "connection" is a handle to the same shared backends.
struct SharedConnections {
    repository: Arc<MemoryCampaignRepository>,
    store: Arc<MemoryStore>,
}

#[async_trait]
impl WorkerConnections for SharedConnections {
    async fn open_repository(&self) -> anyhow::Result<Arc<dyn CampaignRepository>> {
        Ok(self.repository.clone())
    }

    async fn open_store(&self) -> anyhow::Result<Arc<dyn CoordinationStore>> {
        Ok(self.store.clone())
    }
}

fn test_config(max_concurrent: usize) -> SchedulerConfig {
    SchedulerConfig {
        check_interval: Duration::from_secs(60),
        max_concurrent_campaigns: max_concurrent,
        stop_timeout: Duration::from_secs(2),
        worker: WorkerConfig {
            idle_sleep: Duration::from_millis(50),
            error_sleep: Duration::from_millis(100),
            ..Default::default()
        },
    }
}

fn scheduler(
    max_concurrent: usize,
) -> (Arc<Scheduler>, Arc<MemoryCampaignRepository>, Arc<MemoryStore>) {
    let repository = Arc::new(MemoryCampaignRepository::new());
    let store = Arc::new(MemoryStore::new());
    let connections = Arc::new(SharedConnections {
        repository: repository.clone(),
        store: store.clone(),
    });
    let scheduler = Arc::new(Scheduler::new(
        test_config(max_concurrent),
        repository.clone(),
        connections,
    ));
    (scheduler, repository, store)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cycle_spawns_worker_that_dispatches() {
    let (scheduler, repository, store) = scheduler(10);
    repository.upsert_campaign(campaign("camp-1", CampaignStatus::Running));
    repository.add_lead(lead("lead-1", "camp-1"));

    scheduler.run_cycle().await.unwrap();
    assert_eq!(scheduler.status().await.active_workers, 1);

    let requests = store
        .get_call_requests(Duration::from_millis(500))
        .await
        .unwrap();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].campaign_id, "camp-1");
    assert_eq!(requests[0].lead_id, "lead-1");

    // Another cycle must not double up on the same campaign.
    scheduler.run_cycle().await.unwrap();
    assert_eq!(scheduler.status().await.active_workers, 1);

    scheduler.stop().await;
    assert_eq!(scheduler.status().await.active_workers, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrency_cap_defers_excess_campaigns() {
    let (scheduler, repository, _store) = scheduler(1);
    for id in ["camp-1", "camp-2"] {
        repository.upsert_campaign(campaign(id, CampaignStatus::Running));
        repository.add_lead(lead(&format!("lead-{id}"), id));
    }

    scheduler.run_cycle().await.unwrap();
    assert_eq!(scheduler.status().await.active_workers, 1);

    scheduler.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn campaign_without_leads_gets_no_worker() {
    let (scheduler, repository, _store) = scheduler(10);
    repository.upsert_campaign(campaign("camp-1", CampaignStatus::Running));

    scheduler.run_cycle().await.unwrap();
    assert_eq!(scheduler.status().await.active_workers, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn paused_campaign_stops_its_worker() {
    let (scheduler, repository, store) = scheduler(10);
    repository.upsert_campaign(campaign("camp-1", CampaignStatus::Running));
    repository.add_lead(lead("lead-1", "camp-1"));

    scheduler.run_cycle().await.unwrap();
    assert_eq!(scheduler.status().await.active_workers, 1);
    // Let the worker emit its one request before pausing.
    let _ = store.get_call_requests(Duration::from_millis(500)).await;

    repository.upsert_campaign(campaign("camp-1", CampaignStatus::Paused));
    scheduler.run_cycle().await.unwrap();
    assert_eq!(scheduler.status().await.active_workers, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn worker_for_vanished_campaign_is_reaped() {
    let (scheduler, repository, _store) = scheduler(10);
    repository.upsert_campaign(campaign("camp-1", CampaignStatus::Running));
    repository.add_lead(lead("lead-1", "camp-1"));

    scheduler.run_cycle().await.unwrap();
    assert_eq!(scheduler.status().await.active_workers, 1);

    repository.remove_campaign("camp-1");
    // The worker notices on its next iteration and reports itself finished.
    tokio::time::sleep(Duration::from_millis(300)).await;

    scheduler.run_cycle().await.unwrap();
    assert_eq!(scheduler.status().await.active_workers, 0);
}
