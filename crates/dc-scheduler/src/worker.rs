//! Per-campaign dispatch worker.
//!
//! One worker owns one campaign: it refreshes the campaign record each
//! iteration, paces dials, prefers due retries over new leads, enforces
//! dedup through the coordination store (with a local fallback set), and
//! emits at most one call request per iteration so pacing stays exact.
//!
//! A worker that finds itself outside the campaign's time-of-day window
//! exits; the scheduler respawns it when the window reopens.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use dc_common::{Campaign, Lead, RetryPayload};
use dc_repository::CampaignRepository;
use dc_store::CoordinationStore;

use crate::{policy, SchedulerError};

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Minimum gap between two dials of the same lead.
    pub lead_redial_gap_secs: i64,
    /// Sleep when there is nothing to dispatch.
    pub idle_sleep: Duration,
    /// Sleep after an iteration error.
    pub error_sleep: Duration,
    /// Floor for the pacing sleep.
    pub min_pace_sleep: Duration,
    /// Due retries claimed per iteration.
    pub claim_batch: usize,
    /// Attempt ceiling when the campaign has no `max_callback`.
    pub default_max_attempts: u32,
    /// Retry delay hint when nothing more specific is known.
    pub default_retry_interval_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            lead_redial_gap_secs: 60,
            idle_sleep: Duration::from_secs(5),
            error_sleep: Duration::from_secs(10),
            min_pace_sleep: Duration::from_millis(500),
            claim_batch: 10,
            default_max_attempts: 3,
            default_retry_interval_secs: 300,
        }
    }
}

/// Outcome of a single worker iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// One call request was emitted.
    Dispatched,
    /// Nothing to do right now.
    Idle,
    /// Campaign pacing gap not yet elapsed; wait this long.
    Paced(Duration),
    /// Current time left every allowed window; the worker exits.
    OutOfWindow,
    /// Campaign record disappeared; the worker exits.
    CampaignGone,
}

pub struct CampaignWorker {
    campaign: Campaign,
    repository: Arc<dyn CampaignRepository>,
    store: Arc<dyn CoordinationStore>,
    config: WorkerConfig,
    stop: Arc<AtomicBool>,
    finished: Arc<AtomicBool>,
    last_dial_at: Option<DateTime<Utc>>,
    last_lead_dial: HashMap<String, DateTime<Utc>>,
    /// Guards against a store hiccup producing duplicate in-flight dials.
    local_inflight: HashSet<String>,
    processed_count: u64,
}

impl CampaignWorker {
    pub fn new(
        campaign: Campaign,
        repository: Arc<dyn CampaignRepository>,
        store: Arc<dyn CoordinationStore>,
        config: WorkerConfig,
    ) -> Self {
        Self::with_signals(
            campaign,
            repository,
            store,
            config,
            Arc::new(AtomicBool::new(false)),
            Arc::new(AtomicBool::new(false)),
        )
    }

    /// Construct with externally owned stop/finished flags (the scheduler
    /// keeps clones for cooperative shutdown and reaping).
    pub fn with_signals(
        campaign: Campaign,
        repository: Arc<dyn CampaignRepository>,
        store: Arc<dyn CoordinationStore>,
        config: WorkerConfig,
        stop: Arc<AtomicBool>,
        finished: Arc<AtomicBool>,
    ) -> Self {
        Self {
            campaign,
            repository,
            store,
            config,
            stop,
            finished,
            last_dial_at: None,
            last_lead_dial: HashMap::new(),
            local_inflight: HashSet::new(),
            processed_count: 0,
        }
    }

    pub fn processed_count(&self) -> u64 {
        self.processed_count
    }

    /// Drive iterations until stopped or the campaign no longer wants us.
    pub async fn run(mut self) {
        info!(campaign = %self.campaign.name, "Campaign worker started");

        while !self.stop.load(Ordering::SeqCst) {
            match self.run_once(Utc::now()).await {
                Ok(Step::Dispatched) => continue,
                Ok(Step::Paced(wait)) => {
                    debug!(campaign = %self.campaign.name, wait_ms = wait.as_millis() as u64, "Pacing next call");
                    tokio::time::sleep(wait).await;
                }
                Ok(Step::Idle) => {
                    debug!(campaign = %self.campaign.name, "Nothing to dispatch, waiting");
                    tokio::time::sleep(self.config.idle_sleep).await;
                }
                Ok(Step::OutOfWindow) => {
                    info!(campaign = %self.campaign.name, "Outside time-of-day window, worker exiting");
                    break;
                }
                Ok(Step::CampaignGone) => {
                    info!(campaign = %self.campaign.name, "Campaign not found, worker exiting");
                    break;
                }
                Err(e) => {
                    error!(campaign = %self.campaign.name, error = %e, "Error in campaign worker");
                    tokio::time::sleep(self.config.error_sleep).await;
                }
            }
        }

        self.finished.store(true, Ordering::SeqCst);
        info!(
            campaign = %self.campaign.name,
            processed = self.processed_count,
            "Campaign worker finished"
        );
    }

    /// One iteration: refresh, gate, pace, then attempt a single dispatch.
    pub async fn run_once(&mut self, now: DateTime<Utc>) -> Result<Step, SchedulerError> {
        match self.repository.get_campaign_by_id(&self.campaign.id).await {
            Ok(Some(latest)) => self.campaign = latest,
            Ok(None) => return Ok(Step::CampaignGone),
            Err(e) => return Err(SchedulerError::Database(e.to_string())),
        }

        if !policy::within_time_of_day(&self.campaign, now) {
            return Ok(Step::OutOfWindow);
        }

        if let Some(wait) = self.pace_remaining(now) {
            return Ok(Step::Paced(wait));
        }

        if self.dispatch_once(now).await? {
            self.last_dial_at = Some(now);
            Ok(Step::Dispatched)
        } else {
            Ok(Step::Idle)
        }
    }

    /// Remaining campaign-level pacing gap, if any.
    fn pace_remaining(&self, now: DateTime<Utc>) -> Option<Duration> {
        let interval = self.campaign.call_interval.filter(|i| *i > 0)?;
        let last = self.last_dial_at?;

        let remaining = chrono::Duration::seconds(interval) - (now - last);
        if remaining > chrono::Duration::zero() {
            let wait = remaining.to_std().unwrap_or(self.config.min_pace_sleep);
            Some(wait.max(self.config.min_pace_sleep))
        } else {
            None
        }
    }

    /// Try due retries first, then new leads. At most one emission.
    async fn dispatch_once(&mut self, now: DateTime<Utc>) -> Result<bool, SchedulerError> {
        if self.dispatch_due_retry(now).await? {
            return Ok(true);
        }

        let leads = self
            .repository
            .get_pending_leads_for_campaign(&self.campaign.id)
            .await
            .map_err(|e| SchedulerError::Database(e.to_string()))?;

        for lead in leads {
            if self.should_dial(&lead, now).await? {
                self.dial_lead(&lead, now).await?;
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Claim a batch of due retries and dispatch the first viable one.
    /// Stale entries (target already succeeded) are finalized in passing;
    /// claimed-but-undispatched ids go back into the index due immediately,
    /// so a claim is never lossy.
    async fn dispatch_due_retry(&mut self, now: DateTime<Utc>) -> Result<bool, SchedulerError> {
        let campaign_id = self.campaign.id.clone();
        let claimed = self
            .store
            .claim_due_retries(&campaign_id, self.config.claim_batch)
            .await?;

        let mut dispatched = false;
        for call_id in claimed {
            if dispatched {
                self.requeue_claimed(&call_id).await?;
                continue;
            }

            let fields = self.store.get_call_payload(&call_id).await?;
            let Some(payload) = RetryPayload::from_fields(&fields) else {
                warn!(call_id = %call_id, "Claimed retry has no usable payload, dropping");
                self.store.save_success_and_finalize(&call_id).await?;
                continue;
            };

            // A success callback may have landed between the due check and
            // our claim; honor it and clean the leftovers.
            if self.store.is_lead_success(&campaign_id, &payload.lead_id).await?
                || self.store.is_phone_success(&campaign_id, &payload.phone).await?
            {
                self.store.save_success_and_finalize(&call_id).await?;
                self.store.remove_retry(&campaign_id, &call_id).await?;
                info!(
                    campaign_id = %campaign_id,
                    lead_id = %payload.lead_id,
                    call_id = %call_id,
                    "Retry target already succeeded, finalized"
                );
                continue;
            }

            let request = policy::build_retry_request(&self.campaign, &payload, now);
            self.store.send_call_request(&request).await?;
            self.store.mark_inprogress(&campaign_id, &payload.lead_id).await?;
            self.store
                .mark_phone_inprogress(&campaign_id, &payload.phone)
                .await?;
            self.local_inflight.insert(payload.lead_id.clone());
            // The fresh envelope supersedes the consumed payload.
            self.store.save_success_and_finalize(&call_id).await?;

            metrics::counter!("worker.retries_dispatched_total").increment(1);
            info!(
                campaign = %self.campaign.name,
                lead_id = %payload.lead_id,
                phone = %payload.phone,
                attempt = payload.attempt,
                call_id = %request.call_id,
                "Retry request dispatched"
            );
            dispatched = true;
        }

        Ok(dispatched)
    }

    /// Put a claimed-but-unused retry back, due now.
    async fn requeue_claimed(&self, call_id: &str) -> Result<(), SchedulerError> {
        let fields = self.store.get_call_payload(call_id).await?;
        if fields.is_empty() {
            return Ok(());
        }
        let as_strings: std::collections::HashMap<String, String> = fields
            .into_iter()
            .map(|(k, v)| {
                let value = match v {
                    serde_json::Value::String(s) => s,
                    other => other.to_string(),
                };
                (k, value)
            })
            .collect();
        self.store
            .save_failure_and_schedule_retry(&self.campaign.id, call_id, as_strings, 0)
            .await?;
        Ok(())
    }

    /// Dedup and rate-limit gate for a fresh lead.
    pub async fn should_dial(&self, lead: &Lead, now: DateTime<Utc>) -> Result<bool, SchedulerError> {
        let campaign_id = &self.campaign.id;

        if self.store.is_lead_success(campaign_id, &lead.id).await? {
            debug!(lead_id = %lead.id, "Lead already succeeded, skipping");
            return Ok(false);
        }
        if self.store.is_phone_success(campaign_id, &lead.phone_number).await? {
            debug!(phone = %lead.phone_number, "Phone already succeeded, skipping");
            return Ok(false);
        }
        if self.store.is_inprogress(campaign_id, &lead.id).await?
            || self.store.is_phone_inprogress(campaign_id, &lead.phone_number).await?
            || self.local_inflight.contains(&lead.id)
        {
            return Ok(false);
        }

        if !policy::within_time_of_day(&self.campaign, now) {
            return Ok(false);
        }

        if let Some(last) = self.last_lead_dial.get(&lead.id) {
            let gap = now - *last;
            if gap < chrono::Duration::seconds(self.config.lead_redial_gap_secs) {
                debug!(
                    lead_id = %lead.id,
                    elapsed_secs = gap.num_seconds(),
                    "Lead redialed too recently, skipping"
                );
                return Ok(false);
            }
        }

        Ok(true)
    }

    async fn dial_lead(&mut self, lead: &Lead, now: DateTime<Utc>) -> Result<(), SchedulerError> {
        let request = policy::build_call_request(
            &self.campaign,
            lead,
            now,
            self.config.default_max_attempts,
            self.config.default_retry_interval_secs,
        );

        self.store.send_call_request(&request).await?;
        self.store.mark_inprogress(&self.campaign.id, &lead.id).await?;
        self.store
            .mark_phone_inprogress(&self.campaign.id, &lead.phone_number)
            .await?;
        self.local_inflight.insert(lead.id.clone());
        self.last_lead_dial.insert(lead.id.clone(), now);
        self.processed_count += 1;

        metrics::counter!("worker.calls_dispatched_total").increment(1);
        info!(
            campaign = %self.campaign.name,
            lead_id = %lead.id,
            phone = %lead.phone_number,
            call_id = %request.call_id,
            "Call request dispatched"
        );
        Ok(())
    }
}
