//! Callback consumer.
//!
//! Drains Call Agent outcomes independently of any campaign worker, so a
//! callback that arrives after its worker exited still updates state. Owns
//! its own store connection.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{debug, error, info};

use dc_common::{CallCallback, RetryPayload};
use dc_store::CoordinationStore;

use crate::SchedulerError;

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Blocking-pop timeout per drain.
    pub pop_timeout: Duration,
    /// Back-off after a drain error.
    pub error_sleep: Duration,
    /// Retry delay when a callback carries no `retryInterval`.
    pub default_retry_interval_secs: u64,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            pop_timeout: Duration::from_secs(1),
            error_sleep: Duration::from_secs(1),
            default_retry_interval_secs: 300,
        }
    }
}

pub struct CallbackConsumer {
    store: Arc<dyn CoordinationStore>,
    config: ConsumerConfig,
}

impl CallbackConsumer {
    pub fn new(store: Arc<dyn CoordinationStore>, config: ConsumerConfig) -> Self {
        Self { store, config }
    }

    /// Drain until the shutdown channel fires.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        info!("Callback consumer started");

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("Callback consumer shutting down");
                    break;
                }
                drained = self.store.get_call_callbacks(self.config.pop_timeout) => {
                    match drained {
                        Ok(callbacks) => {
                            if !callbacks.is_empty() {
                                debug!(count = callbacks.len(), "Processing callbacks");
                            }
                            for callback in callbacks {
                                if let Err(e) = self.apply(&callback).await {
                                    error!(
                                        call_id = %callback.call_id,
                                        error = %e,
                                        "Failed to apply callback"
                                    );
                                }
                            }
                        }
                        Err(e) => {
                            error!(error = %e, "Error draining callbacks");
                            tokio::time::sleep(self.config.error_sleep).await;
                        }
                    }
                }
            }
        }
    }

    /// Apply one outcome to the coordination store.
    pub async fn apply(&self, callback: &CallCallback) -> Result<(), SchedulerError> {
        let campaign_id = &callback.campaign_id;
        info!(
            call_id = %callback.call_id,
            campaign_id = %campaign_id,
            lead_id = %callback.lead_id,
            status = callback.status.as_str(),
            "Received callback"
        );

        if callback.status.is_success() {
            // Success marks land before finalize so a concurrent retry
            // claimant that wins the claim race still sees the lead as done.
            self.store.mark_lead_success(campaign_id, &callback.lead_id).await?;
            self.store
                .mark_phone_success(campaign_id, &callback.phone_number)
                .await?;
            self.store.save_success_and_finalize(&callback.call_id).await?;
            self.store.remove_retry(campaign_id, &callback.call_id).await?;
            metrics::counter!("consumer.success_total").increment(1);
        } else if callback.attempt + 1 < callback.max_attempts {
            let delay = callback
                .retry_interval
                .unwrap_or(self.config.default_retry_interval_secs);
            let payload = RetryPayload {
                campaign_id: campaign_id.clone(),
                lead_id: callback.lead_id.clone(),
                phone: callback.phone_number.clone(),
                attempt: callback.attempt + 1,
                max_attempts: callback.max_attempts,
                retry_interval_s: delay,
                call_id: callback.call_id.clone(),
                last_outcome: Some(callback.status.as_str().to_string()),
            };
            self.store
                .save_failure_and_schedule_retry(
                    campaign_id,
                    &callback.call_id,
                    payload.to_fields(),
                    delay,
                )
                .await?;
            info!(
                call_id = %callback.call_id,
                attempt = callback.attempt + 1,
                delay_secs = delay,
                "Retry scheduled"
            );
            metrics::counter!("consumer.retries_scheduled_total").increment(1);
        } else {
            info!(
                call_id = %callback.call_id,
                lead_id = %callback.lead_id,
                attempts = callback.attempt + 1,
                "Attempts exhausted, giving up"
            );
            metrics::counter!("consumer.exhausted_total").increment(1);
        }

        self.store.clear_inprogress(campaign_id, &callback.lead_id).await?;
        self.store
            .clear_phone_inprogress(campaign_id, &callback.phone_number)
            .await?;
        Ok(())
    }
}
