//! Coordination store client.
//!
//! Typed operations over the broker/KV shared by every scheduler component:
//! per-campaign dedup sets, in-progress sets, the due-time retry index with
//! its atomic claim primitive, persisted retry payloads, and the two FIFO
//! queues the external Call Agent is driven through.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use dc_common::{CallCallback, CallRequest};

pub mod clock;
pub mod error;
pub mod memory;
pub mod redis;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{Result, StoreError};
pub use memory::MemoryStore;
pub use self::redis::RedisStore;

/// Requests to the Call Agent (workers push to head, agent pops from tail).
pub const CALL_REQUESTS_QUEUE: &str = "call_requests";
/// Outcomes from the Call Agent.
pub const CALL_CALLBACKS_QUEUE: &str = "call_callbacks";

/// Max items drained per blocking-pop batch.
pub(crate) const POP_BATCH_SIZE: usize = 10;

/// Decode a popped batch, dropping bodies that fail to parse.
pub(crate) fn decode_batch<T: serde::de::DeserializeOwned>(
    bodies: Vec<String>,
    kind: &str,
) -> Vec<T> {
    let mut items = Vec::with_capacity(bodies.len());
    for body in bodies {
        match serde_json::from_str(&body) {
            Ok(item) => items.push(item),
            Err(e) => tracing::warn!(error = %e, kind, "Dropping unparseable queue message"),
        }
    }
    items
}

/// Key shapes shared by every backend.
pub mod keys {
    pub fn done(campaign_id: &str) -> String {
        format!("camp:{campaign_id}:done")
    }

    pub fn done_phone(campaign_id: &str) -> String {
        format!("camp:{campaign_id}:done_phone")
    }

    pub fn inprogress(campaign_id: &str) -> String {
        format!("camp:{campaign_id}:inprogress")
    }

    pub fn inprogress_phone(campaign_id: &str) -> String {
        format!("camp:{campaign_id}:inprog_phone")
    }

    pub fn retry(campaign_id: &str) -> String {
        format!("camp:{campaign_id}:retry")
    }

    pub fn call(call_id: &str) -> String {
        format!("call:{call_id}")
    }
}

/// Typed operations over the coordination store.
///
/// All operations are idempotent from the caller's perspective: re-marking a
/// present member is a no-op, removals of absent members succeed. Transient
/// connectivity errors surface to the caller, which retries at its own loop
/// cadence.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    // ---- success dedup ----
    async fn mark_lead_success(&self, campaign_id: &str, lead_id: &str) -> Result<()>;
    async fn is_lead_success(&self, campaign_id: &str, lead_id: &str) -> Result<bool>;
    async fn mark_phone_success(&self, campaign_id: &str, phone: &str) -> Result<()>;
    async fn is_phone_success(&self, campaign_id: &str, phone: &str) -> Result<bool>;

    // ---- in-progress tracking ----
    async fn mark_inprogress(&self, campaign_id: &str, lead_id: &str) -> Result<()>;
    async fn clear_inprogress(&self, campaign_id: &str, lead_id: &str) -> Result<()>;
    async fn is_inprogress(&self, campaign_id: &str, lead_id: &str) -> Result<bool>;
    async fn mark_phone_inprogress(&self, campaign_id: &str, phone: &str) -> Result<()>;
    async fn clear_phone_inprogress(&self, campaign_id: &str, phone: &str) -> Result<()>;
    async fn is_phone_inprogress(&self, campaign_id: &str, phone: &str) -> Result<bool>;

    // ---- retry state machine ----

    /// Atomically persist the retry payload under `call:{call_id}` and index
    /// `call_id` in the campaign's retry set with score `now + delay`.
    /// A partial failure must never leave one half written.
    async fn save_failure_and_schedule_retry(
        &self,
        campaign_id: &str,
        call_id: &str,
        payload: HashMap<String, String>,
        delay_seconds: u64,
    ) -> Result<()>;

    /// Drop the persisted payload for a finished call.
    async fn save_success_and_finalize(&self, call_id: &str) -> Result<()>;

    /// Remove a call from the retry index (after finalization).
    async fn remove_retry(&self, campaign_id: &str, call_id: &str) -> Result<()>;

    /// Atomically remove and return up to `limit` call ids whose due time has
    /// passed. Each id is handed to at most one caller, even under
    /// concurrent claims.
    async fn claim_due_retries(&self, campaign_id: &str, limit: usize) -> Result<Vec<String>>;

    /// Read a retry payload; values that parse as JSON come back decoded.
    /// Missing payloads read as an empty map.
    async fn get_call_payload(&self, call_id: &str)
        -> Result<HashMap<String, serde_json::Value>>;

    // ---- broker queues ----
    async fn send_call_request(&self, request: &CallRequest) -> Result<()>;

    /// Blocking-pop up to a small batch of requests (Call Agent side).
    async fn get_call_requests(&self, timeout: Duration) -> Result<Vec<CallRequest>>;

    async fn send_call_callback(&self, callback: &CallCallback) -> Result<()>;

    /// Blocking-pop up to a small batch of outcomes (consumer side).
    async fn get_call_callbacks(&self, timeout: Duration) -> Result<Vec<CallCallback>>;

    // ---- maintenance ----

    /// Delete every coordination key belonging to a campaign: dedup sets,
    /// in-progress sets, the retry index and its payloads.
    async fn purge_campaign(&self, campaign_id: &str) -> Result<()>;
}
