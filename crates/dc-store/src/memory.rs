//! In-memory coordination store for tests and dev mode.
//!
//! Mirrors the Redis backend's semantics: set idempotence, ZSET-style
//! due-time ordering (score, then member), head-push/tail-pop queues. The
//! single mutex makes `claim_due_retries` trivially linearizable. Takes a
//! `Clock` so due-time behavior is testable without real delays.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use dc_common::{CallCallback, CallRequest};

use crate::clock::{Clock, SystemClock};
use crate::error::Result;
use crate::{
    decode_batch, keys, CoordinationStore, CALL_CALLBACKS_QUEUE, CALL_REQUESTS_QUEUE,
    POP_BATCH_SIZE,
};

const POP_POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Default)]
struct Inner {
    sets: HashMap<String, HashSet<String>>,
    /// Retry indexes: member -> due epoch, keyed by the retry key.
    retries: HashMap<String, HashMap<String, i64>>,
    payloads: HashMap<String, HashMap<String, String>>,
    queues: HashMap<String, VecDeque<String>>,
}

pub struct MemoryStore {
    clock: Arc<dyn Clock>,
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Snapshot of a campaign's pending retries as `(call_id, due_epoch)`.
    pub fn pending_retries(&self, campaign_id: &str) -> Vec<(String, i64)> {
        let inner = self.inner.lock();
        let mut entries: Vec<(String, i64)> = inner
            .retries
            .get(&keys::retry(campaign_id))
            .map(|zset| zset.iter().map(|(id, due)| (id.clone(), *due)).collect())
            .unwrap_or_default();
        entries.sort_by(|a, b| (a.1, &a.0).cmp(&(b.1, &b.0)));
        entries
    }

    fn add_member(&self, key: String, member: &str) {
        self.inner
            .lock()
            .sets
            .entry(key)
            .or_default()
            .insert(member.to_string());
    }

    fn remove_member(&self, key: &str, member: &str) {
        if let Some(set) = self.inner.lock().sets.get_mut(key) {
            set.remove(member);
        }
    }

    fn has_member(&self, key: &str, member: &str) -> bool {
        self.inner
            .lock()
            .sets
            .get(key)
            .map(|set| set.contains(member))
            .unwrap_or(false)
    }

    fn push(&self, queue: &str, body: String) {
        self.inner
            .lock()
            .queues
            .entry(queue.to_string())
            .or_default()
            .push_front(body);
    }

    async fn pop_batch(&self, queue: &str, timeout: Duration) -> Vec<String> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut bodies = Vec::new();

        while bodies.len() < POP_BATCH_SIZE {
            let popped = self
                .inner
                .lock()
                .queues
                .get_mut(queue)
                .and_then(|q| q.pop_back());

            match popped {
                Some(body) => bodies.push(body),
                None => {
                    if tokio::time::Instant::now() >= deadline {
                        break;
                    }
                    tokio::time::sleep(POP_POLL_INTERVAL).await;
                }
            }
        }
        bodies
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn mark_lead_success(&self, campaign_id: &str, lead_id: &str) -> Result<()> {
        self.add_member(keys::done(campaign_id), lead_id);
        Ok(())
    }

    async fn is_lead_success(&self, campaign_id: &str, lead_id: &str) -> Result<bool> {
        Ok(self.has_member(&keys::done(campaign_id), lead_id))
    }

    async fn mark_phone_success(&self, campaign_id: &str, phone: &str) -> Result<()> {
        self.add_member(keys::done_phone(campaign_id), phone);
        Ok(())
    }

    async fn is_phone_success(&self, campaign_id: &str, phone: &str) -> Result<bool> {
        Ok(self.has_member(&keys::done_phone(campaign_id), phone))
    }

    async fn mark_inprogress(&self, campaign_id: &str, lead_id: &str) -> Result<()> {
        self.add_member(keys::inprogress(campaign_id), lead_id);
        Ok(())
    }

    async fn clear_inprogress(&self, campaign_id: &str, lead_id: &str) -> Result<()> {
        self.remove_member(&keys::inprogress(campaign_id), lead_id);
        Ok(())
    }

    async fn is_inprogress(&self, campaign_id: &str, lead_id: &str) -> Result<bool> {
        Ok(self.has_member(&keys::inprogress(campaign_id), lead_id))
    }

    async fn mark_phone_inprogress(&self, campaign_id: &str, phone: &str) -> Result<()> {
        self.add_member(keys::inprogress_phone(campaign_id), phone);
        Ok(())
    }

    async fn clear_phone_inprogress(&self, campaign_id: &str, phone: &str) -> Result<()> {
        self.remove_member(&keys::inprogress_phone(campaign_id), phone);
        Ok(())
    }

    async fn is_phone_inprogress(&self, campaign_id: &str, phone: &str) -> Result<bool> {
        Ok(self.has_member(&keys::inprogress_phone(campaign_id), phone))
    }

    async fn save_failure_and_schedule_retry(
        &self,
        campaign_id: &str,
        call_id: &str,
        payload: HashMap<String, String>,
        delay_seconds: u64,
    ) -> Result<()> {
        let due_at = self.clock.now_epoch() + delay_seconds as i64;
        let mut inner = self.inner.lock();
        inner.payloads.insert(keys::call(call_id), payload);
        inner
            .retries
            .entry(keys::retry(campaign_id))
            .or_default()
            .insert(call_id.to_string(), due_at);
        Ok(())
    }

    async fn save_success_and_finalize(&self, call_id: &str) -> Result<()> {
        self.inner.lock().payloads.remove(&keys::call(call_id));
        Ok(())
    }

    async fn remove_retry(&self, campaign_id: &str, call_id: &str) -> Result<()> {
        if let Some(zset) = self.inner.lock().retries.get_mut(&keys::retry(campaign_id)) {
            zset.remove(call_id);
        }
        Ok(())
    }

    async fn claim_due_retries(&self, campaign_id: &str, limit: usize) -> Result<Vec<String>> {
        let now = self.clock.now_epoch();
        let mut inner = self.inner.lock();

        let Some(zset) = inner.retries.get_mut(&keys::retry(campaign_id)) else {
            return Ok(Vec::new());
        };

        let mut due: Vec<(String, i64)> = zset
            .iter()
            .filter(|(_, score)| **score <= now)
            .map(|(id, score)| (id.clone(), *score))
            .collect();
        due.sort_by(|a, b| (a.1, &a.0).cmp(&(b.1, &b.0)));
        due.truncate(limit);

        let claimed: Vec<String> = due.into_iter().map(|(id, _)| id).collect();
        for id in &claimed {
            zset.remove(id);
        }
        Ok(claimed)
    }

    async fn get_call_payload(
        &self,
        call_id: &str,
    ) -> Result<HashMap<String, serde_json::Value>> {
        let raw = self
            .inner
            .lock()
            .payloads
            .get(&keys::call(call_id))
            .cloned()
            .unwrap_or_default();

        Ok(raw
            .into_iter()
            .map(|(k, v)| {
                let value = serde_json::from_str(&v).unwrap_or(serde_json::Value::String(v));
                (k, value)
            })
            .collect())
    }

    async fn send_call_request(&self, request: &CallRequest) -> Result<()> {
        self.push(CALL_REQUESTS_QUEUE, serde_json::to_string(request)?);
        Ok(())
    }

    async fn get_call_requests(&self, timeout: Duration) -> Result<Vec<CallRequest>> {
        let bodies = self.pop_batch(CALL_REQUESTS_QUEUE, timeout).await;
        Ok(decode_batch(bodies, "call request"))
    }

    async fn send_call_callback(&self, callback: &CallCallback) -> Result<()> {
        self.push(CALL_CALLBACKS_QUEUE, serde_json::to_string(callback)?);
        Ok(())
    }

    async fn get_call_callbacks(&self, timeout: Duration) -> Result<Vec<CallCallback>> {
        let bodies = self.pop_batch(CALL_CALLBACKS_QUEUE, timeout).await;
        Ok(decode_batch(bodies, "callback"))
    }

    async fn purge_campaign(&self, campaign_id: &str) -> Result<()> {
        let mut inner = self.inner.lock();

        if let Some(zset) = inner.retries.remove(&keys::retry(campaign_id)) {
            for call_id in zset.keys() {
                inner.payloads.remove(&keys::call(call_id));
            }
        }
        inner.sets.remove(&keys::done(campaign_id));
        inner.sets.remove(&keys::done_phone(campaign_id));
        inner.sets.remove(&keys::inprogress(campaign_id));
        inner.sets.remove(&keys::inprogress_phone(campaign_id));
        Ok(())
    }
}
