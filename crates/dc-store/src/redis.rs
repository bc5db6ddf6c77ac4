//! Redis-backed coordination store.
//!
//! Uses a multiplexed `ConnectionManager` (one per owning component), a Lua
//! script for the atomic claim-due primitive, and a MULTI/EXEC pipeline for
//! the payload-plus-index retry write.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::debug;

use dc_common::{CallCallback, CallRequest};

use crate::error::{Result, StoreError};
use crate::{
    decode_batch, keys, CoordinationStore, CALL_CALLBACKS_QUEUE, CALL_REQUESTS_QUEUE,
    POP_BATCH_SIZE,
};

/// Pops due members one at a time so concurrent claimants can never observe
/// the same id: ZRANGEBYSCORE with LIMIT 1, ZREM, repeat until empty or at
/// the batch limit, all inside one script invocation.
const CLAIM_DUE_SCRIPT: &str = r#"
local zkey = KEYS[1]
local now  = tonumber(ARGV[1])
local limit = tonumber(ARGV[2])
local res = {}
for i=1,limit,1 do
    local ids = redis.call('ZRANGEBYSCORE', zkey, '-inf', now, 'LIMIT', 0, 1)
    if (ids == nil) or (#ids == 0) then break end
    local id = ids[1]
    redis.call('ZREM', zkey, id)
    table.insert(res, id)
end
return res
"#;

pub struct RedisStore {
    conn: ConnectionManager,
}

impl RedisStore {
    /// Open a dedicated connection to the coordination store.
    pub async fn connect(url: &str) -> Result<Self> {
        let client =
            redis::Client::open(url).map_err(|e| StoreError::Connection(e.to_string()))?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self { conn })
    }

    async fn add_member(&self, key: String, member: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.sadd::<_, _, ()>(key, member).await?;
        Ok(())
    }

    async fn remove_member(&self, key: String, member: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.srem::<_, _, ()>(key, member).await?;
        Ok(())
    }

    async fn has_member(&self, key: String, member: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        Ok(conn.sismember(key, member).await?)
    }

    /// BRPOP loop shared by both queue readers.
    async fn pop_batch(&self, queue: &str, timeout: Duration) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let timeout_secs = timeout.as_secs_f64();
        let mut bodies = Vec::new();

        for _ in 0..POP_BATCH_SIZE {
            let popped: Option<(String, String)> = conn.brpop(queue, timeout_secs).await?;
            match popped {
                Some((_, body)) => bodies.push(body),
                None => break,
            }
        }
        Ok(bodies)
    }
}

#[async_trait]
impl CoordinationStore for RedisStore {
    async fn mark_lead_success(&self, campaign_id: &str, lead_id: &str) -> Result<()> {
        self.add_member(keys::done(campaign_id), lead_id).await
    }

    async fn is_lead_success(&self, campaign_id: &str, lead_id: &str) -> Result<bool> {
        self.has_member(keys::done(campaign_id), lead_id).await
    }

    async fn mark_phone_success(&self, campaign_id: &str, phone: &str) -> Result<()> {
        self.add_member(keys::done_phone(campaign_id), phone).await
    }

    async fn is_phone_success(&self, campaign_id: &str, phone: &str) -> Result<bool> {
        self.has_member(keys::done_phone(campaign_id), phone).await
    }

    async fn mark_inprogress(&self, campaign_id: &str, lead_id: &str) -> Result<()> {
        self.add_member(keys::inprogress(campaign_id), lead_id).await
    }

    async fn clear_inprogress(&self, campaign_id: &str, lead_id: &str) -> Result<()> {
        self.remove_member(keys::inprogress(campaign_id), lead_id).await
    }

    async fn is_inprogress(&self, campaign_id: &str, lead_id: &str) -> Result<bool> {
        self.has_member(keys::inprogress(campaign_id), lead_id).await
    }

    async fn mark_phone_inprogress(&self, campaign_id: &str, phone: &str) -> Result<()> {
        self.add_member(keys::inprogress_phone(campaign_id), phone).await
    }

    async fn clear_phone_inprogress(&self, campaign_id: &str, phone: &str) -> Result<()> {
        self.remove_member(keys::inprogress_phone(campaign_id), phone).await
    }

    async fn is_phone_inprogress(&self, campaign_id: &str, phone: &str) -> Result<bool> {
        self.has_member(keys::inprogress_phone(campaign_id), phone).await
    }

    async fn save_failure_and_schedule_retry(
        &self,
        campaign_id: &str,
        call_id: &str,
        payload: HashMap<String, String>,
        delay_seconds: u64,
    ) -> Result<()> {
        let mut conn = self.conn.clone();
        let due_at = chrono::Utc::now().timestamp() + delay_seconds as i64;
        let fields: Vec<(String, String)> = payload.into_iter().collect();

        // HSET + ZADD as one transaction: the retry index must never point
        // at a missing payload, and vice versa.
        redis::pipe()
            .atomic()
            .hset_multiple(keys::call(call_id), &fields)
            .ignore()
            .zadd(keys::retry(campaign_id), call_id, due_at)
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;

        debug!(campaign_id = %campaign_id, call_id = %call_id, due_at, "Retry scheduled");
        Ok(())
    }

    async fn save_success_and_finalize(&self, call_id: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(keys::call(call_id)).await?;
        Ok(())
    }

    async fn remove_retry(&self, campaign_id: &str, call_id: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.zrem::<_, _, ()>(keys::retry(campaign_id), call_id).await?;
        Ok(())
    }

    async fn claim_due_retries(&self, campaign_id: &str, limit: usize) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let now = chrono::Utc::now().timestamp();

        let claimed: Vec<String> = redis::Script::new(CLAIM_DUE_SCRIPT)
            .key(keys::retry(campaign_id))
            .arg(now)
            .arg(limit)
            .invoke_async(&mut conn)
            .await?;

        Ok(claimed)
    }

    async fn get_call_payload(
        &self,
        call_id: &str,
    ) -> Result<HashMap<String, serde_json::Value>> {
        let mut conn = self.conn.clone();
        let raw: HashMap<String, String> = conn.hgetall(keys::call(call_id)).await?;

        Ok(raw
            .into_iter()
            .map(|(k, v)| {
                let value =
                    serde_json::from_str(&v).unwrap_or(serde_json::Value::String(v));
                (k, value)
            })
            .collect())
    }

    async fn send_call_request(&self, request: &CallRequest) -> Result<()> {
        let mut conn = self.conn.clone();
        let body = serde_json::to_string(request)?;
        conn.lpush::<_, _, ()>(CALL_REQUESTS_QUEUE, body).await?;
        debug!(call_id = %request.call_id, "Call request enqueued");
        Ok(())
    }

    async fn get_call_requests(&self, timeout: Duration) -> Result<Vec<CallRequest>> {
        let bodies = self.pop_batch(CALL_REQUESTS_QUEUE, timeout).await?;
        Ok(decode_batch(bodies, "call request"))
    }

    async fn send_call_callback(&self, callback: &CallCallback) -> Result<()> {
        let mut conn = self.conn.clone();
        let body = serde_json::to_string(callback)?;
        conn.lpush::<_, _, ()>(CALL_CALLBACKS_QUEUE, body).await?;
        debug!(call_id = %callback.call_id, "Callback enqueued");
        Ok(())
    }

    async fn get_call_callbacks(&self, timeout: Duration) -> Result<Vec<CallCallback>> {
        let bodies = self.pop_batch(CALL_CALLBACKS_QUEUE, timeout).await?;
        Ok(decode_batch(bodies, "callback"))
    }

    async fn purge_campaign(&self, campaign_id: &str) -> Result<()> {
        let mut conn = self.conn.clone();

        let pending: Vec<String> = conn.zrange(keys::retry(campaign_id), 0, -1).await?;
        for call_id in &pending {
            conn.del::<_, ()>(keys::call(call_id)).await?;
        }

        conn.del::<_, ()>((
            keys::done(campaign_id),
            keys::done_phone(campaign_id),
            keys::inprogress(campaign_id),
            keys::inprogress_phone(campaign_id),
            keys::retry(campaign_id),
        ))
        .await?;

        debug!(campaign_id = %campaign_id, retries_dropped = pending.len(), "Campaign keys purged");
        Ok(())
    }
}
