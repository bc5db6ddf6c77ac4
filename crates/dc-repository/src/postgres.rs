//! PostgreSQL campaign repository.
//!
//! Identifier columns are cast to text in SQL so the records the rest of the
//! system sees are uniformly string-keyed. Each owning component opens its
//! own pool; pools are never shared across campaign workers.

use anyhow::Result;
use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::{debug, info};

use dc_common::{Campaign, CampaignStatus, Lead};

use crate::{CampaignRepository, LEAD_PAGE_SIZE};

const CAMPAIGN_COLUMNS: &str = "c.id::text AS id, c.tenant_id::text AS tenant_id, c.name, \
     c.status, c.start_time, c.end_time, c.script_id::text AS script_id, c.call_interval, \
     c.description, c.voice_id::text AS voice_id, c.email, c.max_call_time, c.time_of_day, \
     c.max_callback, c.callback_conditions";

pub struct PgCampaignRepository {
    pool: PgPool,
}

impl PgCampaignRepository {
    /// Open a dedicated connection pool.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        info!("Connected to campaign database");
        Ok(Self { pool })
    }

    pub fn with_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn fetch_campaigns(&self, where_clause: &str) -> Result<Vec<Campaign>> {
        let query = format!(
            "SELECT {CAMPAIGN_COLUMNS} FROM public.campaigns c WHERE {where_clause}"
        );
        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;

        let campaigns: Vec<Campaign> = rows.iter().map(parse_campaign_row).collect();
        debug!(count = campaigns.len(), clause = where_clause, "Fetched campaigns");
        Ok(campaigns)
    }
}

#[async_trait]
impl CampaignRepository for PgCampaignRepository {
    async fn get_running_campaigns(&self) -> Result<Vec<Campaign>> {
        self.fetch_campaigns("c.status = 'running'").await
    }

    async fn get_stopped_campaigns(&self) -> Result<Vec<Campaign>> {
        self.fetch_campaigns("c.status IN ('paused', 'ended')").await
    }

    async fn get_pending_leads_for_campaign(&self, campaign_id: &str) -> Result<Vec<Lead>> {
        let rows = sqlx::query(
            "SELECT c.id::text AS id, c.phone_number, c.name, \
                    c.tenant_id::text AS tenant_id, c.campaign_id::text AS campaign_id \
             FROM public.customers c \
             WHERE c.campaign_id::text = $1 \
             ORDER BY c.created_at \
             LIMIT $2",
        )
        .bind(campaign_id)
        .bind(LEAD_PAGE_SIZE)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(parse_lead_row).collect())
    }

    async fn get_campaign_by_id(&self, campaign_id: &str) -> Result<Option<Campaign>> {
        let query = format!(
            "SELECT {CAMPAIGN_COLUMNS} FROM public.campaigns c WHERE c.id::text = $1"
        );
        let row = sqlx::query(&query)
            .bind(campaign_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.as_ref().map(parse_campaign_row))
    }
}

fn parse_campaign_row(row: &PgRow) -> Campaign {
    let status: String = row.try_get("status").unwrap_or_default();

    // time_of_day may live in a text or a jsonb column; normalize to text.
    let time_of_day = match row.try_get::<Option<String>, _>("time_of_day") {
        Ok(raw) => raw,
        Err(_) => row
            .try_get::<Option<serde_json::Value>, _>("time_of_day")
            .ok()
            .flatten()
            .map(|v| v.to_string()),
    };

    Campaign {
        id: row.try_get("id").unwrap_or_default(),
        tenant_id: row.try_get("tenant_id").unwrap_or_default(),
        name: row.try_get("name").unwrap_or_default(),
        status: CampaignStatus::from(status.as_str()),
        start_time: row.try_get("start_time").ok().flatten(),
        end_time: row.try_get("end_time").ok().flatten(),
        script_id: row.try_get("script_id").ok().flatten(),
        call_interval: row
            .try_get::<Option<i32>, _>("call_interval")
            .ok()
            .flatten()
            .map(i64::from),
        description: row.try_get("description").ok().flatten(),
        voice_id: row.try_get("voice_id").ok().flatten(),
        email: row.try_get("email").ok().flatten(),
        max_call_time: row
            .try_get::<Option<i32>, _>("max_call_time")
            .ok()
            .flatten()
            .map(i64::from),
        time_of_day,
        max_callback: row
            .try_get::<Option<i32>, _>("max_callback")
            .ok()
            .flatten()
            .map(|v| v.max(0) as u32),
        callback_conditions: row.try_get("callback_conditions").ok().flatten(),
    }
}

fn parse_lead_row(row: &PgRow) -> Lead {
    Lead {
        id: row.try_get("id").unwrap_or_default(),
        phone_number: row.try_get("phone_number").unwrap_or_default(),
        name: row.try_get("name").ok().flatten(),
        tenant_id: row.try_get("tenant_id").ok().flatten(),
        campaign_id: row.try_get("campaign_id").ok().flatten(),
    }
}
