//! Campaign repository.
//!
//! Read-only queries over the relational store. Every returned record
//! carries string identifiers regardless of the column types, so callers can
//! concatenate them straight into coordination-store keys.

use anyhow::Result;
use async_trait::async_trait;
use dc_common::{Campaign, Lead};

pub mod memory;
pub mod postgres;

pub use memory::MemoryCampaignRepository;
pub use postgres::PgCampaignRepository;

/// Page size for pending-lead fetches.
pub const LEAD_PAGE_SIZE: i64 = 50;

#[async_trait]
pub trait CampaignRepository: Send + Sync {
    /// Campaigns whose status is `running`.
    async fn get_running_campaigns(&self) -> Result<Vec<Campaign>>;

    /// Campaigns whose status is `paused` or `ended`.
    async fn get_stopped_campaigns(&self) -> Result<Vec<Campaign>>;

    /// Up to [`LEAD_PAGE_SIZE`] leads for a campaign, oldest first.
    async fn get_pending_leads_for_campaign(&self, campaign_id: &str) -> Result<Vec<Lead>>;

    async fn get_campaign_by_id(&self, campaign_id: &str) -> Result<Option<Campaign>>;
}
