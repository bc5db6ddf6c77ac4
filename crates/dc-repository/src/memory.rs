//! In-memory campaign repository for tests and dev mode.

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::RwLock;

use dc_common::{Campaign, CampaignStatus, Lead};

use crate::{CampaignRepository, LEAD_PAGE_SIZE};

#[derive(Default)]
struct Inner {
    /// Insertion-ordered so listings are deterministic.
    campaigns: Vec<Campaign>,
    leads: Vec<Lead>,
}

#[derive(Default)]
pub struct MemoryCampaignRepository {
    inner: RwLock<Inner>,
}

impl MemoryCampaignRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a campaign (matched by id).
    pub fn upsert_campaign(&self, campaign: Campaign) {
        let mut inner = self.inner.write();
        if let Some(existing) = inner.campaigns.iter_mut().find(|c| c.id == campaign.id) {
            *existing = campaign;
        } else {
            inner.campaigns.push(campaign);
        }
    }

    pub fn remove_campaign(&self, campaign_id: &str) {
        self.inner.write().campaigns.retain(|c| c.id != campaign_id);
    }

    /// Append a lead; creation order is the order of insertion.
    pub fn add_lead(&self, lead: Lead) {
        self.inner.write().leads.push(lead);
    }

    pub fn remove_lead(&self, lead_id: &str) {
        self.inner.write().leads.retain(|l| l.id != lead_id);
    }

    fn campaigns_with_status(&self, wanted: &[CampaignStatus]) -> Vec<Campaign> {
        self.inner
            .read()
            .campaigns
            .iter()
            .filter(|c| wanted.contains(&c.status))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl CampaignRepository for MemoryCampaignRepository {
    async fn get_running_campaigns(&self) -> Result<Vec<Campaign>> {
        Ok(self.campaigns_with_status(&[CampaignStatus::Running]))
    }

    async fn get_stopped_campaigns(&self) -> Result<Vec<Campaign>> {
        Ok(self.campaigns_with_status(&[CampaignStatus::Paused, CampaignStatus::Ended]))
    }

    async fn get_pending_leads_for_campaign(&self, campaign_id: &str) -> Result<Vec<Lead>> {
        Ok(self
            .inner
            .read()
            .leads
            .iter()
            .filter(|l| l.campaign_id.as_deref() == Some(campaign_id))
            .take(LEAD_PAGE_SIZE as usize)
            .cloned()
            .collect())
    }

    async fn get_campaign_by_id(&self, campaign_id: &str) -> Result<Option<Campaign>> {
        Ok(self
            .inner
            .read()
            .campaigns
            .iter()
            .find(|c| c.id == campaign_id)
            .cloned())
    }
}
