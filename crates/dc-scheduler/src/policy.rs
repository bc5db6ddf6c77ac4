//! Campaign eligibility policy and request builders.
//!
//! Pure functions over an explicit `now` so every rule is testable without a
//! clock. All comparisons happen in the fixed operating zone (UTC+7); naive
//! database timestamps are interpreted as operating-zone local.

use chrono::{DateTime, FixedOffset, NaiveDateTime, TimeZone, Timelike, Utc};
use tracing::{debug, warn};
use uuid::Uuid;

use dc_common::{CallRequest, Campaign, Lead, RetryPayload};

const OPERATING_ZONE_OFFSET_HOURS: i32 = 7;

/// The fixed zone every scheduling comparison happens in.
pub fn operating_zone() -> FixedOffset {
    FixedOffset::east_opt(OPERATING_ZONE_OFFSET_HOURS * 3600).expect("static offset")
}

fn to_zone(naive: NaiveDateTime) -> DateTime<FixedOffset> {
    let zone = operating_zone();
    naive
        .and_local_timezone(zone)
        .earliest()
        .unwrap_or_else(|| zone.from_utc_datetime(&naive))
}

/// One allowed dialing interval within a day, minutes resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    pub from_hour: u32,
    pub from_minute: u32,
    pub to_hour: u32,
    pub to_minute: u32,
}

impl TimeWindow {
    pub fn start_minutes(&self) -> u32 {
        self.from_hour * 60 + self.from_minute
    }

    pub fn end_minutes(&self) -> u32 {
        self.to_hour * 60 + self.to_minute
    }

    /// `[start, end)` containment. Zero-length windows never match, and a
    /// window whose start is past its end (midnight wrap) is not active on
    /// either side.
    pub fn contains(&self, minutes_of_day: u32) -> bool {
        let (start, end) = (self.start_minutes(), self.end_minutes());
        start < end && start <= minutes_of_day && minutes_of_day < end
    }
}

/// Tolerant parse of the `time_of_day` column. Accepts a JSON array or a
/// double-encoded JSON string; clamps hours/minutes into range; skips
/// malformed entries. Bad data means no restriction, never a stuck campaign.
pub fn parse_time_windows(raw: Option<&str>) -> Vec<TimeWindow> {
    let Some(raw) = raw else {
        return Vec::new();
    };
    if raw.trim().is_empty() {
        return Vec::new();
    }

    let mut value: serde_json::Value = match serde_json::from_str(raw) {
        Ok(value) => value,
        Err(_) => {
            warn!("Invalid time_of_day JSON, ignoring windows");
            return Vec::new();
        }
    };
    if let serde_json::Value::String(inner) = &value {
        value = serde_json::from_str(inner).unwrap_or(serde_json::Value::Null);
    }

    let Some(items) = value.as_array() else {
        warn!("time_of_day is not a list, ignoring windows");
        return Vec::new();
    };

    items.iter().filter_map(window_from_value).collect()
}

fn window_from_value(item: &serde_json::Value) -> Option<TimeWindow> {
    let obj = item.as_object()?;
    let field = |name: &str, default: i64| -> i64 {
        match obj.get(name) {
            Some(serde_json::Value::Number(n)) => n.as_i64().unwrap_or(default),
            Some(serde_json::Value::String(s)) => s.parse().unwrap_or(default),
            _ => default,
        }
    };

    Some(TimeWindow {
        from_hour: field("fromHour", 0).clamp(0, 23) as u32,
        from_minute: field("fromMinute", 0).clamp(0, 59) as u32,
        to_hour: field("toHour", 23).clamp(0, 23) as u32,
        to_minute: field("toMinute", 59).clamp(0, 59) as u32,
    })
}

/// Absolute campaign window: `start ≤ now < end`, missing bounds open.
pub fn within_absolute_window(campaign: &Campaign, now: DateTime<Utc>) -> bool {
    let now_local = now.with_timezone(&operating_zone());
    let start_ok = campaign
        .start_time
        .map(|start| to_zone(start) <= now_local)
        .unwrap_or(true);
    let end_ok = campaign
        .end_time
        .map(|end| now_local < to_zone(end))
        .unwrap_or(true);
    start_ok && end_ok
}

/// Time-of-day gate. No valid windows means the campaign may dial all day.
pub fn within_time_of_day(campaign: &Campaign, now: DateTime<Utc>) -> bool {
    let windows = parse_time_windows(campaign.time_of_day.as_deref());
    if windows.is_empty() {
        return true;
    }

    let now_local = now.with_timezone(&operating_zone());
    let minutes_of_day = now_local.hour() * 60 + now_local.minute();
    windows.iter().any(|w| w.contains(minutes_of_day))
}

/// Campaigns eligible to dial right now (status is checked by the caller,
/// which only fetches running campaigns).
pub fn filter_active_campaigns(campaigns: Vec<Campaign>, now: DateTime<Utc>) -> Vec<Campaign> {
    campaigns
        .into_iter()
        .filter(|campaign| {
            if !within_absolute_window(campaign, now) {
                debug!(campaign = %campaign.name, "Outside start/end window, skipping");
                return false;
            }
            if !within_time_of_day(campaign, now) {
                debug!(campaign = %campaign.name, "Outside time-of-day window, skipping");
                return false;
            }
            true
        })
        .collect()
}

/// Build the request for a first dial attempt.
pub fn build_call_request(
    campaign: &Campaign,
    lead: &Lead,
    now: DateTime<Utc>,
    default_max_attempts: u32,
    default_retry_interval_secs: u64,
) -> CallRequest {
    CallRequest {
        call_id: Uuid::new_v4().to_string(),
        tenant_id: Some(campaign.tenant_id.clone()).filter(|t| !t.is_empty()),
        campaign_id: campaign.id.clone(),
        campaign_name: campaign.name.clone(),
        script_id: campaign.script_id.clone(),
        lead_id: lead.id.clone(),
        phone_number: lead.phone_number.clone(),
        lead_name: Some(lead.display_name()),
        is_retry: false,
        original_call_id: None,
        attempt: 0,
        max_attempts: campaign.max_callback.unwrap_or(default_max_attempts),
        retry_interval: default_retry_interval_secs,
        timestamp: now.with_timezone(&operating_zone()).to_rfc3339(),
    }
}

/// Build the request re-driving a persisted retry. The envelope gets a fresh
/// call id; the claimed id rides along as `originalCallId`.
pub fn build_retry_request(
    campaign: &Campaign,
    payload: &RetryPayload,
    now: DateTime<Utc>,
) -> CallRequest {
    CallRequest {
        call_id: Uuid::new_v4().to_string(),
        tenant_id: Some(campaign.tenant_id.clone()).filter(|t| !t.is_empty()),
        campaign_id: campaign.id.clone(),
        campaign_name: campaign.name.clone(),
        script_id: campaign.script_id.clone(),
        lead_id: payload.lead_id.clone(),
        phone_number: payload.phone.clone(),
        lead_name: None,
        is_retry: true,
        original_call_id: Some(payload.call_id.clone()),
        attempt: payload.attempt,
        max_attempts: payload.max_attempts,
        retry_interval: payload.retry_interval_s,
        timestamp: now.with_timezone(&operating_zone()).to_rfc3339(),
    }
}
