use std::collections::HashMap;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

pub mod logging;

// ============================================================================
// Campaign & Lead Records
// ============================================================================

/// Campaign lifecycle status as stored in the `campaigns.status` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CampaignStatus {
    Running,
    Paused,
    Ended,
    /// Any status the scheduler does not act on.
    #[serde(other)]
    Other,
}

impl From<&str> for CampaignStatus {
    fn from(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "running" => Self::Running,
            "paused" => Self::Paused,
            "ended" => Self::Ended,
            _ => Self::Other,
        }
    }
}

impl CampaignStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Ended => "ended",
            Self::Other => "other",
        }
    }
}

/// An outbound calling program.
///
/// All identifiers are strings regardless of the column type so they can be
/// concatenated straight into coordination-store keys. Naive timestamps are
/// operating-zone local (UTC+7), not UTC.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Campaign {
    pub id: String,
    pub tenant_id: String,
    pub name: String,
    pub status: CampaignStatus,
    pub start_time: Option<NaiveDateTime>,
    pub end_time: Option<NaiveDateTime>,
    pub script_id: Option<String>,
    /// Minimum gap in seconds between any two dials of this campaign.
    pub call_interval: Option<i64>,
    pub description: Option<String>,
    pub voice_id: Option<String>,
    pub email: Option<String>,
    /// Per-call timeout hint in seconds. Advisory; retry delays come from
    /// the callback's `retryInterval`.
    pub max_call_time: Option<i64>,
    /// Raw JSON text of allowed dialing windows:
    /// `[{"fromHour":9,"fromMinute":0,"toHour":17,"toMinute":30}]`
    pub time_of_day: Option<String>,
    /// Maximum retry attempts per lead.
    pub max_callback: Option<u32>,
    pub callback_conditions: Option<String>,
}

/// One callee record from the `customers` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lead {
    pub id: String,
    pub phone_number: String,
    pub name: Option<String>,
    pub tenant_id: Option<String>,
    pub campaign_id: Option<String>,
}

impl Lead {
    pub fn display_name(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| format!("Lead {}", self.phone_number))
    }
}

// ============================================================================
// Broker Wire Messages
// ============================================================================

/// Terminal outcome of one dial attempt as reported by the Call Agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CallStatus {
    Success,
    NoAnswer,
    Busy,
    Failed,
}

impl CallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "SUCCESS",
            Self::NoAnswer => "NO_ANSWER",
            Self::Busy => "BUSY",
            Self::Failed => "FAILED",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }

    /// Whether this outcome is eligible for another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::NoAnswer | Self::Busy | Self::Failed)
    }
}

/// The message pushed onto `call_requests` for the external Call Agent.
///
/// Field names follow the agent's wire contract (camelCase, `campaignCode`
/// carrying the campaign name).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallRequest {
    pub call_id: String,
    pub tenant_id: Option<String>,
    pub campaign_id: String,
    #[serde(rename = "campaignCode")]
    pub campaign_name: String,
    pub script_id: Option<String>,
    pub lead_id: String,
    #[serde(rename = "leadPhoneNumber")]
    pub phone_number: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lead_name: Option<String>,
    #[serde(default)]
    pub is_retry: bool,
    /// For retries: the call id whose failure scheduled this attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_call_id: Option<String>,
    #[serde(default)]
    pub attempt: u32,
    pub max_attempts: u32,
    /// Delay hint in seconds should this attempt fail.
    pub retry_interval: u64,
    /// ISO-8601 emission time.
    pub timestamp: String,
}

/// The outcome message the Call Agent pushes onto `call_callbacks`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallCallback {
    pub call_id: String,
    pub campaign_id: String,
    pub lead_id: String,
    #[serde(rename = "leadPhoneNumber")]
    pub phone_number: String,
    pub status: CallStatus,
    #[serde(default)]
    pub attempt: u32,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_interval: Option<u64>,
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<f64>,
}

fn default_max_attempts() -> u32 {
    3
}

// ============================================================================
// Retry Payload
// ============================================================================

/// The persisted record required to reconstruct a retry request at due time.
///
/// Stored in the coordination store as a string-valued hash (`call:{id}`),
/// so this type owns the field-level encode/decode. Reads tolerate values
/// that come back JSON-decoded (e.g. `"3"` re-read as the number `3`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPayload {
    pub campaign_id: String,
    pub lead_id: String,
    pub phone: String,
    pub attempt: u32,
    pub max_attempts: u32,
    pub retry_interval_s: u64,
    pub call_id: String,
    pub last_outcome: Option<String>,
}

impl RetryPayload {
    pub fn to_fields(&self) -> HashMap<String, String> {
        let mut fields = HashMap::new();
        fields.insert("campaign_id".into(), self.campaign_id.clone());
        fields.insert("lead_id".into(), self.lead_id.clone());
        fields.insert("phone".into(), self.phone.clone());
        fields.insert("attempt".into(), self.attempt.to_string());
        fields.insert("max_attempts".into(), self.max_attempts.to_string());
        fields.insert("retry_interval_s".into(), self.retry_interval_s.to_string());
        fields.insert("call_id".into(), self.call_id.clone());
        if let Some(outcome) = &self.last_outcome {
            fields.insert("last_outcome".into(), outcome.clone());
        }
        fields
    }

    /// Rebuild from a decoded payload map. Returns `None` when the record is
    /// missing the fields a retry cannot be dialed without.
    pub fn from_fields(fields: &HashMap<String, serde_json::Value>) -> Option<Self> {
        let lead_id = field_string(fields.get("lead_id")?);
        let phone = field_string(fields.get("phone")?);
        Some(Self {
            campaign_id: fields.get("campaign_id").map(field_string).unwrap_or_default(),
            lead_id,
            phone,
            attempt: fields.get("attempt").and_then(field_u64).unwrap_or(0) as u32,
            max_attempts: fields
                .get("max_attempts")
                .and_then(field_u64)
                .unwrap_or(u64::from(default_max_attempts())) as u32,
            retry_interval_s: fields.get("retry_interval_s").and_then(field_u64).unwrap_or(300),
            call_id: fields.get("call_id").map(field_string).unwrap_or_default(),
            last_outcome: fields.get("last_outcome").map(field_string),
        })
    }
}

fn field_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn field_u64(value: &serde_json::Value) -> Option<u64> {
    match value {
        serde_json::Value::Number(n) => n.as_u64(),
        serde_json::Value::String(s) => s.parse().ok(),
        _ => None,
    }
}
