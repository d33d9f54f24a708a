//! The per-recipient queue row (QueueItem, §4.6).
use crate::ids::{CampaignId, EspProfileId, QueueItemId, SubscriberId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(
    Serialize,
    Deserialize,
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    strum::EnumString,
    strum::Display,
    utoipa::ToSchema,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum QueueItemStatus {
    Queued,
    Leased,
    Sent,
    Failed,
    Skipped,
    Paused,
    Cancelled,
}

impl QueueItemStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Sent | Self::Failed | Self::Skipped | Self::Cancelled
        )
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, utoipa::ToSchema)]
pub struct QueueItem {
    pub id: QueueItemId,
    pub campaign_id: CampaignId,
    pub subscriber_id: SubscriberId,
    pub rendered_subject: String,
    pub rendered_html: String,
    pub rendered_text: Option<String>,
    pub esp_profile: EspProfileId,
    /// 0..=10, higher dispatched first.
    pub priority: i16,
    pub scheduled_at: DateTime<Utc>,
    pub status: QueueItemStatus,
    pub attempt_count: u32,
    pub last_error: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl QueueItem {
    pub fn lease_is_held(&self, now: DateTime<Utc>) -> bool {
        self.status == QueueItemStatus::Leased
            && self.lease_expires_at.map(|exp| exp > now).unwrap_or(false)
    }
}
