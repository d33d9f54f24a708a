//! The Campaign entity and its status state machine.
use crate::ids::{CampaignId, EspProfileId, ListId, SegmentId, TenantId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Every state a Campaign can occupy. Transitions are validated by
/// `campaign-state`; this crate only names the states and which ones are
/// terminal (diagram).
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
pub enum CampaignStatus {
    Draft,
    Scheduled,
    Preparing,
    Sending,
    Paused,
    Cancelled,
    Completed,
    CompletedWithErrors,
    Failed,
}

impl CampaignStatus {
    /// True once a campaign can never again transition to any other
    /// state except via an explicit `reset` back to `draft`.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::CompletedWithErrors | Self::Cancelled | Self::Failed
        )
    }

    /// True while content/audience/ESP selection may still be edited,
    /// ignoring the additional edit-lock-window rule for `Scheduled`
    /// (edit-lock rule).
    pub fn is_editable_state(&self) -> bool {
        matches!(self, Self::Draft | Self::Scheduled)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, utoipa::ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum SendType {
    Instant,
    Scheduled,
    Smart,
}

/// Named throttle presets with their exact per-minute rates.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, utoipa::ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ThrottlePreset {
    Instant,
    Gentle,
    Moderate,
    Careful,
}

impl ThrottlePreset {
    pub const fn rate_per_minute(self) -> u64 {
        match self {
            Self::Instant => 1000,
            Self::Gentle => 100,
            Self::Moderate => 50,
            Self::Careful => 20,
        }
    }

    /// Queue item priority assigned at enqueue time (step 3).
    pub const fn priority(self) -> i16 {
        match self {
            Self::Instant => 10,
            Self::Gentle => 7,
            Self::Moderate => 5,
            Self::Careful => 3,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, utoipa::ToSchema)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum ThrottlePolicy {
    Preset {
        preset: ThrottlePreset,
    },
    Custom {
        rate_per_minute: u64,
        duration_hours: Option<u32>,
    },
}

impl ThrottlePolicy {
    /// Clamps a custom rate to `[1, 10_000]` (boundary
    /// behavior) and leaves preset rates untouched.
    pub fn rate_per_minute(&self) -> u64 {
        match self {
            Self::Preset { preset } => preset.rate_per_minute(),
            Self::Custom { rate_per_minute, .. } => (*rate_per_minute).clamp(1, 10_000),
        }
    }

    pub fn priority(&self) -> i16 {
        match self {
            Self::Preset { preset } => preset.priority(),
            // Custom throttles split the difference between `moderate`
            // and `careful` since there is no preset priority to borrow.
            Self::Custom { .. } => 4,
        }
    }

    pub fn duration_hours(&self) -> Option<u32> {
        match self {
            Self::Preset { .. } => None,
            Self::Custom { duration_hours, .. } => *duration_hours,
        }
    }
}

/// Which lists/segments to include, minus which lists/segments/addresses
/// to exclude, with an overall cap.
#[derive(Serialize, Deserialize, Debug, Clone, Default, utoipa::ToSchema)]
pub struct AudienceSelector {
    pub primary_list: Option<ListId>,
    #[serde(default)]
    pub additional_lists: Vec<ListId>,
    pub primary_segment: Option<SegmentId>,
    #[serde(default)]
    pub additional_segments: Vec<SegmentId>,
    #[serde(default)]
    pub suppression_lists: Vec<ListId>,
    #[serde(default)]
    pub suppression_segments: Vec<SegmentId>,
    pub max_recipients: Option<u64>,
}

impl AudienceSelector {
    pub fn included_lists(&self) -> Vec<ListId> {
        let mut v = Vec::with_capacity(1 + self.additional_lists.len());
        v.extend(self.primary_list);
        v.extend(self.additional_lists.iter().copied());
        v
    }

    pub fn included_segments(&self) -> Vec<SegmentId> {
        let mut v = Vec::with_capacity(1 + self.additional_segments.len());
        v.extend(self.primary_segment);
        v.extend(self.additional_segments.iter().copied());
        v
    }
}

/// Either a single ESP profile or a weighted quota list summing to 100
/// (invariant).
#[derive(Serialize, Deserialize, Debug, Clone, utoipa::ToSchema)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum EspSelector {
    Single {
        profile: EspProfileId,
    },
    WeightedQuota {
        quotas: Vec<EspQuota>,
    },
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, utoipa::ToSchema)]
pub struct EspQuota {
    pub profile: EspProfileId,
    /// Percentage of traffic, 0..=100. The full `quotas` list must sum to
    /// exactly 100 (validated at campaign create/update time).
    pub percent: u8,
}

impl EspSelector {
    pub fn validate(&self) -> Result<(), String> {
        if let Self::WeightedQuota { quotas } = self {
            let sum: u32 = quotas.iter().map(|q| q.percent as u32).sum();
            if sum != 100 {
                return Err(format!(
                    "ESP quota percentages must sum to 100, got {sum}"
                ));
            }
        }
        Ok(())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, utoipa::ToSchema)]
pub struct CampaignCounters {
    pub total_recipients: u64,
    pub queued: u64,
    pub sent: u64,
    pub delivered: u64,
    pub open: u64,
    pub click: u64,
    pub bounce: u64,
    pub complaint: u64,
    pub unsubscribe: u64,
    pub revenue: f64,
}

#[derive(Serialize, Deserialize, Debug, Clone, utoipa::ToSchema)]
pub struct Campaign {
    pub id: CampaignId,
    pub tenant_id: TenantId,
    pub name: String,
    pub subject_template: String,
    pub html_template: String,
    pub text_template: Option<String>,
    pub preview_text: Option<String>,
    pub from_name: String,
    pub from_address: String,
    pub reply_address: Option<String>,
    pub audience: AudienceSelector,
    pub esp_selector: EspSelector,
    pub throttle: ThrottlePolicy,
    pub max_recipients: Option<u64>,
    pub send_type: SendType,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub status: CampaignStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub counters: CampaignCounters,
}

impl Campaign {
    /// Whether content/audience/ESP selection may currently be edited
    /// (edit-lock rule), given `now` and the configured
    /// `min_preparation_minutes`.
    pub fn is_editable(&self, now: DateTime<Utc>, min_preparation_minutes: i64) -> bool {
        match self.status {
            CampaignStatus::Draft => true,
            CampaignStatus::Scheduled => match self.scheduled_at {
                Some(at) => now < at - chrono::Duration::minutes(min_preparation_minutes),
                None => true,
            },
            _ => false,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn esp_quota_must_sum_to_100() {
        let sel = EspSelector::WeightedQuota {
            quotas: vec![
                EspQuota {
                    profile: EspProfileId::new(),
                    percent: 60,
                },
                EspQuota {
                    profile: EspProfileId::new(),
                    percent: 30,
                },
            ],
        };
        assert!(sel.validate().is_err());
    }

    #[test]
    fn custom_throttle_rate_clamped() {
        let p = ThrottlePolicy::Custom {
            rate_per_minute: 50_000,
            duration_hours: None,
        };
        assert_eq!(p.rate_per_minute(), 10_000);
    }

    #[test]
    fn terminal_states() {
        assert!(CampaignStatus::Completed.is_terminal());
        assert!(CampaignStatus::CompletedWithErrors.is_terminal());
        assert!(CampaignStatus::Cancelled.is_terminal());
        assert!(CampaignStatus::Failed.is_terminal());
        assert!(!CampaignStatus::Sending.is_terminal());
        assert!(!CampaignStatus::Draft.is_terminal());
    }
}
