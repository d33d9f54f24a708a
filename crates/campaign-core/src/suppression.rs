//! Suppression category taxonomy and precedence rule (§4.2): an upsert
//! never downgrades an existing entry to a less-strict category.
use crate::ids::{CampaignId, SuppressionEntryId};
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
    Hash,
    strum::EnumString,
    strum::Display,
    utoipa::ToSchema,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SuppressionCategory {
    SpamComplaint,
    HardBounce,
    Unsubscribe,
    SoftBouncePromoted,
    RoleBased,
    Manual,
    Imported,
    Spamtrap,
}

impl SuppressionCategory {
    /// Precedence rank: lower is stricter. Used by `suppress` to
    /// decide whether an upsert may replace the existing category.
    fn precedence(&self) -> u8 {
        match self {
            // spamtrap is evidence of list hygiene failure and is kept
            // strictest of all so automated re-permission flows never
            // clear it.
            Self::Spamtrap => 0,
            Self::SpamComplaint => 1,
            Self::HardBounce => 2,
            Self::Unsubscribe => 3,
            Self::SoftBouncePromoted => 4,
            Self::RoleBased => 5,
            Self::Manual => 6,
            Self::Imported => 7,
        }
    }

    /// True if `self` is at least as strict as `existing`, i.e. an
    /// upsert from `existing` to `self` is allowed.
    pub fn supersedes(&self, existing: SuppressionCategory) -> bool {
        self.precedence() <= existing.precedence()
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, utoipa::ToSchema)]
pub struct SuppressionEntry {
    pub id: SuppressionEntryId,
    pub email: String,
    pub email_hash_sha256: String,
    pub email_hash_md5: String,
    pub category: SuppressionCategory,
    pub source: String,
    pub reason: Option<String>,
    pub campaign_id: Option<CampaignId>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod test {
    use super::*;
    use SuppressionCategory::*;

    #[test]
    fn spam_complaint_outranks_hard_bounce() {
        assert!(SpamComplaint.supersedes(HardBounce));
        assert!(!HardBounce.supersedes(SpamComplaint));
    }

    #[test]
    fn same_category_is_idempotent() {
        assert!(Manual.supersedes(Manual));
    }

    #[test]
    fn full_precedence_order() {
        let order = [
            SpamComplaint,
            HardBounce,
            Unsubscribe,
            SoftBouncePromoted,
            RoleBased,
            Manual,
            Imported,
        ];
        for window in order.windows(2) {
            assert!(
                window[0].supersedes(window[1]),
                "{:?} should outrank {:?}",
                window[0],
                window[1]
            );
            assert!(
                !window[1].supersedes(window[0]),
                "{:?} should not outrank {:?}",
                window[1],
                window[0]
            );
        }
    }
}
