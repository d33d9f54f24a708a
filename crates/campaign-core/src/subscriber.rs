//! The Subscriber entity and engagement score formula.
use crate::ids::{ListId, SubscriberId, TenantId};
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
pub enum SubscriberStatus {
    Confirmed,
    Unsubscribed,
    Bounced,
    Complained,
    Suppressed,
}

impl SubscriberStatus {
    /// The monotone direction feedback events may move a subscriber in
    /// (ordering guarantees): `confirmed` may move to any
    /// terminal status, but a terminal status is never downgraded back to
    /// `confirmed` by an out-of-order event.
    pub fn may_transition_to(&self, next: Self) -> bool {
        match self {
            Self::Confirmed => true,
            _ => *self == next,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, utoipa::ToSchema)]
pub struct Subscriber {
    pub id: SubscriberId,
    pub tenant_id: TenantId,
    pub list_id: ListId,
    pub email: String,
    pub email_hash: String,
    pub status: SubscriberStatus,
    pub custom_fields: serde_json::Value,
    pub engagement_score: f64,
    pub total_sent: u64,
    pub total_opens: u64,
    pub total_clicks: u64,
    pub last_open_at: Option<DateTime<Utc>>,
    pub last_click_at: Option<DateTime<Utc>>,
    pub last_sent_at: Option<DateTime<Utc>>,
    pub timezone: Option<String>,
}

/// Validates the shape the enqueue worker and template renderer require
/// for `custom_fields`: a JSON object, never an array or scalar
/// (SPEC_FULL.md §3).
pub fn validate_custom_fields(value: &serde_json::Value) -> Result<(), String> {
    if value.is_null() || value.is_object() {
        Ok(())
    } else {
        Err("custom_fields must be a JSON object".to_string())
    }
}

/// `0.4*open_rate + 0.6*click_rate + recency_bonus`, clamped to `[0,100]`
///. Rates are percentages of `total_sent` (floored at 1 to
/// avoid division by zero for subscribers who have not yet been mailed).
pub fn engagement_score(
    total_sent: u64,
    total_opens: u64,
    total_clicks: u64,
    last_open_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> f64 {
    let denom = total_sent.max(1) as f64;
    let open_rate = (total_opens as f64 / denom) * 100.0;
    let click_rate = (total_clicks as f64 / denom) * 100.0;

    let recency_bonus = match last_open_at {
        Some(at) => {
            let age = now - at;
            if age <= chrono::Duration::days(7) {
                20.0
            } else if age <= chrono::Duration::days(30) {
                10.0
            } else {
                0.0
            }
        }
        None => 0.0,
    };

    (0.4 * open_rate + 0.6 * click_rate + recency_bonus).clamp(0.0, 100.0)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn score_clamped_to_100() {
        let now = Utc::now();
        let score = engagement_score(1, 5, 5, Some(now), now);
        assert_eq!(score, 100.0);
    }

    #[test]
    fn score_zero_when_never_sent() {
        assert_eq!(engagement_score(0, 0, 0, None, Utc::now()), 0.0);
    }

    #[test]
    fn recency_bonus_tiers() {
        let now = Utc::now();
        let fresh = engagement_score(10, 0, 0, Some(now - chrono::Duration::days(1)), now);
        let stale = engagement_score(10, 0, 0, Some(now - chrono::Duration::days(20)), now);
        let ancient = engagement_score(10, 0, 0, Some(now - chrono::Duration::days(90)), now);
        assert_eq!(fresh, 20.0);
        assert_eq!(stale, 10.0);
        assert_eq!(ancient, 0.0);
    }

    #[test]
    fn status_cannot_downgrade_to_confirmed() {
        assert!(!SubscriberStatus::Bounced.may_transition_to(SubscriberStatus::Confirmed));
        assert!(SubscriberStatus::Confirmed.may_transition_to(SubscriberStatus::Bounced));
        assert!(SubscriberStatus::Bounced.may_transition_to(SubscriberStatus::Bounced));
    }

    #[test]
    fn custom_fields_must_be_object() {
        assert!(validate_custom_fields(&serde_json::json!({"a": 1})).is_ok());
        assert!(validate_custom_fields(&serde_json::Value::Null).is_ok());
        assert!(validate_custom_fields(&serde_json::json!([1, 2])).is_err());
        assert!(validate_custom_fields(&serde_json::json!("x")).is_err());
    }
}
