//! The TrackingEvent entity and the ISP bucketing rules of
//! §6, grounded on the teacher's `logging/disposition.rs` "single event
//! fans out to every counter it affects" shape.
use crate::ids::{CampaignId, SubscriberId, TenantId, TrackingEventId};
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
pub enum TrackingEventType {
    Sent,
    Delivered,
    Opened,
    Clicked,
    Bounced,
    Complained,
    Unsubscribed,
    Deferred,
}

impl TrackingEventType {
    /// Events for which `tracking-events(campaign, subscriber, type)` is
    /// unique (invariant, §6 key uniqueness). Every other type
    /// may append freely.
    pub fn is_dedup_unique(&self) -> bool {
        matches!(self, Self::Opened | Self::Unsubscribed)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, utoipa::ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum DeviceClass {
    Mobile,
    Tablet,
    Desktop,
}

impl DeviceClass {
    /// Coarse heuristic over a User-Agent string. ESP-supplied device
    /// hints take precedence where available; this is the fallback used
    /// by the tracking endpoint (C8).
    pub fn from_user_agent(ua: &str) -> Self {
        let lower = ua.to_ascii_lowercase();
        if lower.contains("ipad") || lower.contains("tablet") {
            Self::Tablet
        } else if lower.contains("mobi") || lower.contains("iphone") || lower.contains("android") {
            Self::Mobile
        } else {
            Self::Desktop
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, utoipa::ToSchema)]
pub struct TrackingEvent {
    pub id: TrackingEventId,
    pub tenant_id: TenantId,
    pub campaign_id: CampaignId,
    pub subscriber_id: SubscriberId,
    pub email: String,
    pub event_type: TrackingEventType,
    pub timestamp: DateTime<Utc>,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
    pub device_class: Option<DeviceClass>,
    pub link_url: Option<String>,
    pub metadata: serde_json::Value,
}

/// Bucket a recipient domain into a coarse ISP class (, exact
/// rules). Unknown domains bucket by their own lowercased domain string.
pub fn isp_bucket(domain: &str) -> String {
    let d = domain.to_ascii_lowercase();
    let rules: &[(&str, &str)] = &[
        ("gmail", "Gmail"),
        ("yahoo", "Yahoo"),
        ("ymail", "Yahoo"),
        ("outlook", "Microsoft"),
        ("hotmail", "Microsoft"),
        ("live.com", "Microsoft"),
        ("msn.com", "Microsoft"),
        ("aol", "AOL"),
        ("icloud", "Apple"),
        ("me.com", "Apple"),
        ("mac.com", "Apple"),
        ("comcast", "Comcast"),
        ("att.net", "AT&T"),
        ("verizon", "Verizon"),
    ];
    for (needle, bucket) in rules {
        if d.contains(needle) {
            return (*bucket).to_string();
        }
    }
    d
}

/// Extracts the domain from an already-normalized (lower-cased, trimmed)
/// email address.
pub fn domain_of(email: &str) -> &str {
    email.rsplit('@').next().unwrap_or("")
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn isp_bucketing_exact_rules() {
        assert_eq!(isp_bucket("gmail.com"), "Gmail");
        assert_eq!(isp_bucket("mail.yahoo.com"), "Yahoo");
        assert_eq!(isp_bucket("ymail.com"), "Yahoo");
        assert_eq!(isp_bucket("outlook.com"), "Microsoft");
        assert_eq!(isp_bucket("hotmail.com"), "Microsoft");
        assert_eq!(isp_bucket("live.com"), "Microsoft");
        assert_eq!(isp_bucket("msn.com"), "Microsoft");
        assert_eq!(isp_bucket("aol.com"), "AOL");
        assert_eq!(isp_bucket("icloud.com"), "Apple");
        assert_eq!(isp_bucket("me.com"), "Apple");
        assert_eq!(isp_bucket("mac.com"), "Apple");
        assert_eq!(isp_bucket("comcast.net"), "Comcast");
        assert_eq!(isp_bucket("att.net"), "AT&T");
        assert_eq!(isp_bucket("verizon.net"), "Verizon");
        assert_eq!(isp_bucket("example.org"), "example.org");
    }

    #[test]
    fn dedup_unique_event_types() {
        assert!(TrackingEventType::Opened.is_dedup_unique());
        assert!(TrackingEventType::Unsubscribed.is_dedup_unique());
        assert!(!TrackingEventType::Clicked.is_dedup_unique());
        assert!(!TrackingEventType::Sent.is_dedup_unique());
    }

    #[test]
    fn device_class_heuristic() {
        assert_eq!(
            DeviceClass::from_user_agent("Mozilla/5.0 (iPhone; CPU iPhone OS)"),
            DeviceClass::Mobile
        );
        assert_eq!(
            DeviceClass::from_user_agent("Mozilla/5.0 (iPad; CPU OS)"),
            DeviceClass::Tablet
        );
        assert_eq!(
            DeviceClass::from_user_agent("Mozilla/5.0 (Windows NT 10.0)"),
            DeviceClass::Desktop
        );
    }
}
