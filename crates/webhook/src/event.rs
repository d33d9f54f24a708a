//! The normalized event shape every provider parser converges on
//! (: `(type, recipient, reason?, bounce_class?, error_code?,
//! campaign_id?)`).
use campaign_core::CampaignId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookEventType {
    HardBounce,
    SoftBounce,
    SpamComplaint,
    Unsubscribe,
    Throttle,
    Deferred,
}

#[derive(Debug, Clone)]
pub struct NormalizedEvent {
    pub event_type: WebhookEventType,
    pub recipient: String,
    pub reason: Option<String>,
    pub bounce_class: Option<String>,
    pub error_code: Option<String>,
    pub campaign_id: Option<CampaignId>,
}

impl WebhookEventType {
    /// hard_bounce / spam_complaint / unsubscribe are terminal: they
    /// route to C10 and a C1 suppression call. soft_bounce / throttle /
    /// deferred route to C10 only.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::HardBounce | Self::SpamComplaint | Self::Unsubscribe)
    }
}

pub fn parse_campaign_id(raw: &str) -> Option<CampaignId> {
    raw.parse().ok()
}
