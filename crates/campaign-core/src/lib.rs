//! Shared domain types for the campaign send pipeline: every entity named
//! in , id newtypes, email normalization/hashing, and the
//! error taxonomy of §7. Analogous to the teacher's `message` +
//! `kumo-api-types` crates: one dependency-free place every other crate
//! in the workspace can agree on for "what a Campaign/QueueItem/etc is".
pub mod campaign;
pub mod email;
pub mod error;
pub mod ids;
pub mod isp;
pub mod lock;
pub mod queue_item;
pub mod segment;
pub mod subscriber;
pub mod suppression;
pub mod tracking_event;

pub use campaign::{
    AudienceSelector, Campaign, CampaignCounters, CampaignStatus, EspQuota, EspSelector, SendType,
    ThrottlePolicy, ThrottlePreset,
};
pub use email::{normalize, EmailHash};
pub use error::AppError;
pub use ids::{
    CampaignId, EspProfileId, ListId, QueueItemId, SegmentId, SubscriberId, SuppressionEntryId,
    TenantId, TrackingEventId,
};
pub use isp::IspHealth;
pub use lock::DistributedLock;
pub use queue_item::{QueueItem, QueueItemStatus};
pub use segment::{Segment, SegmentCondition, SegmentCriteria, SegmentOp};
pub use subscriber::{engagement_score, validate_custom_fields, Subscriber, SubscriberStatus};
pub use suppression::{SuppressionCategory, SuppressionEntry};
pub use tracking_event::{domain_of, isp_bucket, DeviceClass, TrackingEvent, TrackingEventType};
