pub mod campaigns;
pub mod isp_health;
pub mod queue;
pub mod segments;
pub mod sending_profiles;
pub mod subscribers;
pub mod suppressions;
pub mod tracking;

pub use campaigns::CampaignRepo;
pub use isp_health::{IspCounterDelta, IspHealthRepo};
pub use queue::{NewQueueItem, QueueRepo};
pub use segments::SegmentRepo;
pub use sending_profiles::{SendingProfile, SendingProfileRepo};
pub use subscribers::SubscriberRepo;
pub use suppressions::SuppressionRepo;
pub use tracking::TrackingRepo;
