//! Durable storage layer: connection pooling, schema migrations, the
//! distributed coordination store, and one repository per aggregate the
//! higher-level crates (suppression-hub, campaign-state, audience,
//! enqueue, dispatch, tracking, webhook, metrics-aggregator) build on.
pub mod coordination;
pub mod pool;
pub mod repo;

pub use coordination::CoordinationStore;
#[cfg(feature = "redis-backend")]
pub use coordination::RedisCoordinationStore;
pub use coordination::PostgresCoordinationStore;
pub use pool::{connect, migrate, PoolConfig};
pub use repo::{
    CampaignRepo, IspCounterDelta, IspHealthRepo, NewQueueItem, QueueRepo, SegmentRepo,
    SendingProfile, SendingProfileRepo, SubscriberRepo, SuppressionRepo, TrackingRepo,
};
