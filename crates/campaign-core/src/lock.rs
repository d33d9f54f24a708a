//! The DistributedLock entity: at most one holder with a
//! non-expired lease per resource; releases are holder-gated. The
//! acquire/renew/release mechanics live in `db::CoordinationStore`; this
//! crate only names the row shape both the Postgres and Redis backends
//! agree on.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct DistributedLock {
    pub resource_name: String,
    pub holder_id: String,
    pub expires_at: DateTime<Utc>,
}

impl DistributedLock {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    pub fn is_held_by(&self, holder_id: &str, now: DateTime<Utc>) -> bool {
        self.holder_id == holder_id && !self.is_expired(now)
    }
}
