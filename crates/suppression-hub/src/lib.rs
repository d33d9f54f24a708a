//! Suppression Hub (C1): the authoritative set of
//! addresses the system will never mail. An in-memory mirror of the
//! durable `suppressions` table backs `is_suppressed`/`scrub` with O(1)
//! expected lookups; `suppress` writes through to the database before
//! updating the mirror, so a crash between the two never makes the hub
//! more permissive than the durable store.
use campaign_core::{normalize, CampaignId, EmailHash, SuppressionCategory, SuppressionEntry};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use db::SuppressionRepo;
use std::sync::Arc;

/// Well-known role-based local parts (`role_based` category).
/// Not auto-applied to every suppress call — callers that import a list
/// without per-address evidence can consult this to pre-classify.
const ROLE_BASED_LOCAL_PARTS: &[&str] = &[
    "postmaster",
    "abuse",
    "noreply",
    "no-reply",
    "mailer-daemon",
    "webmaster",
    "hostmaster",
];

pub fn is_role_based_address(email: &str) -> bool {
    let normalized = normalize(email);
    let local_part = normalized.split('@').next().unwrap_or("");
    ROLE_BASED_LOCAL_PARTS.contains(&local_part)
}

#[derive(Debug, Clone, Copy)]
pub struct SoftBouncePolicy {
    pub threshold: u32,
    pub window: std::time::Duration,
}

impl Default for SoftBouncePolicy {
    fn default() -> Self {
        Self {
            threshold: 5,
            window: std::time::Duration::from_secs(14 * 24 * 3600),
        }
    }
}

/// One global list id used for the legacy MD5-hash mirror writes
/// ("writes an entry to the global list with the MD5 of
/// the email"); a single well-known UUID is fine since it names a
/// logical bucket, not a tenant-scoped resource.
pub fn legacy_suppression_list_id() -> uuid::Uuid {
    uuid::Uuid::nil()
}

/// Tracks soft-bounce timestamps per normalized email within a trailing
/// window, independent of the durable store, so it can be unit-tested
/// without a database.
#[derive(Default)]
pub struct SoftBounceTracker {
    counts: DashMap<String, Vec<DateTime<Utc>>>,
    policy: SoftBouncePolicy,
}

impl SoftBounceTracker {
    pub fn new(policy: SoftBouncePolicy) -> Self {
        Self {
            counts: DashMap::new(),
            policy,
        }
    }

    /// Records a soft bounce, returning `true` if this push crossed the
    /// promotion threshold within the trailing window (/// "threshold-based ... promote to soft_bounce_promoted").
    pub fn record(&self, email: &str, at: DateTime<Utc>) -> bool {
        let normalized = normalize(email);
        let mut entry = self.counts.entry(normalized).or_default();
        let cutoff = at - chrono::Duration::from_std(self.policy.window).unwrap_or_default();
        entry.retain(|t| *t >= cutoff);
        entry.push(at);
        entry.len() as u32 >= self.policy.threshold
    }
}

pub struct SuppressionHub {
    repo: SuppressionRepo,
    mirror: DashMap<String, SuppressionCategory>,
    soft_bounces: SoftBounceTracker,
}

impl SuppressionHub {
    /// Loads the full suppression set into the in-memory mirror
    /// ("the set is loaded at start-up").
    pub async fn load(repo: SuppressionRepo, soft_bounce_policy: SoftBouncePolicy) -> anyhow::Result<Arc<Self>> {
        let entries = repo.load_all().await?;
        let mirror = DashMap::with_capacity(entries.len());
        for entry in entries {
            mirror.insert(entry.email_hash_sha256, entry.category);
        }
        tracing::info!(count = mirror.len(), "suppression hub loaded");
        Ok(Arc::new(Self {
            repo,
            mirror,
            soft_bounces: SoftBounceTracker::new(soft_bounce_policy),
        }))
    }

    pub fn is_suppressed(&self, email: &str) -> bool {
        let hash = EmailHash::compute(email);
        self.mirror.contains_key(hash.sha256())
    }

    pub fn is_suppressed_by_hash(&self, email_hash_sha256: &str) -> bool {
        self.mirror.contains_key(email_hash_sha256)
    }

    /// Upsert honoring the never-downgrade precedence rule (spec.md
    /// §4.2), writing through to the durable store and the legacy
    /// MD5-hash mirror before updating the in-memory set.
    pub async fn suppress(
        &self,
        email: &str,
        category: SuppressionCategory,
        source: &str,
        reason: Option<&str>,
        campaign_id: Option<CampaignId>,
    ) -> anyhow::Result<SuppressionEntry> {
        let normalized = normalize(email);
        let hash = EmailHash::compute(&normalized);
        let entry = self
            .repo
            .upsert(
                &normalized,
                hash.sha256(),
                hash.md5(),
                category,
                source,
                reason,
                campaign_id,
                legacy_suppression_list_id(),
            )
            .await?;
        self.mirror.insert(entry.email_hash_sha256.clone(), entry.category);
        Ok(entry)
    }

    /// Records a soft bounce against `email`; `true` means the caller
    /// should follow up with `suppress(..., SoftBouncePromoted, ...)`.
    pub fn record_soft_bounce(&self, email: &str, at: DateTime<Utc>) -> bool {
        self.soft_bounces.record(email, at)
    }

    /// Bulk filter used by the Enqueue Worker (`scrub`):
    /// returns only the addresses that are NOT suppressed.
    pub fn scrub(&self, emails: Vec<String>) -> Vec<String> {
        emails
            .into_iter()
            .filter(|email| !self.is_suppressed(email))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.mirror.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mirror.is_empty()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn role_based_detection() {
        assert!(is_role_based_address("Postmaster@Example.com"));
        assert!(is_role_based_address("no-reply@example.com"));
        assert!(!is_role_based_address("jane@example.com"));
    }

    #[test]
    fn soft_bounce_promotion_threshold() {
        let tracker = SoftBounceTracker::new(SoftBouncePolicy {
            threshold: 3,
            window: std::time::Duration::from_secs(3600),
        });
        let now = Utc::now();
        assert!(!tracker.record("jane@example.com", now));
        assert!(!tracker.record("jane@example.com", now));
        assert!(tracker.record("jane@example.com", now));
    }

    #[test]
    fn soft_bounce_window_expires_old_entries() {
        let tracker = SoftBounceTracker::new(SoftBouncePolicy {
            threshold: 2,
            window: std::time::Duration::from_secs(60),
        });
        let t0 = Utc::now();
        assert!(!tracker.record("jane@example.com", t0));
        let t1 = t0 + chrono::Duration::seconds(120);
        // first bounce has aged out of the window, so this alone is not a promotion
        assert!(!tracker.record("jane@example.com", t1));
    }
}
