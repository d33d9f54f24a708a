//! Audience Resolver (C2): turns an `AudienceSelector`
//! into a bounded, non-restartable, lazily-polled sequence of recipient
//! records. Grounded on the teacher's chunked `queue/queue.rs` and
//! `spool.rs` "read, then advance" loops — exposed as a `futures::Stream`
//! so the Enqueue Worker can pull and render recipients one at a time
//! with backpressure, rather than materializing the whole rendered batch
//! before writing anything to the queue table.
use campaign_core::{AudienceSelector, Subscriber};
use db::{SegmentRepo, SubscriberRepo};
use futures::stream::{self, Stream};
use std::collections::HashSet;
use std::sync::Arc;
use suppression_hub::SuppressionHub;

#[derive(Debug, Clone)]
pub struct AudienceRecord {
    pub subscriber_id: campaign_core::SubscriberId,
    pub email: String,
    pub timezone: Option<String>,
    pub personalization_fields: serde_json::Value,
}

impl From<Subscriber> for AudienceRecord {
    fn from(s: Subscriber) -> Self {
        Self {
            subscriber_id: s.id,
            email: s.email,
            timezone: s.timezone,
            personalization_fields: s.custom_fields,
        }
    }
}

/// Resolves `selector` into the final recipient list
/// steps 1-5, then exposes it as a `Stream` for one-at-a-time, lazily
/// polled consumption downstream. The union/minus/dedup/truncate work
/// happens once, up front — there is no incremental pagination backing
/// the underlying repos, so "lazy" here means "lazily drained by the
/// caller", not "lazily fetched page by page".
pub async fn resolve(
    selector: &AudienceSelector,
    subscribers: &SubscriberRepo,
    segments: &SegmentRepo,
    suppression: &Arc<SuppressionHub>,
) -> anyhow::Result<impl Stream<Item = AudienceRecord>> {
    let mut seen = HashSet::new();
    let mut ordered: Vec<Subscriber> = Vec::new();

    // Step 1: union of confirmed subscribers across included lists...
    for subscriber in subscribers.confirmed_in_lists(&selector.included_lists).await? {
        if seen.insert(subscriber.email_hash.clone()) {
            ordered.push(subscriber);
        }
    }
    // ...and included segments, in segment order (step 4
    // "segment order defines first-seen").
    for segment_id in selector.included_segments {
        let Some(segment) = segments.get(segment_id).await? else {
            continue;
        };
        for subscriber in segments.confirmed_members(&segment).await? {
            if seen.insert(subscriber.email_hash.clone()) {
                ordered.push(subscriber);
            }
        }
    }

    // Step 2: minus union of addresses in suppression lists and of
    // subscribers matching suppression segments.
    let mut excluded_hashes: HashSet<String> = HashSet::new();
    if !selector.suppression_lists.is_empty() {
        for subscriber in subscribers.in_lists(&selector.suppression_lists).await? {
            excluded_hashes.insert(subscriber.email_hash);
        }
    }
    for segment_id in &selector.suppression_segments {
        let Some(segment) = segments.get(*segment_id).await? else {
            continue;
        };
        for subscriber in segments.all_members(&segment).await? {
            excluded_hashes.insert(subscriber.email_hash);
        }
    }

    let mut result: Vec<Subscriber> = ordered
        .into_iter()
        .filter(|s| !excluded_hashes.contains(&s.email_hash))
        // Step 3: minus every address C1 reports as suppressed.
        .filter(|s| !suppression.is_suppressed(&s.email))
        .collect();

    // Step 5: truncate to max_recipients if set and > 0.
    if let Some(max) = selector.max_recipients.filter(|&m| m > 0) {
        result.truncate(max as usize);
    }

    Ok(stream::iter(result.into_iter().map(AudienceRecord::from)))
}

#[cfg(test)]
mod test {
    use super::*;
    use campaign_core::{EmailHash, SegmentCriteria};

    #[test]
    fn audience_record_carries_custom_fields_as_personalization() {
        let subscriber = Subscriber {
            id: campaign_core::SubscriberId::new(),
            tenant_id: campaign_core::TenantId::new(),
            list_id: campaign_core::ListId::new(),
            email: "jane@example.com".to_string(),
            email_hash: EmailHash::compute("jane@example.com").sha256().to_string(),
            status: campaign_core::SubscriberStatus::Confirmed,
            custom_fields: serde_json::json!({"first_name": "Jane"}),
            engagement_score: 0.0,
            total_sent: 0,
            total_opens: 0,
            total_clicks: 0,
            last_open_at: None,
            last_click_at: None,
            last_sent_at: None,
            timezone: Some("America/New_York".to_string()),
        };
        let record = AudienceRecord::from(subscriber);
        assert_eq!(record.email, "jane@example.com");
        assert_eq!(record.personalization_fields["first_name"], "Jane");
        assert_eq!(record.timezone.as_deref(), Some("America/New_York"));
    }

    #[test]
    fn empty_segment_criteria_matches_everyone() {
        let criteria = SegmentCriteria::default();
        assert!(criteria.matches(&serde_json::json!({})));
    }
}
