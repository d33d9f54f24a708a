//! Metrics Aggregator (C10): the single place a
//! normalized event — arriving from the tracking endpoint (C8) or the
//! webhook ingestor (C9) — fans out to the tracking-event log, campaign
//! counters, subscriber row, and per-ISP health. Grounded on the
//! teacher's `logging/disposition.rs` ("one entry point fans an event
//! out to every counter it affects") and `delivery_metrics.rs`
//! (per-queue/per-site counter bookkeeping, generalized here to
//! per-campaign/per-subscriber/per-ISP-bucket).
use campaign_core::{
    engagement_score, domain_of, isp_bucket, CampaignId, DeviceClass, SubscriberId,
    SubscriberStatus, TenantId, TrackingEventType,
};
use chrono::{DateTime, Utc};
use db::{CampaignRepo, IspCounterDelta, IspHealthRepo, SubscriberRepo, TrackingRepo};

/// One normalized event ready to be applied. Callers (tracking, webhook)
/// are responsible for resolving `subscriber_id` first — the tracking
/// endpoint has it from the signed payload, the webhook ingestor looks
/// it up by `(tenant, recipient email)`.
#[derive(Debug, Clone)]
pub struct IncomingEvent {
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

/// What happened when an event was applied, for the caller's logging /
/// test assertions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    /// Recorded and every downstream counter updated.
    Recorded,
    /// A dedup-unique event type (open/unsubscribe) already had a row
    /// for this (campaign, subscriber); nothing further was touched
    /// ("re-opens do not inflate unique-open counters").
    DuplicateIgnored,
    /// The subscriber referenced by the event no longer exists; the
    /// event is dropped rather than erroring the whole ingest (spec.md
    /// §4.8 "fail closed ... do not crash").
    UnknownSubscriber,
}

/// Campaign counter column an event type bumps, if any. Names match the
/// `*_count` columns of the `campaigns` table (migration 0001), not the
/// `CampaignCounters` struct field names.
fn counter_column(event_type: TrackingEventType) -> Option<&'static str> {
    use TrackingEventType::*;
    match event_type {
        Sent => Some("sent_count"),
        Delivered => Some("delivered_count"),
        Opened => Some("open_count"),
        Clicked => Some("click_count"),
        Bounced => Some("bounce_count"),
        Complained => Some("complaint_count"),
        Unsubscribed => Some("unsubscribe_count"),
        Deferred => None,
    }
}

/// The monotone subscriber status an event type drives, if any (spec.md
/// §5 "subscriber status transitions are monotone in the direction
/// confirmed → {unsubscribed, bounced, complained}").
fn status_for(event_type: TrackingEventType) -> Option<SubscriberStatus> {
    use TrackingEventType::*;
    match event_type {
        Bounced => Some(SubscriberStatus::Bounced),
        Complained => Some(SubscriberStatus::Complained),
        Unsubscribed => Some(SubscriberStatus::Unsubscribed),
        _ => None,
    }
}

fn isp_delta_for(event_type: TrackingEventType) -> Option<IspCounterDelta> {
    use TrackingEventType::*;
    match event_type {
        Sent => Some(IspCounterDelta { total_sent: 1, ..Default::default() }),
        Delivered => Some(IspCounterDelta { delivered: 1, ..Default::default() }),
        Bounced => Some(IspCounterDelta { bounced: 1, ..Default::default() }),
        Complained => Some(IspCounterDelta { complained: 1, ..Default::default() }),
        Opened => Some(IspCounterDelta { opened: 1, ..Default::default() }),
        Clicked => Some(IspCounterDelta { clicked: 1, ..Default::default() }),
        Unsubscribed | Deferred => None,
    }
}

pub struct MetricsAggregator {
    tracking: TrackingRepo,
    subscribers: SubscriberRepo,
    campaigns: CampaignRepo,
    isp_health: IspHealthRepo,
}

impl MetricsAggregator {
    pub fn new(
        tracking: TrackingRepo,
        subscribers: SubscriberRepo,
        campaigns: CampaignRepo,
        isp_health: IspHealthRepo,
    ) -> Self {
        Self { tracking, subscribers, campaigns, isp_health }
    }

    pub async fn apply(&self, event: IncomingEvent) -> anyhow::Result<Applied> {
        let Some(subscriber) = self.subscribers.get(event.subscriber_id).await? else {
            tracing::warn!(
                subscriber_id = %event.subscriber_id,
                "dropping event for unknown subscriber"
            );
            return Ok(Applied::UnknownSubscriber);
        };

        let inserted = self
            .tracking
            .record(
                event.tenant_id,
                event.campaign_id,
                event.subscriber_id,
                &event.email,
                event.event_type,
                event.timestamp,
                event.ip.as_deref(),
                event.user_agent.as_deref(),
                event.device_class,
                event.link_url.as_deref(),
                event.metadata,
            )
            .await?;

        if !inserted && event.event_type.is_dedup_unique() {
            return Ok(Applied::DuplicateIgnored);
        }

        if let Some(column) = counter_column(event.event_type) {
            self.campaigns.increment_counter(event.campaign_id, column).await?;
        }

        match event.event_type {
            TrackingEventType::Complained => {
                server_runtime::metrics::CAMPAIGN_COMPLAINED
                    .with_label_values(&[&event.campaign_id.to_string()])
                    .inc();
            }
            TrackingEventType::Bounced => {
                server_runtime::metrics::CAMPAIGN_BOUNCED
                    .with_label_values(&[&event.campaign_id.to_string(), "reported"])
                    .inc();
            }
            _ => {}
        }

        match event.event_type {
            TrackingEventType::Opened => {
                let score = engagement_score(
                    subscriber.total_sent,
                    subscriber.total_opens + 1,
                    subscriber.total_clicks,
                    Some(event.timestamp),
                    event.timestamp,
                );
                self.subscribers.record_open(subscriber.id, event.timestamp, score).await?;
            }
            TrackingEventType::Clicked => {
                let score = engagement_score(
                    subscriber.total_sent,
                    subscriber.total_opens,
                    subscriber.total_clicks + 1,
                    subscriber.last_open_at,
                    event.timestamp,
                );
                self.subscribers.record_click(subscriber.id, event.timestamp, score).await?;
            }
            TrackingEventType::Sent => {
                self.subscribers.record_sent(subscriber.id, event.timestamp).await?;
            }
            _ => {}
        }

        if let Some(next_status) = status_for(event.event_type) {
            if subscriber.status.may_transition_to(next_status) {
                self.subscribers.set_status(subscriber.id, next_status).await?;
            }
        }

        if let Some(delta) = isp_delta_for(event.event_type) {
            let domain = domain_of(&event.email);
            self.isp_health
                .bump(event.tenant_id, &isp_bucket(domain), delta, event.timestamp)
                .await?;
        }

        Ok(Applied::Recorded)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn counter_columns_cover_every_type_with_a_campaign_counter() {
        use TrackingEventType::*;
        assert_eq!(counter_column(Sent), Some("sent_count"));
        assert_eq!(counter_column(Opened), Some("open_count"));
        assert_eq!(counter_column(Clicked), Some("click_count"));
        assert_eq!(counter_column(Bounced), Some("bounce_count"));
        assert_eq!(counter_column(Complained), Some("complaint_count"));
        assert_eq!(counter_column(Unsubscribed), Some("unsubscribe_count"));
        assert_eq!(counter_column(Deferred), None);
    }

    #[test]
    fn status_updates_are_only_in_the_terminal_direction() {
        assert_eq!(status_for(TrackingEventType::Bounced), Some(SubscriberStatus::Bounced));
        assert_eq!(status_for(TrackingEventType::Sent), None);
        assert_eq!(status_for(TrackingEventType::Opened), None);
    }

    #[test]
    fn isp_delta_skips_unsubscribe_and_deferred() {
        assert!(isp_delta_for(TrackingEventType::Unsubscribed).is_none());
        assert!(isp_delta_for(TrackingEventType::Deferred).is_none());
        assert!(isp_delta_for(TrackingEventType::Bounced).is_some());
    }
}
