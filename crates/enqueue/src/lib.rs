//! Enqueue Worker (C5): builds the per-recipient queue for
//! a campaign entering `preparing`, rendering each recipient's message
//! and upserting a queue row, then hands the campaign to `sending`.
//! Grounded on the teacher's `queue/queue.rs` scan-and-insert loop,
//! generalized from spool file enumeration to the audience resolver's
//! stream.
use audience::AudienceRecord;
use campaign_core::{AppError, Campaign, CampaignId, EspSelector, QueueItemId};
use campaign_state::CampaignStateMachine;
use chrono::{DateTime, Utc};
use config::TrackingSettings;
use db::{CampaignRepo, CoordinationStore, NewQueueItem, QueueRepo, SegmentRepo, SendingProfileRepo, SubscriberRepo};
use esp_adapter::select_profile;
use futures::StreamExt;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use suppression_hub::SuppressionHub;
use template::{render_message, RenderContext, RenderMode, TrackingFields};

/// How often (in enqueued rows) `queued_count` is checkpointed (spec.md
/// §4.4 step 5 "every N rows").
const QUEUED_COUNT_CHECKPOINT: u64 = 500;

pub struct EnqueueWorker {
    pub campaigns: CampaignRepo,
    pub subscribers: SubscriberRepo,
    pub segments: SegmentRepo,
    pub queue: QueueRepo,
    pub sending_profiles: SendingProfileRepo,
    pub suppression: Arc<SuppressionHub>,
    pub campaign_state: Arc<CampaignStateMachine>,
    pub coordination: Arc<dyn CoordinationStore>,
    pub tracking: TrackingSettings,
    pub lock_ttl: Duration,
    pub holder_id: String,
}

pub struct EnqueueOutcome {
    pub enqueued: u64,
    pub skipped_no_profile: u64,
}

impl EnqueueWorker {
    /// Runs the full build for `campaign_id`, which must already be in
    /// `preparing`. Acquires the same per-campaign lock `campaign-state`
    /// uses for the `scheduled -> preparing` transition (re-entrant for
    /// the same `holder_id`, per `CoordinationStore::acquire`), so an
    /// instant send — which enters `preparing` without ever taking the
    /// lock — is still serialized against a concurrent duplicate run.
    pub async fn run(&self, campaign_id: CampaignId) -> Result<EnqueueOutcome, AppError> {
        let lock_name = campaign_state::lock_resource_name(campaign_id);
        let acquired = self
            .coordination
            .acquire(&lock_name, &self.holder_id, self.lock_ttl)
            .await
            .map_err(AppError::Internal)?;
        if !acquired {
            return Err(AppError::Conflict(format!(
                "campaign {campaign_id} is already being prepared by another worker"
            )));
        }

        let result = self.build(campaign_id).await;

        self.coordination
            .release(&lock_name, &self.holder_id)
            .await
            .map_err(AppError::Internal)?;

        result
    }

    async fn build(&self, campaign_id: CampaignId) -> Result<EnqueueOutcome, AppError> {
        let campaign = self
            .campaigns
            .get(campaign_id)
            .await
            .map_err(AppError::Internal)?
            .ok_or_else(|| AppError::NotFound(format!("campaign {campaign_id}")))?;

        let candidate_ids: Vec<_> = match &campaign.esp_selector {
            EspSelector::Single { profile } => vec![*profile],
            EspSelector::WeightedQuota { quotas } => quotas.iter().map(|q| q.profile).collect(),
        };
        let profiles = self
            .sending_profiles
            .get_many(&candidate_ids)
            .await
            .map_err(AppError::Internal)?;

        let records: Vec<AudienceRecord> = audience::resolve(
            &campaign.audience,
            &self.subscribers,
            &self.segments,
            &self.suppression,
        )
        .await
        .map_err(AppError::Internal)?
        .collect()
        .await;

        let total = records.len() as u64;
        let hmac_key = self.tracking.hmac_key_for_tenant(&campaign.tenant_id.to_string()).to_string();

        let mut enqueued: u64 = 0;
        let mut skipped_no_profile: u64 = 0;
        let mut rng = rand::thread_rng();

        for (index, record) in records.into_iter().enumerate() {
            let Some(profile_id) = select_profile(&campaign.esp_selector, &profiles, &mut rng) else {
                skipped_no_profile += 1;
                continue;
            };

            let scheduled_at = spread_scheduled_at(&campaign, index as u64, total.max(1));

            let rendered = self
                .render_for_recipient(&campaign, &record, &hmac_key)
                .map_err(AppError::Internal)?;

            let item = NewQueueItem {
                campaign_id: campaign.id,
                subscriber_id: record.subscriber_id,
                rendered_subject: rendered.subject.text,
                rendered_html: rendered.html.map(|o| o.text).unwrap_or_default(),
                rendered_text: rendered.text.map(|o| o.text),
                esp_profile: profile_id,
                priority: campaign.throttle.priority(),
                scheduled_at,
            };

            if self
                .queue
                .insert_ignore_duplicates(&item)
                .await
                .map_err(AppError::Internal)?
            {
                enqueued += 1;
                server_runtime::metrics::CAMPAIGN_ENQUEUED
                    .with_label_values(&[&campaign.id.to_string()])
                    .inc();
                if enqueued % QUEUED_COUNT_CHECKPOINT == 0 {
                    self.campaigns
                        .set_queued_count(campaign.id, enqueued)
                        .await
                        .map_err(AppError::Internal)?;
                }
            }
        }

        self.campaigns
            .set_queued_count(campaign.id, enqueued)
            .await
            .map_err(AppError::Internal)?;

        let now = Utc::now();
        if enqueued == 0 {
            self.campaign_state.mark_audience_empty(campaign.id, now).await?;
        } else {
            self.campaign_state.mark_ready(campaign.id, enqueued, now).await?;
        }

        Ok(EnqueueOutcome { enqueued, skipped_no_profile })
    }

    fn render_for_recipient(
        &self,
        campaign: &Campaign,
        record: &AudienceRecord,
        hmac_key: &str,
    ) -> anyhow::Result<template::RenderedMessage> {
        let mut ctx = RenderContext::default();
        if let Value::Object(fields) = &record.personalization_fields {
            ctx.custom = fields.clone();
        }
        let mut subscriber = Map::new();
        subscriber.insert("email".to_string(), Value::String(record.email.clone()));
        if let Some(tz) = &record.timezone {
            subscriber.insert("timezone".to_string(), Value::String(tz.clone()));
        }
        ctx.subscriber = subscriber;

        let mut campaign_fields = Map::new();
        campaign_fields.insert("id".to_string(), Value::String(campaign.id.to_string()));
        campaign_fields.insert("name".to_string(), Value::String(campaign.name.clone()));
        if let Some(preview) = &campaign.preview_text {
            campaign_fields.insert("preview_text".to_string(), Value::String(preview.clone()));
        }
        ctx.campaign = campaign_fields;

        let fields = TrackingFields {
            tenant_id: campaign.tenant_id,
            campaign_id: campaign.id,
            subscriber_id: record.subscriber_id,
            message_id: stable_message_id(campaign.id, record.subscriber_id),
            original_url: None,
        };

        render_message(
            &campaign.subject_template,
            Some(&campaign.html_template),
            campaign.text_template.as_deref(),
            &ctx,
            RenderMode::Lax,
            &fields,
            hmac_key,
            &self.tracking.base_url,
            true,
        )
    }
}

/// A correlation id for tracking links, stable across re-renders of the
/// same (campaign, subscriber) pair — distinct from `QueueItemId`, which
/// is only assigned on a successful (non-conflicting) insert.
fn stable_message_id(campaign_id: CampaignId, subscriber_id: campaign_core::SubscriberId) -> String {
    format!("{campaign_id}:{subscriber_id}")
}

/// Spreads recipients uniformly across the throttle's duration window
/// (step 3); `now` when the policy has no duration.
fn spread_scheduled_at(campaign: &Campaign, index: u64, total: u64) -> DateTime<Utc> {
    let now = Utc::now();
    let Some(hours) = campaign.throttle.duration_hours().filter(|&h| h > 0) else {
        return now;
    };
    let fraction = index as f64 / total as f64;
    let offset_seconds = (hours as f64 * 3600.0 * fraction) as i64;
    now + chrono::Duration::seconds(offset_seconds)
}

#[allow(unused)]
fn _assert_queue_item_id_type_is_used(_: QueueItemId) {}

#[cfg(test)]
mod test {
    use super::*;
    use campaign_core::{ThrottlePolicy, ThrottlePreset};

    fn campaign_with_throttle(throttle: ThrottlePolicy) -> Campaign {
        Campaign {
            id: CampaignId::new(),
            tenant_id: campaign_core::TenantId::new(),
            name: "test".to_string(),
            subject_template: "Hi".to_string(),
            html_template: "<p>hi</p>".to_string(),
            text_template: None,
            preview_text: None,
            from_name: "Acme".to_string(),
            from_address: "news@acme.example".to_string(),
            reply_address: None,
            audience: campaign_core::AudienceSelector::default(),
            esp_selector: campaign_core::EspSelector::Single { profile: campaign_core::EspProfileId::new() },
            throttle,
            max_recipients: None,
            send_type: campaign_core::SendType::Instant,
            scheduled_at: None,
            status: campaign_core::CampaignStatus::Preparing,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            started_at: None,
            completed_at: None,
            counters: campaign_core::CampaignCounters::default(),
        }
    }

    #[test]
    fn preset_throttle_sends_immediately() {
        let campaign = campaign_with_throttle(ThrottlePolicy::Preset { preset: ThrottlePreset::Gentle });
        let at = spread_scheduled_at(&campaign, 5, 100);
        assert!((at - Utc::now()).num_seconds().abs() < 2);
    }

    #[test]
    fn custom_throttle_spreads_across_duration() {
        let campaign = campaign_with_throttle(ThrottlePolicy::Custom {
            rate_per_minute: 100,
            duration_hours: Some(10),
        });
        let first = spread_scheduled_at(&campaign, 0, 100);
        let last = spread_scheduled_at(&campaign, 99, 100);
        assert!((first - Utc::now()).num_seconds().abs() < 2);
        assert!((last - Utc::now()).num_seconds() > 9 * 3600);
    }

    #[test]
    fn stable_message_id_is_deterministic() {
        let campaign_id = CampaignId::new();
        let subscriber_id = campaign_core::SubscriberId::new();
        assert_eq!(
            stable_message_id(campaign_id, subscriber_id),
            stable_message_id(campaign_id, subscriber_id)
        );
    }
}
