//! The per-item send algorithm (steps 1-7), grounded on the
//! teacher's `smtp_dispatcher.rs` attempt/classify/requeue loop,
//! generalized from an SMTP `Response` to the ESP adapter's normalized
//! `SendOutcome`.
use crate::backoff::backoff;
use campaign_core::{
    Campaign, CampaignStatus, EspSelector, QueueItem, QueueItemStatus, SubscriberStatus,
    SuppressionCategory, TrackingEventType,
};
use campaign_state::CampaignStateMachine;
use chrono::Utc;
use config::{DispatchSettings, IspThrottleSettings};
use db::{
    CampaignRepo, IspCounterDelta, IspHealthRepo, QueueRepo, SendingProfileRepo, SubscriberRepo,
    TrackingRepo,
};
use esp_adapter::{select_profile, EspClient, SendOutcome, SendRequest};
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use suppression_hub::SuppressionHub;
use throttle::{ThrottleSpec, ThrottleStore};

pub struct DispatchWorker {
    pub queue: QueueRepo,
    pub campaigns: CampaignRepo,
    pub subscribers: SubscriberRepo,
    pub sending_profiles: SendingProfileRepo,
    pub isp_health: IspHealthRepo,
    pub tracking: TrackingRepo,
    pub suppression: Arc<SuppressionHub>,
    pub campaign_state: Arc<CampaignStateMachine>,
    pub esp_clients: HashMap<String, Arc<dyn EspClient>>,
    pub throttle: ThrottleStore,
    pub isp_throttle: IspThrottleSettings,
    pub settings: DispatchSettings,
    pub holder_id: String,
}

/// Domain-level ISP bucket for an email address, for the per-ISP rate
/// limit layer and the ISP health counters.
fn bucket_for_email(email: &str) -> String {
    let domain = email.rsplit('@').next().unwrap_or(email);
    campaign_core::isp_bucket(domain)
}

/// What a leased item resolved to, for the caller's batch-level logging.
#[derive(Debug, PartialEq, Eq)]
pub enum Disposition {
    Sent,
    Skipped,
    Requeued,
    MirroredCampaignState,
    Failed,
}

impl DispatchWorker {
    /// Leases up to `lease_batch_size` ready rows and processes each
    /// concurrently, returning how many were leased this round.
    pub async fn run_once(&self) -> anyhow::Result<usize> {
        let items = self
            .queue
            .lease_batch(
                &self.holder_id,
                self.settings.lease_duration,
                self.settings.lease_batch_size,
            )
            .await?;
        if items.is_empty() {
            return Ok(0);
        }

        let count = items.len();
        let campaign_ids: std::collections::HashSet<_> = items.iter().map(|i| i.campaign_id).collect();
        let mut remaining = items;
        while !remaining.is_empty() {
            let batch: Vec<_> = remaining
                .drain(..remaining.len().min(self.settings.worker_concurrency))
                .collect();
            let mut handles = Vec::with_capacity(batch.len());
            for item in batch {
                handles.push(self.process_item(item));
            }
            for result in futures::future::join_all(handles).await {
                if let Err(err) = result {
                    tracing::error!(error = %err, "dispatch item failed");
                }
            }
        }

        for campaign_id in campaign_ids {
            if let Ok(depth) = self.queue.count_for_campaign(campaign_id).await {
                server_runtime::metrics::CAMPAIGN_QUEUE_DEPTH
                    .with_label_values(&[&campaign_id.to_string()])
                    .set(depth as i64);
            }
        }
        Ok(count)
    }

    /// Reclaims items whose lease expired without the holder finalizing
    /// them (reaper).
    pub async fn reap(&self) -> anyhow::Result<u64> {
        self.queue.reap_expired_leases(Utc::now()).await
    }

    /// Drives the `sending -> completed|completed_with_errors` transition
    /// for every campaign still marked `sending` once its queue has
    /// drained (`campaign_state.check_completion` is otherwise never
    /// called at runtime).
    pub async fn check_completions(&self) -> anyhow::Result<u64> {
        let now = Utc::now();
        let sending = self.campaigns.list_by_status(CampaignStatus::Sending).await?;
        let mut completed = 0;
        for campaign in sending {
            match self.campaign_state.check_completion(campaign.id, now).await {
                Ok(Some(_)) => completed += 1,
                Ok(None) => {}
                Err(err) => tracing::error!(error = %err, campaign_id = %campaign.id, "check_completion failed"),
            }
        }
        Ok(completed)
    }

    async fn process_item(&self, item: QueueItem) -> anyhow::Result<Disposition> {
        let Some(subscriber) = self.subscribers.get(item.subscriber_id).await? else {
            self.queue.mark_skipped(item.id, "subscriber no longer exists").await?;
            return Ok(Disposition::Skipped);
        };

        // Step 1: re-check suppression since enqueue time.
        if self.suppression.is_suppressed(&subscriber.email) {
            self.queue
                .mark_skipped(item.id, "suppressed since enqueue")
                .await?;
            return Ok(Disposition::Skipped);
        }

        // Step 2: re-check campaign status, mirroring it onto the item
        // if the campaign is no longer actively sending.
        match self.campaign_state.status(item.campaign_id).await? {
            Some(CampaignStatus::Sending) => {}
            Some(CampaignStatus::Paused) => {
                self.queue
                    .mirror_campaign_status(item.id, QueueItemStatus::Paused)
                    .await?;
                return Ok(Disposition::MirroredCampaignState);
            }
            Some(CampaignStatus::Cancelled) => {
                self.queue
                    .mirror_campaign_status(item.id, QueueItemStatus::Cancelled)
                    .await?;
                return Ok(Disposition::MirroredCampaignState);
            }
            _ => {
                self.queue
                    .mark_skipped(item.id, "campaign is no longer sending")
                    .await?;
                return Ok(Disposition::Skipped);
            }
        }

        let Some(campaign) = self.campaigns.get(item.campaign_id).await? else {
            self.queue.mark_failed(item.id, "campaign not found").await?;
            return Ok(Disposition::Failed);
        };

        // Step 3: resolve the ESP profile among healthy, under-cap
        // candidates.
        let candidate_ids: Vec<_> = match &campaign.esp_selector {
            EspSelector::Single { profile } => vec![*profile],
            EspSelector::WeightedQuota { quotas } => quotas.iter().map(|q| q.profile).collect(),
        };
        let profiles = self.sending_profiles.get_many(&candidate_ids).await?;
        let mut rng = rand::thread_rng();
        let Some(profile_id) = select_profile(&campaign.esp_selector, &profiles, &mut rng) else {
            self.queue
                .mark_failed(item.id, "no healthy esp profile available")
                .await?;
            return Ok(Disposition::Failed);
        };
        let profile = profiles
            .iter()
            .find(|p| p.id == profile_id)
            .expect("select_profile only returns a profile present in `profiles`");

        // Step 4: layered rate limiting — per-campaign, then per-ISP
        // bucket. Per-profile daily/hourly caps are already enforced by
        // `select_profile`'s eligibility filter.
        let isp_bucket = bucket_for_email(&subscriber.email);
        if let Some(requeue_at) = self.throttled_retry_at(&campaign, &isp_bucket).await? {
            self.queue
                .retry_with_backoff(item.id, item.attempt_count, "rate limited, retrying", requeue_at)
                .await?;
            return Ok(Disposition::Requeued);
        }

        // Step 5: invoke the adapter.
        let Some(client) = self.esp_clients.get(&profile.provider) else {
            self.queue
                .mark_failed(item.id, &format!("no esp client configured for provider {}", profile.provider))
                .await?;
            return Ok(Disposition::Failed);
        };
        let request = SendRequest {
            from_name: campaign.from_name.clone(),
            from_address: campaign.from_address.clone(),
            reply_address: campaign.reply_address.clone(),
            to_address: subscriber.email.clone(),
            subject: item.rendered_subject.clone(),
            html_body: Some(item.rendered_html.clone()),
            text_body: item.rendered_text.clone(),
            message_id: item.id.to_string(),
        };
        let send_timer = server_runtime::metrics::ESP_SEND_LATENCY
            .with_label_values(&[&profile.provider])
            .start_timer();
        let outcome = client.send(&request).await;
        send_timer.observe_duration();
        server_runtime::metrics::LEASE_TO_SEND_LATENCY
            .with_label_values(&[&campaign.id.to_string()])
            .observe((Utc::now() - item.created_at).num_milliseconds().max(0) as f64 / 1000.0);

        // Step 6: finalize.
        match outcome {
            SendOutcome::Ok { provider_message_id } => {
                self.queue.mark_sent(item.id).await?;
                self.sending_profiles.mark_sent(profile.id).await?;
                self.campaigns.increment_counter(campaign.id, "sent_count").await?;
                server_runtime::metrics::CAMPAIGN_SENT
                    .with_label_values(&[&campaign.id.to_string()])
                    .inc();
                let now = Utc::now();
                self.tracking
                    .record(
                        campaign.tenant_id,
                        campaign.id,
                        subscriber.id,
                        &subscriber.email,
                        TrackingEventType::Sent,
                        now,
                        None,
                        None,
                        None,
                        None,
                        serde_json::json!({ "provider_message_id": provider_message_id }),
                    )
                    .await?;
                self.isp_health
                    .bump(
                        campaign.tenant_id,
                        &isp_bucket,
                        IspCounterDelta { total_sent: 1, ..Default::default() },
                        now,
                    )
                    .await?;
                Ok(Disposition::Sent)
            }
            SendOutcome::Error { category, provider_reason } => {
                let next_attempt = item.attempt_count + 1;
                if category.is_retryable() && next_attempt < self.settings.max_attempts {
                    let retry_at = Utc::now()
                        + backoff(self.settings.backoff_base_minutes, item.attempt_count, &mut rng);
                    self.queue
                        .retry_with_backoff(item.id, next_attempt, &provider_reason, retry_at)
                        .await?;
                    return Ok(Disposition::Requeued);
                }

                self.queue.mark_failed(item.id, &provider_reason).await?;
                server_runtime::metrics::CAMPAIGN_BOUNCED
                    .with_label_values(&[&campaign.id.to_string(), &category.to_string()])
                    .inc();
                if category.is_terminal() {
                    self.suppression
                        .suppress(
                            &subscriber.email,
                            SuppressionCategory::HardBounce,
                            "dispatch",
                            Some(&provider_reason),
                            Some(campaign.id),
                        )
                        .await?;
                    if subscriber.status.may_transition_to(SubscriberStatus::Bounced) {
                        self.subscribers.set_status(subscriber.id, SubscriberStatus::Bounced).await?;
                    }
                }
                Ok(Disposition::Failed)
            }
        }
    }

    /// Returns `Some(retry_at)` if either the per-campaign or per-ISP
    /// rate limit rejects this send right now.
    async fn throttled_retry_at(
        &self,
        campaign: &Campaign,
        isp_bucket: &str,
    ) -> anyhow::Result<Option<chrono::DateTime<Utc>>> {
        let campaign_spec = ThrottleSpec::from_rate_per_minute(campaign.throttle.rate_per_minute());
        let campaign_key = format!("campaign:{}", campaign.id);
        let result = campaign_spec.throttle(&self.throttle, &campaign_key).await?;
        if result.throttled {
            return Ok(Some(Utc::now() + retry_duration(result.retry_after)));
        }

        if let Some(raw) = self.isp_throttle.caps.get(isp_bucket) {
            let spec: ThrottleSpec = raw
                .as_str()
                .try_into()
                .map_err(|err: String| anyhow::anyhow!(err))?;
            let key = format!("isp:{isp_bucket}");
            let result = spec.throttle(&self.throttle, &key).await?;
            if result.throttled {
                return Ok(Some(Utc::now() + retry_duration(result.retry_after)));
            }
        }

        Ok(None)
    }
}

fn retry_duration(retry_after: Option<Duration>) -> chrono::Duration {
    chrono::Duration::from_std(retry_after.unwrap_or(Duration::from_secs(5)))
        .unwrap_or(chrono::Duration::seconds(5))
}
