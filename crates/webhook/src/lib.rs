//! Webhook Ingestor (C9): one endpoint per ESP that accepts
//! provider JSON, generic JSON, or an ARF `multipart/report`, normalizes
//! whatever it receives, and routes it to the metrics aggregator (C10)
//! and, for terminal events, the suppression hub (C1). Grounded on the
//! teacher's `kumo-server-common::http_server` axum assembly (as C8 is)
//! and on `message::rfc5965::ARFReport` for the feedback-report walk.
pub mod arf;
pub mod event;
pub mod providers;

use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::post;
use axum::Router;
use campaign_core::{AppError, CampaignId, SuppressionCategory, TenantId, TrackingEventType};
use chrono::Utc;
use db::{CampaignRepo, SubscriberRepo};
use event::{NormalizedEvent, WebhookEventType};
use metrics_aggregator::{IncomingEvent, MetricsAggregator};
use std::sync::Arc;
use suppression_hub::SuppressionHub;

pub struct WebhookState {
    pub metrics: MetricsAggregator,
    pub subscribers: SubscriberRepo,
    pub campaigns: CampaignRepo,
    pub suppression: Arc<SuppressionHub>,
    pub body_limit_bytes: usize,
}

pub fn router(state: Arc<WebhookState>) -> Router {
    let limit = state.body_limit_bytes;
    Router::new()
        .route("/webhooks/{provider}", post(ingest))
        .layer(DefaultBodyLimit::max(limit))
        .with_state(state)
}

fn content_type(headers: &HeaderMap) -> &str {
    headers
        .get(axum::http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
}

/// `POST /webhooks/{provider}`. Returns 400 for a body
/// that cannot be parsed at all under any shape; a parsed-but-unroutable
/// individual event is logged and skipped rather than failing the whole
/// request, since providers may batch several events per call.
async fn ingest(
    State(state): State<Arc<WebhookState>>,
    Path(provider): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> axum::response::Response {
    match parse(&provider, &headers, &body) {
        Ok(events) => {
            for event in events {
                if let Err(err) = route(&state, event).await {
                    tracing::warn!(error = %err, provider, "failed to apply webhook event");
                }
            }
            StatusCode::OK.into_response()
        }
        Err(err) => {
            tracing::debug!(error = %err, provider, "failed to parse webhook body");
            AppError::Validation(format!("could not parse webhook body: {err:#}")).into_response()
        }
    }
}

fn parse(provider: &str, headers: &HeaderMap, body: &[u8]) -> anyhow::Result<Vec<NormalizedEvent>> {
    let ctype = content_type(headers);

    if ctype.starts_with("multipart/report") {
        return Ok(arf::parse_arf(body)?.into_iter().collect());
    }

    match provider {
        "sparkpost" => providers::parse_sparkpost(body),
        "ses" => providers::parse_ses_sns(body),
        "mailgun" if ctype.starts_with("application/x-www-form-urlencoded") => {
            providers::parse_mailgun_form(body)
        }
        "mailgun" => providers::parse_mailgun_json(body),
        "arf" => Ok(arf::parse_arf(body)?.into_iter().collect()),
        _ => providers::parse_generic_json(body),
    }
}

fn suppression_category(event_type: WebhookEventType) -> Option<SuppressionCategory> {
    match event_type {
        WebhookEventType::HardBounce => Some(SuppressionCategory::HardBounce),
        WebhookEventType::SpamComplaint => Some(SuppressionCategory::SpamComplaint),
        WebhookEventType::Unsubscribe => Some(SuppressionCategory::Unsubscribe),
        WebhookEventType::SoftBounce | WebhookEventType::Throttle | WebhookEventType::Deferred => None,
    }
}

fn tracking_event_type(event_type: WebhookEventType) -> TrackingEventType {
    match event_type {
        WebhookEventType::HardBounce | WebhookEventType::SoftBounce => TrackingEventType::Bounced,
        WebhookEventType::SpamComplaint => TrackingEventType::Complained,
        WebhookEventType::Unsubscribe => TrackingEventType::Unsubscribed,
        WebhookEventType::Throttle | WebhookEventType::Deferred => TrackingEventType::Deferred,
    }
}

/// Routes one normalized event: resolves the subscriber if a campaign is
/// named (so C10 can be applied), applies the soft-bounce promotion
/// check, and always runs the C1 suppression call for terminal events
/// regardless of whether a subscriber could be resolved — suppression is
/// keyed on the email address, not on our own subscriber id.
async fn route(state: &WebhookState, event: NormalizedEvent) -> anyhow::Result<()> {
    let now = Utc::now();

    if let Some(campaign_id) = event.campaign_id {
        if let Some(tenant_id) = tenant_for_campaign(state, campaign_id).await? {
            if let Some(subscriber) = state.subscribers.by_tenant_and_email(tenant_id, &event.recipient).await? {
                state
                    .metrics
                    .apply(IncomingEvent {
                        tenant_id,
                        campaign_id,
                        subscriber_id: subscriber.id,
                        email: subscriber.email,
                        event_type: tracking_event_type(event.event_type),
                        timestamp: now,
                        ip: None,
                        user_agent: None,
                        device_class: None,
                        link_url: None,
                        metadata: serde_json::json!({
                            "reason": event.reason,
                            "bounce_class": event.bounce_class,
                            "error_code": event.error_code,
                        }),
                    })
                    .await?;
            }
        }
    }

    if event.event_type == WebhookEventType::SoftBounce {
        if state.suppression.record_soft_bounce(&event.recipient, now) {
            state
                .suppression
                .suppress(
                    &event.recipient,
                    SuppressionCategory::SoftBouncePromoted,
                    "webhook-ingestor",
                    event.reason.as_deref(),
                    event.campaign_id,
                )
                .await?;
        }
        return Ok(());
    }

    if let Some(category) = suppression_category(event.event_type) {
        state
            .suppression
            .suppress(
                &event.recipient,
                category,
                "webhook-ingestor",
                event.reason.as_deref(),
                event.campaign_id,
            )
            .await?;
    }

    Ok(())
}

async fn tenant_for_campaign(state: &WebhookState, campaign_id: CampaignId) -> anyhow::Result<Option<TenantId>> {
    Ok(state.campaigns.get(campaign_id).await?.map(|c| c.tenant_id))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn terminal_types_map_to_suppression_categories() {
        assert_eq!(
            suppression_category(WebhookEventType::HardBounce),
            Some(SuppressionCategory::HardBounce)
        );
        assert_eq!(
            suppression_category(WebhookEventType::SpamComplaint),
            Some(SuppressionCategory::SpamComplaint)
        );
        assert_eq!(suppression_category(WebhookEventType::SoftBounce), None);
        assert_eq!(suppression_category(WebhookEventType::Throttle), None);
    }

    #[test]
    fn tracking_event_mapping() {
        assert_eq!(tracking_event_type(WebhookEventType::HardBounce), TrackingEventType::Bounced);
        assert_eq!(tracking_event_type(WebhookEventType::SoftBounce), TrackingEventType::Bounced);
        assert_eq!(tracking_event_type(WebhookEventType::Deferred), TrackingEventType::Deferred);
    }
}
