//! Tracking Endpoint (C8): the open pixel, click redirect,
//! and unsubscribe routes. Grounded on the teacher's
//! `kumo-server-common::http_server` axum `Router`/`AppState` assembly
//! (trimmed of the TLS/OpenAPI machinery this single-purpose surface
//! doesn't need) and on `template::payload` for HMAC verification. Event
//! application (counters, subscriber row, ISP health) is delegated to
//! `metrics-aggregator` rather than duplicated here.
use axum::extract::{ConnectInfo, Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{Html, IntoResponse, Redirect, Response};
use axum::routing::get;
use axum::Router;
use campaign_core::{DeviceClass, SuppressionCategory, TrackingEventType};
use chrono::Utc;
use config::TrackingSettings;
use db::SubscriberRepo;
use metrics_aggregator::{IncomingEvent, MetricsAggregator};
use std::net::SocketAddr;
use std::sync::Arc;
use suppression_hub::SuppressionHub;
use template::{decode_and_verify, peek_tenant_id, PayloadError, TrackingFields};

/// The 1x1 transparent GIF the open pixel always serves (/// "always returns the pixel regardless of DB outcome").
const TRANSPARENT_GIF: &[u8] = &[
    0x47, 0x49, 0x46, 0x38, 0x39, 0x61, 0x01, 0x00, 0x01, 0x00, 0x80, 0x00, 0x00, 0x00, 0x00, 0x00,
    0xff, 0xff, 0xff, 0x21, 0xf9, 0x04, 0x01, 0x00, 0x00, 0x00, 0x00, 0x2c, 0x00, 0x00, 0x00, 0x00,
    0x01, 0x00, 0x01, 0x00, 0x00, 0x02, 0x02, 0x44, 0x01, 0x00, 0x3b,
];

pub struct TrackingState {
    pub metrics: MetricsAggregator,
    pub subscribers: SubscriberRepo,
    pub suppression: Arc<SuppressionHub>,
    pub settings: TrackingSettings,
}

impl TrackingState {
    fn hmac_key_for(&self, tenant_id: &str) -> &str {
        self.settings
            .tenant_hmac_keys
            .get(tenant_id)
            .map(String::as_str)
            .unwrap_or(&self.settings.default_hmac_key)
    }

    /// Resolves the per-tenant key before fully verifying: the tenant id
    /// is a signed-not-sealed field, so it can be read
    /// without trusting it, then the right key is used to check the MAC.
    fn verify(&self, payload: &str) -> Result<TrackingFields, PayloadError> {
        let tenant_id = peek_tenant_id(payload)?;
        let key = self.hmac_key_for(&tenant_id.to_string());
        decode_and_verify(payload, key)
    }
}

pub fn router(state: Arc<TrackingState>) -> Router {
    Router::new()
        .route("/o/{payload}", get(open_pixel))
        .route("/c/{payload}", get(click_redirect))
        .route("/u/{payload}", get(unsubscribe).post(unsubscribe))
        .with_state(state)
}

fn no_store_gif_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, "image/gif".parse().unwrap());
    headers.insert(header::CACHE_CONTROL, "no-store, must-revalidate".parse().unwrap());
    headers.insert(header::PRAGMA, "no-cache".parse().unwrap());
    headers
}

fn device_class(headers: &HeaderMap) -> Option<DeviceClass> {
    headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(DeviceClass::from_user_agent)
}

fn user_agent(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// `GET /o/{payload}` (open pixel). On a bad signature the
/// pixel is still served — a broken tracking link must never visibly
/// break an email client's image rendering.
async fn open_pixel(
    State(state): State<Arc<TrackingState>>,
    Path(payload): Path<String>,
    headers: HeaderMap,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> Response {
    match state.verify(&payload) {
        Ok(fields) => {
            if let Err(err) = record_open(&state, &fields, &headers, addr).await {
                tracing::warn!(error = %err, "failed to record open event");
            }
        }
        Err(err) => {
            tracing::debug!(error = %err, "open pixel payload failed verification");
        }
    }
    (StatusCode::OK, no_store_gif_headers(), TRANSPARENT_GIF).into_response()
}

async fn record_open(
    state: &TrackingState,
    fields: &TrackingFields,
    headers: &HeaderMap,
    addr: SocketAddr,
) -> anyhow::Result<()> {
    let Some(subscriber) = state.subscribers.get(fields.subscriber_id).await? else {
        return Ok(());
    };
    state
        .metrics
        .apply(IncomingEvent {
            tenant_id: fields.tenant_id,
            campaign_id: fields.campaign_id,
            subscriber_id: fields.subscriber_id,
            email: subscriber.email,
            event_type: TrackingEventType::Opened,
            timestamp: Utc::now(),
            ip: Some(addr.ip().to_string()),
            user_agent: user_agent(headers),
            device_class: device_class(headers),
            link_url: None,
            metadata: serde_json::json!({}),
        })
        .await?;
    Ok(())
}

/// `GET /c/{payload}` (click redirect). The persistence
/// write is fired without being awaited before the redirect is built, so
/// a slow or failing write never delays the client (spec.md: "the write
/// is non-blocking for the client").
async fn click_redirect(
    State(state): State<Arc<TrackingState>>,
    Path(payload): Path<String>,
    headers: HeaderMap,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> Response {
    let fields = match state.verify(&payload) {
        Ok(fields) => fields,
        Err(err) => {
            tracing::debug!(error = %err, "click payload failed verification");
            return (StatusCode::BAD_REQUEST, "invalid or expired link").into_response();
        }
    };
    let Some(original_url) = fields.original_url.clone() else {
        return (StatusCode::BAD_REQUEST, "missing redirect target").into_response();
    };

    server_runtime::spawn("tracking-click-write", async move {
        if let Err(err) = record_click(&state, &fields, &headers, addr).await {
            tracing::warn!(error = %err, "failed to record click event");
        }
    })
    .ok();

    Redirect::temporary(&original_url).into_response()
}

async fn record_click(
    state: &TrackingState,
    fields: &TrackingFields,
    headers: &HeaderMap,
    addr: SocketAddr,
) -> anyhow::Result<()> {
    let Some(subscriber) = state.subscribers.get(fields.subscriber_id).await? else {
        return Ok(());
    };
    state
        .metrics
        .apply(IncomingEvent {
            tenant_id: fields.tenant_id,
            campaign_id: fields.campaign_id,
            subscriber_id: fields.subscriber_id,
            email: subscriber.email,
            event_type: TrackingEventType::Clicked,
            timestamp: Utc::now(),
            ip: Some(addr.ip().to_string()),
            user_agent: user_agent(headers),
            device_class: device_class(headers),
            link_url: fields.original_url.clone(),
            metadata: serde_json::json!({}),
        })
        .await?;
    Ok(())
}

/// `GET|POST /u/{payload}` (unsubscribe, including
/// one-click POST). Unlike the pixel this fails closed: a bad signature
/// renders nothing and is rejected.
async fn unsubscribe(State(state): State<Arc<TrackingState>>, Path(payload): Path<String>) -> Response {
    let fields = match state.verify(&payload) {
        Ok(fields) => fields,
        Err(err) => {
            tracing::debug!(error = %err, "unsubscribe payload failed verification");
            return (StatusCode::BAD_REQUEST, "invalid or expired link").into_response();
        }
    };

    match do_unsubscribe(&state, &fields).await {
        Ok(()) => Html(CONFIRMATION_PAGE).into_response(),
        Err(err) => {
            tracing::error!(error = %err, "failed to process unsubscribe");
            (StatusCode::INTERNAL_SERVER_ERROR, "failed to process request").into_response()
        }
    }
}

const CONFIRMATION_PAGE: &str = "<html><body><p>You have been unsubscribed and will not \
    receive further emails from this sender.</p></body></html>";

async fn do_unsubscribe(state: &TrackingState, fields: &TrackingFields) -> anyhow::Result<()> {
    let Some(subscriber) = state.subscribers.get(fields.subscriber_id).await? else {
        return Ok(());
    };
    let now = Utc::now();
    state
        .metrics
        .apply(IncomingEvent {
            tenant_id: fields.tenant_id,
            campaign_id: fields.campaign_id,
            subscriber_id: fields.subscriber_id,
            email: subscriber.email.clone(),
            event_type: TrackingEventType::Unsubscribed,
            timestamp: now,
            ip: None,
            user_agent: None,
            device_class: None,
            link_url: None,
            metadata: serde_json::json!({}),
        })
        .await?;

    // Subscriber status transition happens inside metrics-aggregator;
    // suppression is this endpoint's own concern, not a tracking event.
    state
        .suppression
        .suppress(
            &subscriber.email,
            SuppressionCategory::Unsubscribe,
            "tracking-endpoint",
            None,
            Some(fields.campaign_id),
        )
        .await?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn gif_is_well_formed() {
        assert_eq!(&TRANSPARENT_GIF[0..6], b"GIF89a");
    }

    #[test]
    fn device_class_falls_back_to_desktop_with_no_header() {
        let headers = HeaderMap::new();
        assert_eq!(device_class(&headers), None);
    }
}
