//! Counters/gauges/histograms shared by every role ("Metrics"),
//! and the `GET /metrics` text-exposition handler. Grounded directly on
//! the teacher's `kumod::metrics_helper` (pruning label-keyed vecs so a
//! campaign's metrics disappear once nothing references it any more) and
//! `kumod::http_server::report_metrics` for the handler itself.
use axum::response::IntoResponse;
use kumo_prometheus::PruningIntCounterVec;
use once_cell::sync::Lazy;
use prometheus::{HistogramVec, IntGaugeVec};

pub static CAMPAIGN_ENQUEUED: Lazy<PruningIntCounterVec> = Lazy::new(|| {
    PruningIntCounterVec::register(
        "campaign_enqueued_total",
        "total recipients enqueued for a campaign",
        &["campaign_id"],
    )
});

pub static CAMPAIGN_SENT: Lazy<PruningIntCounterVec> = Lazy::new(|| {
    PruningIntCounterVec::register(
        "campaign_sent_total",
        "total sends accepted by an esp for a campaign",
        &["campaign_id"],
    )
});

pub static CAMPAIGN_BOUNCED: Lazy<PruningIntCounterVec> = Lazy::new(|| {
    PruningIntCounterVec::register(
        "campaign_bounced_total",
        "total bounces recorded for a campaign",
        &["campaign_id", "class"],
    )
});

pub static CAMPAIGN_COMPLAINED: Lazy<PruningIntCounterVec> = Lazy::new(|| {
    PruningIntCounterVec::register(
        "campaign_complained_total",
        "total spam complaints recorded for a campaign",
        &["campaign_id"],
    )
});

pub static CAMPAIGN_QUEUE_DEPTH: Lazy<IntGaugeVec> = Lazy::new(|| {
    prometheus::register_int_gauge_vec!(
        "campaign_queue_depth",
        "ready queue items remaining for a campaign",
        &["campaign_id"]
    )
    .expect("register campaign_queue_depth")
});

pub static ESP_SEND_LATENCY: Lazy<HistogramVec> = Lazy::new(|| {
    prometheus::register_histogram_vec!(
        "esp_send_duration_seconds",
        "time spent waiting on an esp adapter's send call",
        &["provider"]
    )
    .expect("register esp_send_duration_seconds")
});

pub static LEASE_TO_SEND_LATENCY: Lazy<HistogramVec> = Lazy::new(|| {
    prometheus::register_histogram_vec!(
        "lease_to_send_duration_seconds",
        "time between a queue item's lease and its terminal send outcome",
        &["campaign_id"]
    )
    .expect("register lease_to_send_duration_seconds")
});

/// `GET /metrics`: plain prometheus text exposition of every counter,
/// gauge and histogram registered above, in whichever process mounts it.
pub async fn metrics_handler() -> impl IntoResponse {
    match prometheus::TextEncoder::new().encode_to_string(&prometheus::default_registry().gather()) {
        Ok(report) => (axum::http::StatusCode::OK, report),
        Err(err) => (axum::http::StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}

pub fn router() -> axum::Router {
    axum::Router::new().route("/metrics", axum::routing::get(metrics_handler))
}
