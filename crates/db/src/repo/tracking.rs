//! Durable event log behind C8/C9/C10 (TrackingEvent). Inserts
//! are idempotent for `opened`/`unsubscribed` via the partial unique
//! indexes created in migration 0005; everything else appends freely.
use campaign_core::{
    CampaignId, DeviceClass, SubscriberId, TenantId, TrackingEvent, TrackingEventId,
    TrackingEventType,
};
use chrono::{DateTime, Utc};
use sqlx::PgPool;

pub struct TrackingRepo {
    pool: PgPool,
}

#[derive(sqlx::FromRow)]
struct Row {
    id: uuid::Uuid,
    tenant_id: uuid::Uuid,
    campaign_id: uuid::Uuid,
    subscriber_id: uuid::Uuid,
    email: String,
    event_type: String,
    timestamp: DateTime<Utc>,
    ip: Option<String>,
    user_agent: Option<String>,
    device_class: Option<String>,
    link_url: Option<String>,
    metadata: serde_json::Value,
}

impl TryFrom<Row> for TrackingEvent {
    type Error = anyhow::Error;
    fn try_from(row: Row) -> Result<Self, Self::Error> {
        Ok(TrackingEvent {
            id: row.id.into(),
            tenant_id: row.tenant_id.into(),
            campaign_id: row.campaign_id.into(),
            subscriber_id: row.subscriber_id.into(),
            email: row.email,
            event_type: serde_json::from_value(serde_json::Value::String(row.event_type))?,
            timestamp: row.timestamp,
            ip: row.ip,
            user_agent: row.user_agent,
            device_class: row
                .device_class
                .map(|d| serde_json::from_value(serde_json::Value::String(d)))
                .transpose()?,
            link_url: row.link_url,
            metadata: row.metadata,
        })
    }
}

impl TrackingRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Inserts the event, returning `false` without error when a
    /// dedup-unique event type (`opened`/`unsubscribed`) already has a row
    /// for this `(campaign, subscriber)` pair (scenario 5).
    #[allow(clippy::too_many_arguments)]
    pub async fn record(
        &self,
        tenant_id: TenantId,
        campaign_id: CampaignId,
        subscriber_id: SubscriberId,
        email: &str,
        event_type: TrackingEventType,
        timestamp: DateTime<Utc>,
        ip: Option<&str>,
        user_agent: Option<&str>,
        device_class: Option<DeviceClass>,
        link_url: Option<&str>,
        metadata: serde_json::Value,
    ) -> anyhow::Result<bool> {
        let result = sqlx::query(
            "insert into tracking_events (id, tenant_id, campaign_id, subscriber_id, email, \
             event_type, \"timestamp\", ip, user_agent, device_class, link_url, metadata)
             values ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12)
             on conflict do nothing",
        )
        .bind(TrackingEventId::new().as_uuid())
        .bind(tenant_id.as_uuid())
        .bind(campaign_id.as_uuid())
        .bind(subscriber_id.as_uuid())
        .bind(email)
        .bind(event_type.to_string())
        .bind(timestamp)
        .bind(ip)
        .bind(user_agent)
        .bind(device_class.map(|d| d.to_string()))
        .bind(link_url)
        .bind(metadata)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn for_campaign(
        &self,
        campaign_id: CampaignId,
        event_type: Option<TrackingEventType>,
    ) -> anyhow::Result<Vec<TrackingEvent>> {
        let rows: Vec<Row> = match event_type {
            Some(t) => {
                sqlx::query_as(
                    "select id, tenant_id, campaign_id, subscriber_id, email, event_type, \
                     \"timestamp\", ip, user_agent, device_class, link_url, metadata
                     from tracking_events where campaign_id = $1 and event_type = $2
                     order by \"timestamp\" asc",
                )
                .bind(campaign_id.as_uuid())
                .bind(t.to_string())
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as(
                    "select id, tenant_id, campaign_id, subscriber_id, email, event_type, \
                     \"timestamp\", ip, user_agent, device_class, link_url, metadata
                     from tracking_events where campaign_id = $1
                     order by \"timestamp\" asc",
                )
                .bind(campaign_id.as_uuid())
                .fetch_all(&self.pool)
                .await?
            }
        };
        rows.into_iter().map(TrackingEvent::try_from).collect()
    }

    pub async fn count_by_type(
        &self,
        campaign_id: CampaignId,
        event_type: TrackingEventType,
    ) -> anyhow::Result<u64> {
        let (count,): (i64,) = sqlx::query_as(
            "select count(*) from tracking_events where campaign_id = $1 and event_type = $2",
        )
        .bind(campaign_id.as_uuid())
        .bind(event_type.to_string())
        .fetch_one(&self.pool)
        .await?;
        Ok(count as u64)
    }
}
