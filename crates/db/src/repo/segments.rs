//! Segment definitions plus the membership query the audience resolver
//! (C2) runs against live subscriber rows (step 1).
use campaign_core::{Segment, SegmentId, Subscriber};
use sqlx::PgPool;

pub struct SegmentRepo {
    pool: PgPool,
}

#[derive(sqlx::FromRow)]
struct Row {
    id: uuid::Uuid,
    tenant_id: uuid::Uuid,
    list_id: uuid::Uuid,
    name: String,
    criteria: serde_json::Value,
}

impl TryFrom<Row> for Segment {
    type Error = anyhow::Error;
    fn try_from(row: Row) -> Result<Self, Self::Error> {
        Ok(Segment {
            id: row.id.into(),
            tenant_id: row.tenant_id.into(),
            list_id: row.list_id.into(),
            name: row.name,
            criteria: serde_json::from_value(row.criteria)?,
        })
    }
}

impl SegmentRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, segment: &Segment) -> anyhow::Result<()> {
        sqlx::query(
            "insert into segments (id, tenant_id, list_id, name, criteria) values ($1,$2,$3,$4,$5)",
        )
        .bind(segment.id.as_uuid())
        .bind(segment.tenant_id.as_uuid())
        .bind(segment.list_id.as_uuid())
        .bind(&segment.name)
        .bind(serde_json::to_value(&segment.criteria)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get(&self, id: SegmentId) -> anyhow::Result<Option<Segment>> {
        let row: Option<Row> = sqlx::query_as(
            "select id, tenant_id, list_id, name, criteria from segments where id = $1",
        )
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;
        row.map(Segment::try_from).transpose()
    }

    /// Confirmed subscribers in `segment.list_id` whose `custom_fields`
    /// satisfy the segment's criteria. Evaluated in-process
    /// (`SegmentCriteria::matches`) over the list's confirmed rows rather
    /// than compiled to a JSONB predicate, since the condition set is
    /// small and criteria are author-defined, not performance-critical
    /// query paths.
    pub async fn confirmed_members(&self, segment: &Segment) -> anyhow::Result<Vec<Subscriber>> {
        let candidates: Vec<SubscriberRowForSegment> = sqlx::query_as(
            "select id, tenant_id, list_id, email, email_hash, status, custom_fields, \
             engagement_score, total_sent, total_opens, total_clicks, last_open_at, \
             last_click_at, last_sent_at, timezone
             from subscribers where list_id = $1 and status = 'confirmed'",
        )
        .bind(segment.list_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;

        candidates
            .into_iter()
            .filter(|row| segment.criteria.matches(&row.custom_fields))
            .map(Subscriber::try_from)
            .collect()
    }

    /// Every subscriber in the segment's list matching its criteria,
    /// regardless of status (step 2 "subscribers matching
    /// suppression segments" — exclusion segments must also catch
    /// already-unsubscribed/bounced rows, not just confirmed ones).
    pub async fn all_members(&self, segment: &Segment) -> anyhow::Result<Vec<Subscriber>> {
        let candidates: Vec<SubscriberRowForSegment> = sqlx::query_as(
            "select id, tenant_id, list_id, email, email_hash, status, custom_fields, \
             engagement_score, total_sent, total_opens, total_clicks, last_open_at, \
             last_click_at, last_sent_at, timezone
             from subscribers where list_id = $1",
        )
        .bind(segment.list_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;

        candidates
            .into_iter()
            .filter(|row| segment.criteria.matches(&row.custom_fields))
            .map(Subscriber::try_from)
            .collect()
    }

    pub async fn get_many(&self, ids: &[SegmentId]) -> anyhow::Result<Vec<Segment>> {
        if ids.is_empty() {
            return Ok(vec![]);
        }
        let uuids: Vec<uuid::Uuid> = ids.iter().map(|id| id.as_uuid()).collect();
        let rows: Vec<Row> = sqlx::query_as(
            "select id, tenant_id, list_id, name, criteria from segments where id = any($1)",
        )
        .bind(&uuids)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Segment::try_from).collect()
    }
}

// Mirrors `subscribers::SubscriberRow` (private to that module); kept as
// a local copy here rather than made pub to avoid widening that module's
// API just for this query shape.
#[derive(sqlx::FromRow)]
struct SubscriberRowForSegment {
    id: uuid::Uuid,
    tenant_id: uuid::Uuid,
    list_id: uuid::Uuid,
    email: String,
    email_hash: String,
    status: String,
    custom_fields: serde_json::Value,
    engagement_score: f64,
    total_sent: i64,
    total_opens: i64,
    total_clicks: i64,
    last_open_at: Option<chrono::DateTime<chrono::Utc>>,
    last_click_at: Option<chrono::DateTime<chrono::Utc>>,
    last_sent_at: Option<chrono::DateTime<chrono::Utc>>,
    timezone: Option<String>,
}

impl TryFrom<SubscriberRowForSegment> for Subscriber {
    type Error = anyhow::Error;
    fn try_from(row: SubscriberRowForSegment) -> Result<Self, Self::Error> {
        Ok(Subscriber {
            id: row.id.into(),
            tenant_id: row.tenant_id.into(),
            list_id: row.list_id.into(),
            email: row.email,
            email_hash: row.email_hash,
            status: serde_json::from_value(serde_json::Value::String(row.status))?,
            custom_fields: row.custom_fields,
            engagement_score: row.engagement_score,
            total_sent: row.total_sent as u64,
            total_opens: row.total_opens as u64,
            total_clicks: row.total_clicks as u64,
            last_open_at: row.last_open_at,
            last_click_at: row.last_click_at,
            last_sent_at: row.last_sent_at,
            timezone: row.timezone,
        })
    }
}
