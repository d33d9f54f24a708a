use campaign_core::{ListId, Subscriber, SubscriberId, SubscriberStatus, TenantId};
use chrono::{DateTime, Utc};
use sqlx::PgPool;

pub struct SubscriberRepo {
    pool: PgPool,
}

#[derive(sqlx::FromRow)]
struct SubscriberRow {
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
    last_open_at: Option<DateTime<Utc>>,
    last_click_at: Option<DateTime<Utc>>,
    last_sent_at: Option<DateTime<Utc>>,
    timezone: Option<String>,
}

impl TryFrom<SubscriberRow> for Subscriber {
    type Error = anyhow::Error;
    fn try_from(row: SubscriberRow) -> Result<Self, Self::Error> {
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

const COLUMNS: &str = "id, tenant_id, list_id, email, email_hash, status, custom_fields, \
    engagement_score, total_sent, total_opens, total_clicks, last_open_at, last_click_at, \
    last_sent_at, timezone";

impl SubscriberRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn get(&self, id: SubscriberId) -> anyhow::Result<Option<Subscriber>> {
        let row: Option<SubscriberRow> =
            sqlx::query_as(&format!("select {COLUMNS} from subscribers where id = $1"))
                .bind(id.as_uuid())
                .fetch_optional(&self.pool)
                .await?;
        row.map(Subscriber::try_from).transpose()
    }

    /// Confirmed subscribers belonging to one of `list_ids`, used by the
    /// audience resolver's list-union step (step 1).
    pub async fn confirmed_in_lists(&self, list_ids: &[ListId]) -> anyhow::Result<Vec<Subscriber>> {
        if list_ids.is_empty() {
            return Ok(vec![]);
        }
        let ids: Vec<uuid::Uuid> = list_ids.iter().map(|id| id.as_uuid()).collect();
        let rows: Vec<SubscriberRow> = sqlx::query_as(&format!(
            "select {COLUMNS} from subscribers
             where list_id = any($1) and status = 'confirmed'
             order by list_id, email"
        ))
        .bind(&ids)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Subscriber::try_from).collect()
    }

    pub async fn in_lists(&self, list_ids: &[ListId]) -> anyhow::Result<Vec<Subscriber>> {
        if list_ids.is_empty() {
            return Ok(vec![]);
        }
        let ids: Vec<uuid::Uuid> = list_ids.iter().map(|id| id.as_uuid()).collect();
        let rows: Vec<SubscriberRow> =
            sqlx::query_as(&format!("select {COLUMNS} from subscribers where list_id = any($1)"))
                .bind(&ids)
                .fetch_all(&self.pool)
                .await?;
        rows.into_iter().map(Subscriber::try_from).collect()
    }

    pub async fn set_status(&self, id: SubscriberId, status: SubscriberStatus) -> anyhow::Result<()> {
        sqlx::query("update subscribers set status = $2 where id = $1")
            .bind(id.as_uuid())
            .bind(status.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn record_open(&self, id: SubscriberId, at: DateTime<Utc>, score: f64) -> anyhow::Result<()> {
        sqlx::query(
            "update subscribers set total_opens = total_opens + 1, last_open_at = $2, \
             engagement_score = $3 where id = $1",
        )
        .bind(id.as_uuid())
        .bind(at)
        .bind(score)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn record_click(&self, id: SubscriberId, at: DateTime<Utc>, score: f64) -> anyhow::Result<()> {
        sqlx::query(
            "update subscribers set total_clicks = total_clicks + 1, last_click_at = $2, \
             engagement_score = $3 where id = $1",
        )
        .bind(id.as_uuid())
        .bind(at)
        .bind(score)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn record_sent(&self, id: SubscriberId, at: DateTime<Utc>) -> anyhow::Result<()> {
        sqlx::query("update subscribers set total_sent = total_sent + 1, last_sent_at = $2 where id = $1")
            .bind(id.as_uuid())
            .bind(at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn by_tenant_and_email(
        &self,
        tenant_id: TenantId,
        email: &str,
    ) -> anyhow::Result<Option<Subscriber>> {
        let row: Option<SubscriberRow> = sqlx::query_as(&format!(
            "select {COLUMNS} from subscribers where tenant_id = $1 and email = $2"
        ))
        .bind(tenant_id.as_uuid())
        .bind(email)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Subscriber::try_from).transpose()
    }
}
