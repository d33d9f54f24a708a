//! The per-recipient queue table (QueueItem, §4.6 leasing).
use campaign_core::{CampaignId, EspProfileId, QueueItem, QueueItemId, QueueItemStatus, SubscriberId};
use chrono::{DateTime, Utc};
use sqlx::PgPool;

pub struct QueueRepo {
    pool: PgPool,
}

#[derive(sqlx::FromRow)]
struct Row {
    id: uuid::Uuid,
    campaign_id: uuid::Uuid,
    subscriber_id: uuid::Uuid,
    rendered_subject: String,
    rendered_html: String,
    rendered_text: Option<String>,
    esp_profile: uuid::Uuid,
    priority: i16,
    scheduled_at: DateTime<Utc>,
    status: String,
    attempt_count: i32,
    last_error: Option<String>,
    lease_expires_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<Row> for QueueItem {
    type Error = anyhow::Error;
    fn try_from(row: Row) -> Result<Self, Self::Error> {
        Ok(QueueItem {
            id: row.id.into(),
            campaign_id: row.campaign_id.into(),
            subscriber_id: row.subscriber_id.into(),
            rendered_subject: row.rendered_subject,
            rendered_html: row.rendered_html,
            rendered_text: row.rendered_text,
            esp_profile: row.esp_profile.into(),
            priority: row.priority,
            scheduled_at: row.scheduled_at,
            status: serde_json::from_value(serde_json::Value::String(row.status))?,
            attempt_count: row.attempt_count as u32,
            last_error: row.last_error,
            lease_expires_at: row.lease_expires_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

const COLUMNS: &str = "id, campaign_id, subscriber_id, rendered_subject, rendered_html, \
    rendered_text, esp_profile, priority, scheduled_at, status, attempt_count, last_error, \
    lease_expires_at, created_at, updated_at";

pub struct NewQueueItem {
    pub campaign_id: CampaignId,
    pub subscriber_id: SubscriberId,
    pub rendered_subject: String,
    pub rendered_html: String,
    pub rendered_text: Option<String>,
    pub esp_profile: EspProfileId,
    pub priority: i16,
    pub scheduled_at: DateTime<Utc>,
}

impl QueueRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Upsert-dedup on `(campaign, subscriber)` (step 4,
    /// §8 invariant). Duplicate enqueue attempts — e.g. a resumed
    /// enqueue worker re-streaming the audience after a crash — are
    /// silently ignored.
    pub async fn insert_ignore_duplicates(&self, item: &NewQueueItem) -> anyhow::Result<bool> {
        let result = sqlx::query(
            "insert into campaign_queue (id, campaign_id, subscriber_id, rendered_subject, \
             rendered_html, rendered_text, esp_profile, priority, scheduled_at, status)
             values ($1,$2,$3,$4,$5,$6,$7,$8,$9,'queued')
             on conflict (campaign_id, subscriber_id) do nothing",
        )
        .bind(QueueItemId::new().as_uuid())
        .bind(item.campaign_id.as_uuid())
        .bind(item.subscriber_id.as_uuid())
        .bind(&item.rendered_subject)
        .bind(&item.rendered_html)
        .bind(&item.rendered_text)
        .bind(item.esp_profile.as_uuid())
        .bind(item.priority)
        .bind(item.scheduled_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn count_for_campaign(&self, campaign_id: CampaignId) -> anyhow::Result<u64> {
        let (count,): (i64,) =
            sqlx::query_as("select count(*) from campaign_queue where campaign_id = $1")
                .bind(campaign_id.as_uuid())
                .fetch_one(&self.pool)
                .await?;
        Ok(count as u64)
    }

    /// Leases up to `limit` ready rows: `status = queued AND scheduled_at
    /// <= now`, ordered `(priority DESC, scheduled_at ASC)`, via
    /// `FOR UPDATE SKIP LOCKED` so concurrent dispatch workers never
    /// double-lease the same row (invariant: at most one
    /// worker holds a leased item).
    pub async fn lease_batch(
        &self,
        holder_id: &str,
        lease_duration: std::time::Duration,
        limit: i64,
    ) -> anyhow::Result<Vec<QueueItem>> {
        let now = Utc::now();
        let lease_expires_at = now + chrono::Duration::from_std(lease_duration)?;

        let mut tx = self.pool.begin().await?;
        let ids: Vec<uuid::Uuid> = sqlx::query_scalar(
            "select id from campaign_queue
             where status = 'queued' and scheduled_at <= $1
             order by priority desc, scheduled_at asc
             limit $2
             for update skip locked",
        )
        .bind(now)
        .bind(limit)
        .fetch_all(&mut *tx)
        .await?;

        if ids.is_empty() {
            tx.commit().await?;
            return Ok(vec![]);
        }

        sqlx::query(
            "update campaign_queue set status = 'leased', lease_holder = $2, \
             lease_expires_at = $3, updated_at = now() where id = any($1)",
        )
        .bind(&ids)
        .bind(holder_id)
        .bind(lease_expires_at)
        .execute(&mut *tx)
        .await?;

        let rows: Vec<Row> = sqlx::query_as(&format!(
            "select {COLUMNS} from campaign_queue where id = any($1)"
        ))
        .bind(&ids)
        .fetch_all(&mut *tx)
        .await?;

        tx.commit().await?;
        rows.into_iter().map(QueueItem::try_from).collect()
    }

    pub async fn mark_sent(&self, id: QueueItemId) -> anyhow::Result<()> {
        sqlx::query(
            "update campaign_queue set status = 'sent', lease_holder = null, \
             lease_expires_at = null, updated_at = now() where id = $1",
        )
        .bind(id.as_uuid())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn mark_skipped(&self, id: QueueItemId, reason: &str) -> anyhow::Result<()> {
        sqlx::query(
            "update campaign_queue set status = 'skipped', last_error = $2, lease_holder = \
             null, lease_expires_at = null, updated_at = now() where id = $1",
        )
        .bind(id.as_uuid())
        .bind(reason)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn mark_failed(&self, id: QueueItemId, error: &str) -> anyhow::Result<()> {
        sqlx::query(
            "update campaign_queue set status = 'failed', last_error = $2, lease_holder = \
             null, lease_expires_at = null, updated_at = now() where id = $1",
        )
        .bind(id.as_uuid())
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Requeues a retryable failure with backoff (step 6).
    pub async fn retry_with_backoff(
        &self,
        id: QueueItemId,
        attempt_count: u32,
        error: &str,
        retry_at: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        sqlx::query(
            "update campaign_queue set status = 'queued', attempt_count = $2, last_error = $3, \
             scheduled_at = $4, lease_holder = null, lease_expires_at = null, updated_at = now() \
             where id = $1",
        )
        .bind(id.as_uuid())
        .bind(attempt_count as i32)
        .bind(error)
        .bind(retry_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn mirror_campaign_status(
        &self,
        id: QueueItemId,
        status: QueueItemStatus,
    ) -> anyhow::Result<()> {
        sqlx::query(
            "update campaign_queue set status = $2, lease_holder = null, lease_expires_at = \
             null, updated_at = now() where id = $1",
        )
        .bind(id.as_uuid())
        .bind(status.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Reclaims rows whose lease has expired, returning them to `queued`
    /// with `attempt_count` bumped (reaper, §5 bounded lag).
    pub async fn reap_expired_leases(&self, now: DateTime<Utc>) -> anyhow::Result<u64> {
        let result = sqlx::query(
            "update campaign_queue set status = 'queued', attempt_count = attempt_count + 1, \
             lease_holder = null, lease_expires_at = null, updated_at = now()
             where status = 'leased' and lease_expires_at <= $1",
        )
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Flips every non-terminal item for a campaign to `cancelled` in one
    /// transaction (cancel, §5 "flips ... atomically").
    pub async fn cancel_all_for_campaign(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        campaign_id: CampaignId,
    ) -> anyhow::Result<u64> {
        let result = sqlx::query(
            "update campaign_queue set status = 'cancelled', lease_holder = null, \
             lease_expires_at = null, updated_at = now()
             where campaign_id = $1 and status not in ('sent','failed','skipped','cancelled')",
        )
        .bind(campaign_id.as_uuid())
        .execute(&mut **tx)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn pause_all_for_campaign(&self, campaign_id: CampaignId) -> anyhow::Result<u64> {
        let result = sqlx::query(
            "update campaign_queue set status = 'paused', lease_holder = null, \
             lease_expires_at = null, updated_at = now()
             where campaign_id = $1 and status = 'queued'",
        )
        .bind(campaign_id.as_uuid())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn resume_all_for_campaign(&self, campaign_id: CampaignId) -> anyhow::Result<u64> {
        let result = sqlx::query(
            "update campaign_queue set status = 'queued', updated_at = now()
             where campaign_id = $1 and status = 'paused'",
        )
        .bind(campaign_id.as_uuid())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// `true` once every row for a campaign has reached a terminal state
    /// (`sending --(all-items-terminal)--> completed*`).
    pub async fn all_terminal(&self, campaign_id: CampaignId) -> anyhow::Result<bool> {
        let (remaining,): (i64,) = sqlx::query_as(
            "select count(*) from campaign_queue
             where campaign_id = $1 and status not in ('sent','failed','skipped','cancelled')",
        )
        .bind(campaign_id.as_uuid())
        .fetch_one(&self.pool)
        .await?;
        Ok(remaining == 0)
    }

    pub async fn error_count(&self, campaign_id: CampaignId) -> anyhow::Result<u64> {
        let (count,): (i64,) = sqlx::query_as(
            "select count(*) from campaign_queue where campaign_id = $1 and status = 'failed'",
        )
        .bind(campaign_id.as_uuid())
        .fetch_one(&self.pool)
        .await?;
        Ok(count as u64)
    }
}
