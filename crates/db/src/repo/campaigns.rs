//! Campaign persistence. Status transitions are validated by
//! `campaign-state`; this repo exposes the plain CRUD + atomic
//! counter/status update primitives that crate builds on, keeping the
//! "durable status updated in the same transaction that enqueues
//! side-effect rows" invariant of at the call site rather
//! than here.
use campaign_core::{Campaign, CampaignCounters, CampaignId, CampaignStatus, SendType, TenantId};
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};

pub struct CampaignRepo {
    pool: PgPool,
}

#[derive(sqlx::FromRow)]
struct CampaignRow {
    id: uuid::Uuid,
    tenant_id: uuid::Uuid,
    name: String,
    subject_template: String,
    html_template: String,
    text_template: Option<String>,
    preview_text: Option<String>,
    from_name: String,
    from_address: String,
    reply_address: Option<String>,
    audience: serde_json::Value,
    esp_selector: serde_json::Value,
    throttle: serde_json::Value,
    max_recipients: Option<i64>,
    send_type: String,
    scheduled_at: Option<DateTime<Utc>>,
    status: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    total_recipients: i64,
    queued_count: i64,
    sent_count: i64,
    delivered_count: i64,
    open_count: i64,
    click_count: i64,
    bounce_count: i64,
    complaint_count: i64,
    unsubscribe_count: i64,
    revenue: f64,
}

impl TryFrom<CampaignRow> for Campaign {
    type Error = anyhow::Error;

    fn try_from(row: CampaignRow) -> Result<Self, Self::Error> {
        Ok(Campaign {
            id: row.id.into(),
            tenant_id: row.tenant_id.into(),
            name: row.name,
            subject_template: row.subject_template,
            html_template: row.html_template,
            text_template: row.text_template,
            preview_text: row.preview_text,
            from_name: row.from_name,
            from_address: row.from_address,
            reply_address: row.reply_address,
            audience: serde_json::from_value(row.audience)?,
            esp_selector: serde_json::from_value(row.esp_selector)?,
            throttle: serde_json::from_value(row.throttle)?,
            max_recipients: row.max_recipients.map(|n| n as u64),
            send_type: serde_json::from_value(serde_json::Value::String(row.send_type))?,
            scheduled_at: row.scheduled_at,
            status: serde_json::from_value(serde_json::Value::String(row.status))?,
            created_at: row.created_at,
            updated_at: row.updated_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
            counters: CampaignCounters {
                total_recipients: row.total_recipients as u64,
                queued: row.queued_count as u64,
                sent: row.sent_count as u64,
                delivered: row.delivered_count as u64,
                open: row.open_count as u64,
                click: row.click_count as u64,
                bounce: row.bounce_count as u64,
                complaint: row.complaint_count as u64,
                unsubscribe: row.unsubscribe_count as u64,
                revenue: row.revenue,
            },
        })
    }
}

const SELECT_COLUMNS: &str = "id, tenant_id, name, subject_template, html_template, \
    text_template, preview_text, from_name, from_address, reply_address, audience, \
    esp_selector, throttle, max_recipients, send_type, scheduled_at, status, created_at, \
    updated_at, started_at, completed_at, total_recipients, queued_count, sent_count, \
    delivered_count, open_count, click_count, bounce_count, complaint_count, \
    unsubscribe_count, revenue";

impl CampaignRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, campaign: &Campaign) -> anyhow::Result<()> {
        sqlx::query(
            "insert into campaigns (id, tenant_id, name, subject_template, html_template, \
             text_template, preview_text, from_name, from_address, reply_address, audience, \
             esp_selector, throttle, max_recipients, send_type, scheduled_at, status, \
             created_at, updated_at)
             values ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,$16,$17,$18,$19)",
        )
        .bind(campaign.id.as_uuid())
        .bind(campaign.tenant_id.as_uuid())
        .bind(&campaign.name)
        .bind(&campaign.subject_template)
        .bind(&campaign.html_template)
        .bind(&campaign.text_template)
        .bind(&campaign.preview_text)
        .bind(&campaign.from_name)
        .bind(&campaign.from_address)
        .bind(&campaign.reply_address)
        .bind(serde_json::to_value(&campaign.audience)?)
        .bind(serde_json::to_value(&campaign.esp_selector)?)
        .bind(serde_json::to_value(&campaign.throttle)?)
        .bind(campaign.max_recipients.map(|n| n as i64))
        .bind(campaign.send_type.to_string_snake())
        .bind(campaign.scheduled_at)
        .bind(campaign.status.to_string())
        .bind(campaign.created_at)
        .bind(campaign.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get(&self, id: CampaignId) -> anyhow::Result<Option<Campaign>> {
        let row: Option<CampaignRow> = sqlx::query_as(&format!(
            "select {SELECT_COLUMNS} from campaigns where id = $1"
        ))
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;
        row.map(Campaign::try_from).transpose()
    }

    /// Fetches with `for update` inside the caller's transaction, used by
    /// `campaign-state` to serialize concurrent transition attempts on
    /// top of the distributed lock ("final safety net").
    pub async fn get_for_update(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        id: CampaignId,
    ) -> anyhow::Result<Option<Campaign>> {
        let row: Option<CampaignRow> = sqlx::query_as(&format!(
            "select {SELECT_COLUMNS} from campaigns where id = $1 for update"
        ))
        .bind(id.as_uuid())
        .fetch_optional(&mut **tx)
        .await?;
        row.map(Campaign::try_from).transpose()
    }

    pub async fn set_status(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        id: CampaignId,
        status: CampaignStatus,
    ) -> anyhow::Result<()> {
        sqlx::query("update campaigns set status = $2, updated_at = now() where id = $1")
            .bind(id.as_uuid())
            .bind(status.to_string())
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    pub async fn set_scheduled_at(
        &self,
        id: CampaignId,
        scheduled_at: Option<DateTime<Utc>>,
    ) -> anyhow::Result<()> {
        sqlx::query(
            "update campaigns set scheduled_at = $2, updated_at = now() where id = $1",
        )
        .bind(id.as_uuid())
        .bind(scheduled_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_total_recipients(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        id: CampaignId,
        total: u64,
    ) -> anyhow::Result<()> {
        sqlx::query(
            "update campaigns set total_recipients = $2, updated_at = now() where id = $1",
        )
        .bind(id.as_uuid())
        .bind(total as i64)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    pub async fn set_queued_count(&self, id: CampaignId, queued: u64) -> anyhow::Result<()> {
        sqlx::query("update campaigns set queued_count = $2, updated_at = now() where id = $1")
            .bind(id.as_uuid())
            .bind(queued as i64)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn mark_started(&self, id: CampaignId, at: DateTime<Utc>) -> anyhow::Result<()> {
        sqlx::query("update campaigns set started_at = $2, updated_at = now() where id = $1")
            .bind(id.as_uuid())
            .bind(at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn mark_completed(&self, id: CampaignId, at: DateTime<Utc>) -> anyhow::Result<()> {
        sqlx::query("update campaigns set completed_at = $2, updated_at = now() where id = $1")
            .bind(id.as_uuid())
            .bind(at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Atomically increments the counter named `column` by one. `column`
    /// must come from a fixed allow-list (never user input) — see
    /// `metrics-aggregator::CAMPAIGN_COUNTER_COLUMNS`.
    pub async fn increment_counter(&self, id: CampaignId, column: &str) -> anyhow::Result<()> {
        let sql = format!("update campaigns set {column} = {column} + 1, updated_at = now() where id = $1");
        sqlx::query(&sql).bind(id.as_uuid()).execute(&self.pool).await?;
        Ok(())
    }

    pub async fn list_by_tenant(&self, tenant_id: TenantId) -> anyhow::Result<Vec<Campaign>> {
        let rows: Vec<CampaignRow> = sqlx::query_as(&format!(
            "select {SELECT_COLUMNS} from campaigns where tenant_id = $1 order by created_at desc"
        ))
        .bind(tenant_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Campaign::try_from).collect()
    }

    /// Campaigns currently in `status`, used by the dispatch reaper to
    /// find `sending` campaigns whose completion needs rechecking.
    pub async fn list_by_status(&self, status: CampaignStatus) -> anyhow::Result<Vec<Campaign>> {
        let rows: Vec<CampaignRow> = sqlx::query_as(&format!(
            "select {SELECT_COLUMNS} from campaigns where status = $1"
        ))
        .bind(status.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Campaign::try_from).collect()
    }

    /// Campaigns whose `scheduled_at` has arrived and which are still
    /// `scheduled` (`scheduled --(time arrives)--> preparing`).
    pub async fn due_for_preparation(&self, now: DateTime<Utc>) -> anyhow::Result<Vec<Campaign>> {
        let rows: Vec<CampaignRow> = sqlx::query_as(&format!(
            "select {SELECT_COLUMNS} from campaigns
             where status = 'scheduled' and scheduled_at <= $1
             order by scheduled_at asc"
        ))
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Campaign::try_from).collect()
    }
}

trait SendTypeExt {
    fn to_string_snake(&self) -> String;
}

impl SendTypeExt for SendType {
    fn to_string_snake(&self) -> String {
        match self {
            SendType::Instant => "instant",
            SendType::Scheduled => "scheduled",
            SendType::Smart => "smart",
        }
        .to_string()
    }
}
