//! Per-`(tenant, isp_bucket)` health counters (ISPHealth, §4.7
//! "upsert-increment" update pattern used by the metrics aggregator).
use campaign_core::{IspHealth, TenantId};
use chrono::{DateTime, Utc};
use sqlx::PgPool;

pub struct IspHealthRepo {
    pool: PgPool,
}

#[derive(sqlx::FromRow)]
struct Row {
    tenant_id: uuid::Uuid,
    isp_bucket: String,
    total_sent: i64,
    delivered: i64,
    bounced: i64,
    complained: i64,
    opened: i64,
    clicked: i64,
    last_active_at: Option<DateTime<Utc>>,
    inbox_rate: Option<f64>,
}

impl From<Row> for IspHealth {
    fn from(row: Row) -> Self {
        IspHealth {
            tenant_id: Some(row.tenant_id.into()),
            isp_bucket: row.isp_bucket,
            total_sent: row.total_sent as u64,
            delivered: row.delivered as u64,
            bounced: row.bounced as u64,
            complained: row.complained as u64,
            opened: row.opened as u64,
            clicked: row.clicked as u64,
            last_active_at: row.last_active_at,
            inbox_rate: row.inbox_rate,
        }
    }
}

/// Counters an event bump may touch; passed as a sparse set of `(column,
/// delta)` pairs so a single event (e.g. `sent`) only increments its own
/// column rather than requiring one query per counter.
#[derive(Default, Clone, Copy)]
pub struct IspCounterDelta {
    pub total_sent: i64,
    pub delivered: i64,
    pub bounced: i64,
    pub complained: i64,
    pub opened: i64,
    pub clicked: i64,
}

impl IspHealthRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn get(&self, tenant_id: TenantId, isp_bucket: &str) -> anyhow::Result<Option<IspHealth>> {
        let row: Option<Row> = sqlx::query_as(
            "select tenant_id, isp_bucket, total_sent, delivered, bounced, complained, opened, \
             clicked, last_active_at, inbox_rate from isp_health
             where tenant_id = $1 and isp_bucket = $2",
        )
        .bind(tenant_id.as_uuid())
        .bind(isp_bucket)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(IspHealth::from))
    }

    pub async fn bump(
        &self,
        tenant_id: TenantId,
        isp_bucket: &str,
        delta: IspCounterDelta,
        activity_at: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        sqlx::query(
            "insert into isp_health (tenant_id, isp_bucket, total_sent, delivered, bounced, \
             complained, opened, clicked, last_active_at)
             values ($1,$2,$3,$4,$5,$6,$7,$8,$9)
             on conflict (tenant_id, isp_bucket) do update set
                total_sent = isp_health.total_sent + excluded.total_sent,
                delivered = isp_health.delivered + excluded.delivered,
                bounced = isp_health.bounced + excluded.bounced,
                complained = isp_health.complained + excluded.complained,
                opened = isp_health.opened + excluded.opened,
                clicked = isp_health.clicked + excluded.clicked,
                last_active_at = excluded.last_active_at",
        )
        .bind(tenant_id.as_uuid())
        .bind(isp_bucket)
        .bind(delta.total_sent)
        .bind(delta.delivered)
        .bind(delta.bounced)
        .bind(delta.complained)
        .bind(delta.opened)
        .bind(delta.clicked)
        .bind(activity_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_inbox_rate(
        &self,
        tenant_id: TenantId,
        isp_bucket: &str,
        inbox_rate: f64,
    ) -> anyhow::Result<()> {
        sqlx::query(
            "update isp_health set inbox_rate = $3 where tenant_id = $1 and isp_bucket = $2",
        )
        .bind(tenant_id.as_uuid())
        .bind(isp_bucket)
        .bind(inbox_rate)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_for_tenant(&self, tenant_id: TenantId) -> anyhow::Result<Vec<IspHealth>> {
        let rows: Vec<Row> = sqlx::query_as(
            "select tenant_id, isp_bucket, total_sent, delivered, bounced, complained, opened, \
             clicked, last_active_at, inbox_rate from isp_health where tenant_id = $1",
        )
        .bind(tenant_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(IspHealth::from).collect())
    }
}
