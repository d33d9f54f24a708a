//! Send-time view of configured ESP profiles (EspProfileId,
//! §4.6 daily/hourly cap enforcement). Profile *definitions* come from an
//! external administration surface; this repo only serves the columns
//! the dispatch worker pool needs when picking and capping a profile.
use campaign_core::EspProfileId;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

pub struct SendingProfileRepo {
    pool: PgPool,
}

#[derive(Debug, Clone)]
pub struct SendingProfile {
    pub id: EspProfileId,
    pub name: String,
    pub provider: String,
    pub daily_cap: Option<i64>,
    pub hourly_cap: Option<i64>,
    pub sent_today: i64,
    pub sent_this_hour: i64,
    pub counters_reset_at: DateTime<Utc>,
    pub healthy: bool,
}

#[derive(sqlx::FromRow)]
struct Row {
    id: uuid::Uuid,
    name: String,
    provider: String,
    daily_cap: Option<i64>,
    hourly_cap: Option<i64>,
    sent_today: i64,
    sent_this_hour: i64,
    counters_reset_at: DateTime<Utc>,
    healthy: bool,
}

impl From<Row> for SendingProfile {
    fn from(row: Row) -> Self {
        SendingProfile {
            id: row.id.into(),
            name: row.name,
            provider: row.provider,
            daily_cap: row.daily_cap,
            hourly_cap: row.hourly_cap,
            sent_today: row.sent_today,
            sent_this_hour: row.sent_this_hour,
            counters_reset_at: row.counters_reset_at,
            healthy: row.healthy,
        }
    }
}

const COLUMNS: &str = "id, name, provider, daily_cap, hourly_cap, sent_today, sent_this_hour, \
    counters_reset_at, healthy";

impl SendingProfile {
    /// `true` once either cap, if set, would be exceeded by one more send
    /// ("respects per-profile daily/hourly sending caps").
    pub fn is_at_capacity(&self) -> bool {
        self.daily_cap.is_some_and(|cap| self.sent_today >= cap)
            || self.hourly_cap.is_some_and(|cap| self.sent_this_hour >= cap)
    }
}

impl SendingProfileRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn get(&self, id: EspProfileId) -> anyhow::Result<Option<SendingProfile>> {
        let row: Option<Row> =
            sqlx::query_as(&format!("select {COLUMNS} from sending_profiles where id = $1"))
                .bind(id.as_uuid())
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(SendingProfile::from))
    }

    pub async fn get_many(&self, ids: &[EspProfileId]) -> anyhow::Result<Vec<SendingProfile>> {
        let uuids: Vec<uuid::Uuid> = ids.iter().map(|id| id.as_uuid()).collect();
        let rows: Vec<Row> =
            sqlx::query_as(&format!("select {COLUMNS} from sending_profiles where id = any($1)"))
                .bind(&uuids)
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(SendingProfile::from).collect())
    }

    pub async fn mark_sent(&self, id: EspProfileId) -> anyhow::Result<()> {
        sqlx::query(
            "update sending_profiles set sent_today = sent_today + 1, \
             sent_this_hour = sent_this_hour + 1 where id = $1",
        )
        .bind(id.as_uuid())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_healthy(&self, id: EspProfileId, healthy: bool) -> anyhow::Result<()> {
        sqlx::query("update sending_profiles set healthy = $2 where id = $1")
            .bind(id.as_uuid())
            .bind(healthy)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Resets the hourly counter; called once an hour by the same
    /// scheduler loop that runs the lease reaper.
    pub async fn reset_hourly_counters(&self) -> anyhow::Result<()> {
        sqlx::query("update sending_profiles set sent_this_hour = 0")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Resets the daily counter; called once a day (UTC midnight by
    /// default — operators running across timezones can schedule this
    /// externally at local midnight instead).
    pub async fn reset_daily_counters(&self) -> anyhow::Result<()> {
        sqlx::query("update sending_profiles set sent_today = 0, counters_reset_at = now()")
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
