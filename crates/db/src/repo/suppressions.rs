//! Durable store behind the suppression hub: upsert by
//! `email_hash` never downgrading category, plus the MD5 compatibility
//! write to the global legacy list (Open Question 3).
use campaign_core::{CampaignId, SuppressionCategory, SuppressionEntry, SuppressionEntryId};
use chrono::Utc;
use sqlx::PgPool;

pub struct SuppressionRepo {
    pool: PgPool,
}

#[derive(sqlx::FromRow)]
struct Row {
    id: uuid::Uuid,
    email: String,
    email_hash: String,
    legacy_md5_hash: Option<String>,
    category: String,
    source: String,
    reason: Option<String>,
    campaign_id: Option<uuid::Uuid>,
    created_at: chrono::DateTime<Utc>,
}

impl TryFrom<Row> for SuppressionEntry {
    type Error = anyhow::Error;
    fn try_from(row: Row) -> Result<Self, Self::Error> {
        Ok(SuppressionEntry {
            id: row.id.into(),
            email: row.email,
            email_hash_sha256: row.email_hash,
            email_hash_md5: row.legacy_md5_hash.unwrap_or_default(),
            category: serde_json::from_value(serde_json::Value::String(row.category))?,
            source: row.source,
            reason: row.reason,
            campaign_id: row.campaign_id.map(CampaignId::from),
            created_at: row.created_at,
        })
    }
}

impl SuppressionRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Loads the full suppression set at start-up for the in-memory
    /// cache ("reconstructed at start-up").
    pub async fn load_all(&self) -> anyhow::Result<Vec<SuppressionEntry>> {
        let rows: Vec<Row> = sqlx::query_as(
            "select id, email, email_hash, legacy_md5_hash, category, source, reason, \
             campaign_id, created_at from suppressions",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(SuppressionEntry::try_from).collect()
    }

    pub async fn find_by_hash(&self, email_hash: &str) -> anyhow::Result<Option<SuppressionEntry>> {
        let row: Option<Row> = sqlx::query_as(
            "select id, email, email_hash, legacy_md5_hash, category, source, reason, \
             campaign_id, created_at from suppressions where email_hash = $1",
        )
        .bind(email_hash)
        .fetch_optional(&self.pool)
        .await?;
        row.map(SuppressionEntry::try_from).transpose()
    }

    /// Upsert honoring the never-downgrade precedence rule in
    /// `SuppressionCategory::supersedes`, and mirroring
    /// into the global `suppression_entries` legacy-MD5 table.
    pub async fn upsert(
        &self,
        email: &str,
        email_hash_sha256: &str,
        email_hash_md5: &str,
        category: SuppressionCategory,
        source: &str,
        reason: Option<&str>,
        campaign_id: Option<CampaignId>,
        legacy_list_id: uuid::Uuid,
    ) -> anyhow::Result<SuppressionEntry> {
        let mut tx = self.pool.begin().await?;

        let existing: Option<Row> = sqlx::query_as(
            "select id, email, email_hash, legacy_md5_hash, category, source, reason, \
             campaign_id, created_at from suppressions where email_hash = $1 for update",
        )
        .bind(email_hash_sha256)
        .fetch_optional(&mut *tx)
        .await?;

        let resolved_category = match &existing {
            None => category,
            Some(row) => {
                let existing_category: SuppressionCategory =
                    serde_json::from_value(serde_json::Value::String(row.category.clone()))?;
                if category.supersedes(existing_category) {
                    category
                } else {
                    existing_category
                }
            }
        };

        let id = existing
            .as_ref()
            .map(|r| r.id)
            .unwrap_or_else(|| SuppressionEntryId::new().as_uuid());

        sqlx::query(
            "insert into suppressions (id, email, email_hash, legacy_md5_hash, category, \
             source, reason, campaign_id, created_at)
             values ($1,$2,$3,$4,$5,$6,$7,$8, now())
             on conflict (email_hash) do update set
                category = excluded.category,
                legacy_md5_hash = excluded.legacy_md5_hash,
                source = excluded.source,
                reason = excluded.reason",
        )
        .bind(id)
        .bind(email)
        .bind(email_hash_sha256)
        .bind(email_hash_md5)
        .bind(resolved_category.to_string())
        .bind(source)
        .bind(reason)
        .bind(campaign_id.map(|c| c.as_uuid()))
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "insert into suppression_entries (id, list_id, md5_hash, email_hash, created_at)
             values ($1, $2, $3, $4, now())
             on conflict (list_id, md5_hash) do nothing",
        )
        .bind(uuid::Uuid::new_v4())
        .bind(legacy_list_id)
        .bind(email_hash_md5)
        .bind(email_hash_sha256)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(SuppressionEntry {
            id: id.into(),
            email: email.to_string(),
            email_hash_sha256: email_hash_sha256.to_string(),
            email_hash_md5: email_hash_md5.to_string(),
            category: resolved_category,
            source: source.to_string(),
            reason: reason.map(str::to_string),
            campaign_id,
            created_at: Utc::now(),
        })
    }

    pub async fn delete(&self, email_hash: &str) -> anyhow::Result<bool> {
        let result = sqlx::query("delete from suppressions where email_hash = $1")
            .bind(email_hash)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
