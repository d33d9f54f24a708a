//! Per-campaign distributed locking: "Redis SET NX PX
//! + Postgres advisory lock as a fallback". Rate-limit counters are owned
//! by the `throttle` crate's own Redis backend and are not duplicated
//! here; this module is scoped to the lock half of "coordination store".
use async_trait::async_trait;
use campaign_core::DistributedLock;
use chrono::Utc;
use sqlx::PgPool;
use std::time::Duration;

#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Attempts to acquire `resource_name` for `holder_id` with a lease of
    /// `ttl`. Returns `true` if the lock was acquired (either because it
    /// was free or its previous lease had expired), `false` if another
    /// holder currently holds a live lease.
    async fn acquire(&self, resource_name: &str, holder_id: &str, ttl: Duration)
        -> anyhow::Result<bool>;

    /// Extends an already-held lease. Returns `false` if `holder_id` is
    /// not (or is no longer) the holder.
    async fn renew(&self, resource_name: &str, holder_id: &str, ttl: Duration)
        -> anyhow::Result<bool>;

    /// Releases the lock. A no-op (returns `false`) if `holder_id` is not
    /// the current holder — releases are holder-gated.
    async fn release(&self, resource_name: &str, holder_id: &str) -> anyhow::Result<bool>;

    async fn current(&self, resource_name: &str) -> anyhow::Result<Option<DistributedLock>>;
}

/// Postgres-table-backed implementation, used when no Redis URL is
/// configured (: "Postgres advisory lock as a fallback"). We
/// model this with a plain row-and-transaction rather than session-scoped
/// `pg_advisory_lock`, since our holders are not the Postgres connections
/// themselves but independent worker processes with their own leases.
pub struct PostgresCoordinationStore {
    pool: PgPool,
}

impl PostgresCoordinationStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CoordinationStore for PostgresCoordinationStore {
    async fn acquire(
        &self,
        resource_name: &str,
        holder_id: &str,
        ttl: Duration,
    ) -> anyhow::Result<bool> {
        let now = Utc::now();
        let expires_at = now + chrono::Duration::from_std(ttl)?;

        let mut tx = self.pool.begin().await?;
        let existing: Option<(String, chrono::DateTime<Utc>)> = sqlx::query_as(
            "select holder_id, expires_at from distributed_locks where resource_name = $1 for update",
        )
        .bind(resource_name)
        .fetch_optional(&mut *tx)
        .await?;

        let may_take = match &existing {
            None => true,
            Some((holder, expires)) => holder == holder_id || *expires <= now,
        };

        if !may_take {
            tx.rollback().await?;
            return Ok(false);
        }

        sqlx::query(
            "insert into distributed_locks (resource_name, holder_id, expires_at)
             values ($1, $2, $3)
             on conflict (resource_name)
             do update set holder_id = excluded.holder_id, expires_at = excluded.expires_at",
        )
        .bind(resource_name)
        .bind(holder_id)
        .bind(expires_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn renew(
        &self,
        resource_name: &str,
        holder_id: &str,
        ttl: Duration,
    ) -> anyhow::Result<bool> {
        let expires_at = Utc::now() + chrono::Duration::from_std(ttl)?;
        let result = sqlx::query(
            "update distributed_locks set expires_at = $3
             where resource_name = $1 and holder_id = $2",
        )
        .bind(resource_name)
        .bind(holder_id)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn release(&self, resource_name: &str, holder_id: &str) -> anyhow::Result<bool> {
        let result = sqlx::query(
            "delete from distributed_locks where resource_name = $1 and holder_id = $2",
        )
        .bind(resource_name)
        .bind(holder_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn current(&self, resource_name: &str) -> anyhow::Result<Option<DistributedLock>> {
        let row: Option<(String, String, chrono::DateTime<Utc>)> = sqlx::query_as(
            "select resource_name, holder_id, expires_at from distributed_locks where resource_name = $1",
        )
        .bind(resource_name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(resource_name, holder_id, expires_at)| DistributedLock {
            resource_name,
            holder_id,
            expires_at,
        }))
    }
}

#[cfg(feature = "redis-backend")]
pub mod redis_store {
    use super::*;
    use redis::aio::ConnectionManager;
    use redis::AsyncCommands;

    /// `SET NX PX` backed lock with a Lua script gating renew/release on
    /// the caller still being the recorded holder (the classic
    /// single-instance Redlock pattern; good enough for the soft
    /// guarantee this spec asks for, final safety net is the DB row
    /// status guard "Double-send protection").
    pub struct RedisCoordinationStore {
        client: redis::Client,
    }

    const RENEW_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("PEXPIRE", KEYS[1], ARGV[2])
else
    return 0
end
"#;

    const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

    impl RedisCoordinationStore {
        pub fn new(client: redis::Client) -> Self {
            Self { client }
        }

        async fn conn(&self) -> anyhow::Result<ConnectionManager> {
            Ok(self.client.get_connection_manager().await?)
        }

        fn key(resource_name: &str) -> String {
            format!("campaign-sendd:lock:{resource_name}")
        }
    }

    #[async_trait]
    impl CoordinationStore for RedisCoordinationStore {
        async fn acquire(
            &self,
            resource_name: &str,
            holder_id: &str,
            ttl: Duration,
        ) -> anyhow::Result<bool> {
            let mut conn = self.conn().await?;
            let key = Self::key(resource_name);
            let ok: bool = redis::cmd("SET")
                .arg(&key)
                .arg(holder_id)
                .arg("NX")
                .arg("PX")
                .arg(ttl.as_millis() as u64)
                .query_async(&mut conn)
                .await
                .unwrap_or(false);
            Ok(ok)
        }

        async fn renew(
            &self,
            resource_name: &str,
            holder_id: &str,
            ttl: Duration,
        ) -> anyhow::Result<bool> {
            let mut conn = self.conn().await?;
            let key = Self::key(resource_name);
            let result: i64 = redis::Script::new(RENEW_SCRIPT)
                .key(&key)
                .arg(holder_id)
                .arg(ttl.as_millis() as u64)
                .invoke_async(&mut conn)
                .await?;
            Ok(result == 1)
        }

        async fn release(&self, resource_name: &str, holder_id: &str) -> anyhow::Result<bool> {
            let mut conn = self.conn().await?;
            let key = Self::key(resource_name);
            let result: i64 = redis::Script::new(RELEASE_SCRIPT)
                .key(&key)
                .arg(holder_id)
                .invoke_async(&mut conn)
                .await?;
            Ok(result == 1)
        }

        async fn current(&self, resource_name: &str) -> anyhow::Result<Option<DistributedLock>> {
            let mut conn = self.conn().await?;
            let key = Self::key(resource_name);
            let holder: Option<String> = conn.get(&key).await?;
            let ttl_ms: i64 = conn.pttl(&key).await.unwrap_or(-1);
            Ok(holder.map(|holder_id| DistributedLock {
                resource_name: resource_name.to_string(),
                holder_id,
                expires_at: Utc::now() + chrono::Duration::milliseconds(ttl_ms.max(0)),
            }))
        }
    }
}

#[cfg(feature = "redis-backend")]
pub use redis_store::RedisCoordinationStore;

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn lock_expiry_math_is_sane() {
        let now = Utc::now();
        let lock = DistributedLock {
            resource_name: "campaign:abc".into(),
            holder_id: "worker-1".into(),
            expires_at: now + chrono::Duration::minutes(5),
        };
        assert!(!lock.is_expired(now));
        assert!(lock.is_held_by("worker-1", now));
        assert!(!lock.is_held_by("worker-2", now));
    }
}
