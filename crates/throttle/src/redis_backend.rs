//! Redis-coordinated throttle backend: an atomic `INCRBY`+`PEXPIRE` bucket
//! shared by every dispatch worker process in the fleet.
use crate::{Error, ThrottleResult};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use std::time::Duration;
use tokio::sync::OnceCell;

// KEYS[1] = bucket key
// ARGV[1] = quantity to add
// ARGV[2] = period in milliseconds
//
// Returns { new_count, ttl_ms } atomically: the first caller in a window
// sets the expiry, every subsequent caller just increments.
const INCR_SCRIPT: &str = r#"
local new_count = redis.call('INCRBY', KEYS[1], ARGV[1])
local ttl = redis.call('PTTL', KEYS[1])
if ttl < 0 then
    redis.call('PEXPIRE', KEYS[1], ARGV[2])
    ttl = tonumber(ARGV[2])
end
return { new_count, ttl }
"#;

#[derive(Clone)]
pub(crate) struct RedisThrottle {
    client: redis::Client,
    conn: std::sync::Arc<OnceCell<ConnectionManager>>,
}

impl RedisThrottle {
    pub(crate) fn new(client: redis::Client) -> Self {
        Self {
            client,
            conn: std::sync::Arc::new(OnceCell::new()),
        }
    }

    async fn connection(&self) -> Result<ConnectionManager, Error> {
        let conn = self
            .conn
            .get_or_try_init(|| async { self.client.get_connection_manager().await })
            .await?;
        Ok(conn.clone())
    }

    pub(crate) async fn throttle(
        &self,
        key: &str,
        limit: u64,
        period: Duration,
        quantity: u64,
    ) -> Result<ThrottleResult, Error> {
        let mut conn = self.connection().await?;
        let period_ms = period.as_millis() as u64;

        let (new_count, ttl_ms): (u64, i64) = Script::new(INCR_SCRIPT)
            .key(key)
            .arg(quantity)
            .arg(period_ms)
            .invoke_async(&mut conn)
            .await?;

        let reset_after = Duration::from_millis(ttl_ms.max(0) as u64);

        if new_count > limit {
            // Back the bucket off by the overshoot so a retry after
            // reset_after sees a clean window rather than starting negative.
            let _: () = conn.decr(key, quantity).await.unwrap_or(());
            return Ok(ThrottleResult {
                throttled: true,
                limit,
                remaining: 0,
                reset_after,
                retry_after: Some(reset_after),
            });
        }

        Ok(ThrottleResult {
            throttled: false,
            limit,
            remaining: limit.saturating_sub(new_count),
            reset_after,
            retry_after: None,
        })
    }
}
