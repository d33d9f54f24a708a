//! Postgres connection pool setup, applying `sqlx::migrate!` at start-up
//! the way the teacher's `kumod` applies its spool/queue schema at boot.
use sqlx::postgres::{PgPoolOptions, PgSslMode};
use sqlx::PgPool;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub url: String,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
    pub idle_timeout: Option<Duration>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            url: "postgres://localhost/campaign_sendd".to_string(),
            max_connections: 10,
            acquire_timeout: Duration::from_secs(10),
            idle_timeout: Some(Duration::from_secs(600)),
        }
    }
}

pub async fn connect(config: &PoolConfig) -> anyhow::Result<PgPool> {
    let options: sqlx::postgres::PgConnectOptions = config.url.parse()?;
    let options = options.ssl_mode(PgSslMode::Prefer);

    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(config.acquire_timeout)
        .idle_timeout(config.idle_timeout)
        .connect_with(options)
        .await?;

    Ok(pool)
}

pub async fn migrate(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}
