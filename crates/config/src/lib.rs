//! Layered `campaign_sendd.toml` + environment settings loader, replacing
//! the teacher's embedded-Lua policy layer (`kumo-server-common`'s
//! `HttpListenerParams` pattern, without the scripting indirection) since
//! this system has no per-deploy policy script to host.
//!
//! Precedence, lowest to highest: compiled-in defaults, `config_path`
//! (default `./campaign_sendd.toml`, missing file is not an error),
//! `CAMPAIGN_SENDD__*` environment variables with `__` as the nesting
//! separator (e.g. `CAMPAIGN_SENDD__DATABASE__URL`).
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseSettings {
    pub url: String,
    #[serde(default = "default_db_max_connections")]
    pub max_connections: u32,
}

fn default_db_max_connections() -> u32 {
    10
}

/// `None` means "no Redis configured"; coordination and rate limiting
/// both fall back to their in-process/Postgres implementations per
/// .
#[derive(Debug, Clone, Deserialize, Default)]
pub struct RedisSettings {
    pub url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TrackingSettings {
    /// Base URL prepended to every generated tracking/open/unsubscribe
    /// link, e.g. `https://track.example.com`.
    pub base_url: String,
    /// Per-tenant HMAC signing keys. A tenant with no entry here falls
    /// back to `default_hmac_key`.
    #[serde(default)]
    pub tenant_hmac_keys: HashMap<String, String>,
    pub default_hmac_key: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ThrottlePresetSettings {
    pub low: String,
    pub medium: String,
    pub high: String,
    pub max: String,
}

impl Default for ThrottlePresetSettings {
    fn default() -> Self {
        Self {
            low: "20/min".to_string(),
            medium: "50/min".to_string(),
            high: "100/min".to_string(),
            max: "1000/min".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DispatchSettings {
    #[serde(with = "humantime_serde", default = "default_lease_duration")]
    pub lease_duration: Duration,
    #[serde(with = "humantime_serde", default = "default_reaper_interval")]
    pub reaper_interval: Duration,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_batch_size")]
    pub lease_batch_size: i64,
    #[serde(default = "default_worker_concurrency")]
    pub worker_concurrency: usize,
    /// `base` in the `base * 2^attempt ± 20%` backoff formula (spec.md
    /// §4.6), in minutes.
    #[serde(default = "default_backoff_base_minutes")]
    pub backoff_base_minutes: i64,
}

fn default_lease_duration() -> Duration {
    Duration::from_secs(120)
}

fn default_reaper_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_max_attempts() -> u32 {
    3
}

fn default_batch_size() -> i64 {
    100
}

fn default_worker_concurrency() -> usize {
    16
}

fn default_backoff_base_minutes() -> i64 {
    1
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            lease_duration: default_lease_duration(),
            reaper_interval: default_reaper_interval(),
            max_attempts: default_max_attempts(),
            lease_batch_size: default_batch_size(),
            worker_concurrency: default_worker_concurrency(),
            backoff_base_minutes: default_backoff_base_minutes(),
        }
    }
}

/// Per-ISP-bucket send caps (layer (c), e.g. "Yahoo at
/// ≤50/h"), keyed by the bucket name `isp_bucket` produces. A bucket
/// with no entry here is unthrottled at this layer.
#[derive(Debug, Clone, Deserialize)]
pub struct IspThrottleSettings {
    #[serde(flatten, default)]
    pub caps: HashMap<String, String>,
}

impl Default for IspThrottleSettings {
    fn default() -> Self {
        let mut caps = HashMap::new();
        caps.insert("Yahoo".to_string(), "50/hr".to_string());
        Self { caps }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpSettings {
    #[serde(default = "default_tracking_listen")]
    pub tracking_listen: String,
    #[serde(default = "default_webhook_listen")]
    pub webhook_listen: String,
    #[serde(default = "default_webhook_body_limit_bytes")]
    pub webhook_body_limit_bytes: usize,
}

fn default_tracking_listen() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_webhook_listen() -> String {
    "0.0.0.0:8081".to_string()
}

fn default_webhook_body_limit_bytes() -> usize {
    5 * 1024 * 1024
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            tracking_listen: default_tracking_listen(),
            webhook_listen: default_webhook_listen(),
            webhook_body_limit_bytes: default_webhook_body_limit_bytes(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EnqueueSettings {
    /// Soft-bounce promotion threshold (Open Question):
    /// promote to a hard suppression after this many soft bounces.
    #[serde(default = "default_soft_bounce_threshold")]
    pub soft_bounce_threshold: u32,
    /// ... within this trailing window.
    #[serde(with = "humantime_serde", default = "default_soft_bounce_window")]
    pub soft_bounce_window: Duration,
}

fn default_soft_bounce_threshold() -> u32 {
    5
}

fn default_soft_bounce_window() -> Duration {
    Duration::from_secs(14 * 24 * 3600)
}

impl Default for EnqueueSettings {
    fn default() -> Self {
        Self {
            soft_bounce_threshold: default_soft_bounce_threshold(),
            soft_bounce_window: default_soft_bounce_window(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CampaignStateSettings {
    /// Edit-lock / minimum-schedule-distance window.
    #[serde(default = "default_min_preparation_minutes")]
    pub min_preparation_minutes: i64,
    /// How long the per-campaign distributed lock is held for while
    /// enqueueing or transitioning.
    #[serde(with = "humantime_serde", default = "default_lock_ttl")]
    pub lock_ttl: Duration,
}

fn default_min_preparation_minutes() -> i64 {
    5
}

fn default_lock_ttl() -> Duration {
    Duration::from_secs(300)
}

impl Default for CampaignStateSettings {
    fn default() -> Self {
        Self {
            min_preparation_minutes: default_min_preparation_minutes(),
            lock_ttl: default_lock_ttl(),
        }
    }
}

/// Connection details for one ESP provider's HTTP API, keyed by the same
/// provider name stored on `SendingProfile.provider` (e.g. `"ses"`,
/// `"sparkpost"`). The operational caps/health columns for a profile live
/// in Postgres; the credentials needed to actually reach
/// the provider are a deploy-time secret, so they live here instead.
#[derive(Debug, Clone, Deserialize)]
pub struct EspProviderSettings {
    pub endpoint: String,
    pub api_key: String,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct EspSettings {
    #[serde(flatten, default)]
    pub providers: HashMap<String, EspProviderSettings>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub database: DatabaseSettings,
    #[serde(default)]
    pub redis: RedisSettings,
    pub tracking: TrackingSettings,
    #[serde(default)]
    pub throttle_presets: ThrottlePresetSettings,
    #[serde(default)]
    pub dispatch: DispatchSettings,
    #[serde(default)]
    pub http: HttpSettings,
    #[serde(default)]
    pub enqueue: EnqueueSettings,
    #[serde(default)]
    pub campaign_state: CampaignStateSettings,
    #[serde(default)]
    pub isp_throttle: IspThrottleSettings,
    #[serde(default)]
    pub esp: EspSettings,
}

impl Settings {
    /// Loads settings the way the teacher's daemons resolve their TOML
    /// policy file: an optional file on disk, then environment overrides,
    /// with `__` nesting so `CAMPAIGN_SENDD__DATABASE__URL` maps to
    /// `database.url`.
    pub fn load(config_path: Option<&str>) -> anyhow::Result<Self> {
        let path = config_path.unwrap_or("campaign_sendd.toml");

        let mut builder = config::Config::builder();
        if std::path::Path::new(path).exists() {
            builder = builder.add_source(config::File::with_name(path));
        } else {
            tracing::debug!(path, "no config file found, using defaults + env only");
        }
        builder = builder.add_source(
            config::Environment::with_prefix("CAMPAIGN_SENDD")
                .separator("__")
                .try_parsing(true),
        );

        let settings: Settings = builder.build()?.try_deserialize()?;
        Ok(settings)
    }

    pub fn hmac_key_for_tenant(&self, tenant_id: &str) -> &str {
        self.tracking
            .tenant_hmac_keys
            .get(tenant_id)
            .map(String::as_str)
            .unwrap_or(&self.tracking.default_hmac_key)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Write;

    #[test]
    fn loads_minimal_file_with_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
            [database]
            url = "postgres://localhost/campaign_sendd"

            [tracking]
            base_url = "https://track.example.com"
            default_hmac_key = "test-key"
            "#
        )
        .unwrap();

        let settings = Settings::load(Some(file.path().to_str().unwrap())).unwrap();
        assert_eq!(settings.database.url, "postgres://localhost/campaign_sendd");
        assert_eq!(settings.dispatch.max_attempts, 3);
        assert_eq!(settings.http.tracking_listen, "0.0.0.0:8080");
        assert!(settings.redis.url.is_none());
    }

    #[test]
    fn env_override_takes_precedence() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
            [database]
            url = "postgres://localhost/campaign_sendd"

            [tracking]
            base_url = "https://track.example.com"
            default_hmac_key = "test-key"
            "#
        )
        .unwrap();

        std::env::set_var("CAMPAIGN_SENDD__DISPATCH__MAX_ATTEMPTS", "7");
        let settings = Settings::load(Some(file.path().to_str().unwrap())).unwrap();
        std::env::remove_var("CAMPAIGN_SENDD__DISPATCH__MAX_ATTEMPTS");

        assert_eq!(settings.dispatch.max_attempts, 7);
    }

    #[test]
    fn hmac_key_falls_back_to_default() {
        let mut tenant_hmac_keys = HashMap::new();
        tenant_hmac_keys.insert("tenant-a".to_string(), "a-key".to_string());
        let tracking = TrackingSettings {
            base_url: "https://track.example.com".into(),
            tenant_hmac_keys,
            default_hmac_key: "fallback".into(),
        };
        let settings = Settings {
            database: DatabaseSettings {
                url: "postgres://localhost".into(),
                max_connections: 10,
            },
            redis: RedisSettings::default(),
            tracking,
            throttle_presets: ThrottlePresetSettings::default(),
            dispatch: DispatchSettings::default(),
            http: HttpSettings::default(),
            enqueue: EnqueueSettings::default(),
            campaign_state: CampaignStateSettings::default(),
            isp_throttle: IspThrottleSettings::default(),
            esp: EspSettings::default(),
        };

        assert_eq!(settings.hmac_key_for_tenant("tenant-a"), "a-key");
        assert_eq!(settings.hmac_key_for_tenant("tenant-b"), "fallback");
    }
}
