//! A throttling API used to enforce the layered rate limits of §4.6:
//! per-campaign, per-ESP-profile and per-ISP-bucket sends per minute/hour.
//!
//! Limiters are implemented as atomic counters with per-period buckets.
//! When a coordination store (Redis) is configured, the counter is shared
//! across every dispatch worker process via an atomic `INCR`+`PEXPIRE`
//! Lua script; otherwise an in-process bucket map is used, which accepts
//! soft over-send in a multi-replica deployment per §4.6.
use serde::{Deserialize, Serialize};
use std::convert::TryFrom;
use std::time::Duration;
use thiserror::Error;

mod local;
#[cfg(feature = "redis-backend")]
mod redis_backend;

#[derive(Error, Debug)]
pub enum Error {
    #[error("{0}")]
    Generic(String),
    #[error("{0}")]
    AnyHow(#[from] anyhow::Error),
    #[cfg(feature = "redis-backend")]
    #[error("{0}")]
    Redis(#[from] redis::RedisError),
}

/// A parsed rate limit specification, eg. `100/hr` or `local:50/m`.
#[derive(Eq, PartialEq, Clone, Copy, Serialize, Deserialize, Hash)]
#[serde(try_from = "String")]
pub struct ThrottleSpec {
    pub limit: u64,
    /// Period, in seconds
    pub period: u64,
    pub max_burst: Option<u64>,
    pub force_local: bool,
}

impl ThrottleSpec {
    pub async fn throttle<S: AsRef<str>>(
        &self,
        store: &ThrottleStore,
        key: S,
    ) -> Result<ThrottleResult, Error> {
        self.throttle_quantity(store, key, 1).await
    }

    pub async fn throttle_quantity<S: AsRef<str>>(
        &self,
        store: &ThrottleStore,
        key: S,
        quantity: u64,
    ) -> Result<ThrottleResult, Error> {
        let key = key.as_ref();
        let limit = self.limit;
        let period = self.period;
        let full_key = format!("{key}:{limit}:{period}");
        store
            .throttle(
                &full_key,
                limit,
                Duration::from_secs(period),
                quantity,
                self.force_local,
            )
            .await
    }
}

impl std::fmt::Debug for ThrottleSpec {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self.as_string() {
            Ok(s) => write!(fmt, "{s}"),
            Err(_) => Err(std::fmt::Error),
        }
    }
}

impl std::fmt::Display for ThrottleSpec {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self.as_string() {
            Ok(s) => write!(fmt, "{s}"),
            Err(_) => Err(std::fmt::Error),
        }
    }
}

impl ThrottleSpec {
    pub fn as_string(&self) -> Result<String, String> {
        let period = match self.period {
            86400 => "d",
            3600 => "h",
            60 => "m",
            1 => "s",
            _ => return Err(format!("cannot represent period {} as string", self.period)),
        };
        if let Some(burst) = self.max_burst {
            return Err(format!("cannot represent max_burst {burst} as string"));
        }

        Ok(format!(
            "{}{}/{period}",
            if self.force_local { "local:" } else { "" },
            self.limit
        ))
    }

    /// Clamp a raw per-minute rate to the [1, 10_000] range required by the
    /// custom throttle preset (boundary behavior).
    pub fn from_rate_per_minute(rate_per_minute: u64) -> Self {
        let limit = rate_per_minute.clamp(1, 10_000);
        Self {
            limit,
            period: 60,
            max_burst: None,
            force_local: false,
        }
    }
}

impl TryFrom<String> for ThrottleSpec {
    type Error = String;
    fn try_from(s: String) -> Result<Self, String> {
        Self::try_from(s.as_str())
    }
}

impl TryFrom<&str> for ThrottleSpec {
    type Error = String;
    fn try_from(s: &str) -> Result<Self, String> {
        let (force_local, s) = match s.strip_prefix("local:") {
            Some(s) => (true, s),
            None => (false, s),
        };
        let (limit, period) = s
            .split_once('/')
            .ok_or_else(|| format!("expected 'limit/period', got {s}"))?;

        let period = match period {
            "h" | "hr" | "hour" => 3600,
            "m" | "min" | "minute" => 60,
            "s" | "sec" | "second" => 1,
            "d" | "day" => 86400,
            invalid => return Err(format!("unknown period quantity {invalid}")),
        };

        // Allow "1_000/hr" and "1,000/hr" for more readable config
        let limit: String = limit
            .chars()
            .filter_map(|c| match c {
                '_' | ',' => None,
                c => Some(c),
            })
            .collect();

        let limit = limit
            .parse::<u64>()
            .map_err(|err| format!("invalid limit '{limit}': {err:#}"))?;

        if limit == 0 {
            return Err(format!(
                "invalid ThrottleSpec `{s}`: limit must be greater than 0!"
            ));
        }

        Ok(Self {
            limit,
            period,
            max_burst: None,
            force_local,
        })
    }
}

#[derive(Debug, Eq, PartialEq, Serialize)]
pub struct ThrottleResult {
    /// true if the action was limited
    pub throttled: bool,
    pub limit: u64,
    pub remaining: u64,
    pub reset_after: Duration,
    pub retry_after: Option<Duration>,
}

/// Handle to the configured throttling backend. Cheap to clone.
#[derive(Clone)]
pub struct ThrottleStore {
    #[cfg(feature = "redis-backend")]
    redis: Option<redis_backend::RedisThrottle>,
}

impl Default for ThrottleStore {
    fn default() -> Self {
        Self::local_only()
    }
}

impl ThrottleStore {
    pub fn local_only() -> Self {
        Self {
            #[cfg(feature = "redis-backend")]
            redis: None,
        }
    }

    #[cfg(feature = "redis-backend")]
    pub fn with_redis(client: redis::Client) -> Self {
        Self {
            redis: Some(redis_backend::RedisThrottle::new(client)),
        }
    }

    async fn throttle(
        &self,
        key: &str,
        limit: u64,
        period: Duration,
        quantity: u64,
        force_local: bool,
    ) -> Result<ThrottleResult, Error> {
        #[cfg(feature = "redis-backend")]
        if !force_local {
            if let Some(redis) = &self.redis {
                return redis.throttle(key, limit, period, quantity).await;
            }
        }
        #[cfg(not(feature = "redis-backend"))]
        let _ = force_local;

        local::local_throttle(key, limit, period, quantity)
    }
}
