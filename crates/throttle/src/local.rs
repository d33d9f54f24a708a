//! In-process fallback throttle backend. Used when no coordination store
//! is configured, or when a spec explicitly requests `local:` semantics
//! (per-process rather than per-fleet). Accepts soft over-send across
//! replicas in exchange for zero external dependency.
use crate::{Error, ThrottleResult};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::LazyLock;
use std::time::{Duration, Instant};

struct Bucket {
    count: u64,
    window_started: Instant,
}

static BUCKETS: LazyLock<DashMap<String, Mutex<Bucket>>> = LazyLock::new(DashMap::new());

pub(crate) fn local_throttle(
    key: &str,
    limit: u64,
    period: Duration,
    quantity: u64,
) -> Result<ThrottleResult, Error> {
    let entry = BUCKETS
        .entry(key.to_string())
        .or_insert_with(|| {
            Mutex::new(Bucket {
                count: 0,
                window_started: Instant::now(),
            })
        });
    let mut bucket = entry.lock();

    let now = Instant::now();
    let elapsed = now.duration_since(bucket.window_started);
    if elapsed >= period {
        bucket.count = 0;
        bucket.window_started = now;
    }

    let reset_after = period.saturating_sub(now.duration_since(bucket.window_started));
    let new_count = bucket.count + quantity;

    if new_count > limit {
        return Ok(ThrottleResult {
            throttled: true,
            limit,
            remaining: limit.saturating_sub(bucket.count),
            reset_after,
            retry_after: Some(reset_after),
        });
    }

    bucket.count = new_count;
    Ok(ThrottleResult {
        throttled: false,
        limit,
        remaining: limit.saturating_sub(bucket.count),
        reset_after,
        retry_after: None,
    })
}
