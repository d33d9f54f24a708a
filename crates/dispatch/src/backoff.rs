//! Exponential backoff with jitter for retryable send failures (spec.md
//! §4.6: `base * 2^attempt ± 20%`, base in minutes).
use rand::Rng;

pub fn backoff(base_minutes: i64, attempt: u32, rng: &mut impl Rng) -> chrono::Duration {
    let base = base_minutes as f64 * 2f64.powi(attempt as i32);
    let jitter = rng.gen_range(-0.2..=0.2);
    let minutes = (base * (1.0 + jitter)).max(0.0);
    chrono::Duration::milliseconds((minutes * 60_000.0) as i64)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn grows_exponentially_within_jitter_band() {
        let mut rng = rand::thread_rng();
        for attempt in 0..5 {
            let d = backoff(1, attempt, &mut rng);
            let expected = 60_000.0 * 2f64.powi(attempt as i32);
            let minutes = d.num_milliseconds() as f64;
            assert!(minutes >= expected * 0.8 - 1.0 && minutes <= expected * 1.2 + 1.0, "attempt {attempt}: {minutes} vs {expected}");
        }
    }
}
