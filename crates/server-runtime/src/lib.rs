//! Small helpers shared by every `campaign-sendd` role (enqueue worker,
//! dispatch pool, tracking/webhook HTTP servers, metrics aggregator):
//! named task spawning and graceful shutdown coordination.
//!
//! Unlike the mail relay this pipeline descends from, none of our work
//! depends on a non-`Send` embedded scripting runtime, so there is no
//! need for the LocalSet thread-pool dance that justified a bespoke
//! `Runtime` type upstream — plain `tokio::task::Builder` spawns serve
//! every role here.
use std::future::Future;
use tokio::task::JoinHandle;

pub mod lifecycle;
pub mod metrics;

/// Spawn a future as a named task. Naming tasks makes `tokio-console`
/// and panic backtraces readable when a dozen roles run in one process
/// during integration tests.
pub fn spawn<FUT, N: AsRef<str>>(name: N, fut: FUT) -> std::io::Result<JoinHandle<FUT::Output>>
where
    FUT: Future + Send + 'static,
    FUT::Output: Send,
{
    tokio::task::Builder::new().name(name.as_ref()).spawn(fut)
}

pub fn spawn_blocking<F, N, R>(name: N, func: F) -> std::io::Result<JoinHandle<R>>
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
    N: AsRef<str>,
{
    tokio::task::Builder::new()
        .name(name.as_ref())
        .spawn_blocking(func)
}

/// Number of worker tasks to run for a pool, honoring an explicit
/// override and otherwise deriving from available parallelism. Used by
/// the dispatch pool (§4.7) to size its concurrent lease-holders and by
/// the enqueue worker (§4.5) to size its chunk-resolution concurrency.
pub fn pool_size(env_var: &str, default_fraction: impl FnOnce(usize) -> usize) -> anyhow::Result<usize> {
    match std::env::var(env_var) {
        Ok(n) => Ok(n.parse()?),
        Err(_) => {
            let cpus = std::thread::available_parallelism()?.get();
            Ok(default_fraction(cpus).max(1))
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn spawn_runs_the_future() {
        let handle = spawn("test-task", async { 1 + 1 }).unwrap();
        assert_eq!(handle.await.unwrap(), 2);
    }

    #[test]
    fn pool_size_falls_back_to_default() {
        std::env::remove_var("CAMPAIGN_SENDD_TEST_POOL_THREADS");
        let n = pool_size("CAMPAIGN_SENDD_TEST_POOL_THREADS", |cpus| cpus / 2).unwrap();
        assert!(n >= 1);
    }
}
