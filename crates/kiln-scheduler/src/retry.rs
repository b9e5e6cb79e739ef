//! Bounded retries for transient store conflicts.

use kiln_core::Result;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::debug;

pub const MAX_ATTEMPTS: u32 = 5;

const BASE_DELAY: Duration = Duration::from_millis(10);

/// Exponential backoff with up to 50% jitter.
fn backoff(attempt: u32) -> Duration {
    let delay = BASE_DELAY * 2u32.saturating_pow(attempt.min(10));
    let jitter = rand::thread_rng().gen_range(0.0..0.5);
    delay.mul_f64(1.0 + jitter)
}

/// Runs `op` until it succeeds, fails permanently, or `MAX_ATTEMPTS` is
/// reached. Only errors with `is_transient()` are retried.
pub async fn retry_transient<T, F, Fut>(what: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Err(e) if e.is_transient() && attempt < MAX_ATTEMPTS => {
                debug!(attempt, error = %e, "{what}: transient failure, retrying");
                tokio::time::sleep(backoff(attempt)).await;
                attempt += 1;
            }
            result => return result,
        }
    }
}
