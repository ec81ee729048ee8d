use std::future::Future;
use std::time::Duration;

use anyhow::Error;
use log::warn;

const MAX_ATTEMPTS: u32 = 5;
const INITIAL_DELAY: Duration = Duration::from_secs(1);
const MAX_DELAY: Duration = Duration::from_secs(5);

/// Retry `op` with a 1s -> 5s backoff, at most 5 attempts.
///
/// The last error is returned verbatim once the attempts are exhausted.
/// Dropping the returned future cancels any in-flight attempt or sleep.
pub async fn with_backoff<T, F, Fut>(what: &str, mut op: F) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    let mut delay = INITIAL_DELAY;
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if attempt >= MAX_ATTEMPTS {
                    return Err(err);
                }
                warn!(
                    "{} failed (attempt {}/{}) - {}",
                    what, attempt, MAX_ATTEMPTS, err
                );
                tokio::time::sleep(delay).await;
                delay = std::cmp::min(delay * 2, MAX_DELAY);
                attempt += 1;
            }
        }
    }
}
