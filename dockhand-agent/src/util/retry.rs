//! Fixed-schedule retry for bundle downloads.

use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Waits between download attempts: three retries at 10, 30 and 90 seconds.
pub const DOWNLOAD_RETRY_SCHEDULE: [Duration; 3] = [
    Duration::from_secs(10),
    Duration::from_secs(30),
    Duration::from_secs(90),
];

/// Run `op` until it succeeds or the schedule is exhausted. Waits are
/// interruptible; cancellation surfaces the last error.
pub async fn with_schedule<T, E, F, Fut>(
    schedule: &[Duration],
    cancel: &CancellationToken,
    what: &str,
    mut op: F,
) -> Result<T, E>
where
    E: std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) => {
                if attempt >= schedule.len() || cancel.is_cancelled() {
                    return Err(e);
                }
                let delay = schedule[attempt];
                warn!("{what} failed (attempt {}): {e}; retrying in {delay:?}", attempt + 1);
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => return Err(e),
                }
                attempt += 1;
            }
        }
    }
}
