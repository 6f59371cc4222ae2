use std::future::Future;
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::{Level, warn};

/// Remote calls slower than this get a warning while they are still running.
pub const SLOW_CALL_THRESHOLD: Duration = Duration::from_secs(30);

/// Awaits `future`, warning every `threshold` for as long as it keeps running, and once more
/// when a slow call finally completes. The result is passed through untouched.
///
/// `describe` is only evaluated when a warning is actually emitted.
pub async fn warn_if_slow<F, T, M>(describe: &M, threshold: Duration, future: F) -> T
where
    F: Future<Output = T>,
    M: Fn() -> String,
{
    if !tracing::enabled!(Level::WARN) {
        return future.await;
    }

    tokio::pin!(future);
    let started = Instant::now();
    let mut slow = false;
    loop {
        tokio::select! {
            biased;
            result = &mut future => {
                if slow {
                    warn!("{} completed after {:.1}s", describe(), started.elapsed().as_secs_f32());
                }
                return result;
            }
            _ = sleep(threshold) => {
                slow = true;
                warn!("{} still running after {:.1}s", describe(), started.elapsed().as_secs_f32());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn passes_result_through() {
        let value = warn_if_slow(&|| "fast".to_string(), Duration::from_secs(5), async { 7 }).await;
        assert_eq!(value, 7);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_future_still_completes() {
        let value = warn_if_slow(&|| "slow".to_string(), Duration::from_millis(10), async {
            sleep(Duration::from_millis(50)).await;
            "done"
        })
        .await;
        assert_eq!(value, "done");
    }
}
