use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Errors that know whether another attempt could succeed.
pub trait Retryable: Sized {
    fn is_retryable(&self) -> bool;

    /// Called once the retry budget is spent on a retryable error. The returned error must no
    /// longer be retryable, so callers above never retry it again.
    fn into_exhausted(self, attempts: usize) -> Self;

    /// The error reported when the caller gave up waiting.
    fn cancelled() -> Self;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryOptions {
    /// Total number of attempts, including the first one.
    pub max_attempts: usize,
    /// Fixed pause between two attempts.
    pub delay: Duration,
}

impl RetryOptions {
    pub const fn fixed(max_attempts: usize, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
        }
    }
}

impl Default for RetryOptions {
    fn default() -> Self {
        DEFAULT_OPTIONS
    }
}

pub const DEFAULT_OPTIONS: RetryOptions = RetryOptions::fixed(3, Duration::from_secs(5));

/// Runs `op` until it succeeds, fails with a non-retryable error, or `options.max_attempts`
/// attempts have been made. `what` names the call in retry logs.
///
/// Once `cancel` fires, the attempt in flight (or the pause before the next one) is dropped
/// and [`Retryable::cancelled`] is returned.
pub async fn run<T, E, F, Fut>(
    what: &str,
    op: F,
    options: &RetryOptions,
    cancel: &CancellationToken,
) -> Result<T, E>
where
    E: Retryable + Display,
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let max_attempts = options.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(E::cancelled()),
            result = op() => result,
        };
        match result {
            Ok(value) => return Ok(value),
            Err(err) if !err.is_retryable() => return Err(err),
            Err(err) if attempt >= max_attempts => return Err(err.into_exhausted(attempt)),
            Err(err) => {
                warn!(
                    "{what} failed (attempt {attempt}/{max_attempts}), retrying in {:?}: {err}",
                    options.delay
                );
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(E::cancelled()),
                    _ = tokio::time::sleep(options.delay) => {}
                }
                attempt += 1;
            }
        }
    }
}
