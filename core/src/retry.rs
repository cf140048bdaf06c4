//! Generic retry primitive (§4.7, §9 "retry is the one canonical loop").
//! Every retrying operation in this crate — vat launch, remote dial,
//! vatstore flush — goes through this instead of hand-rolled loops.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::transport::calculate_reconnection_backoff;

/// `max_attempts == 0` means unlimited attempts.
pub struct RetryOptions {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter: bool,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            max_attempts: 0,
            base_delay_ms: 500,
            max_delay_ms: 10_000,
            jitter: true,
        }
    }
}

/// Retries `op` until it succeeds, `should_retry` rejects the error, the
/// attempt budget is exhausted, or `cancel` fires. `on_retry` runs after a
/// failed attempt but before the delay, so callers can log or adjust state
/// between attempts.
pub async fn retry<T, E, Op, Fut, ShouldRetry, OnRetry>(
    mut op: Op,
    opts: RetryOptions,
    mut should_retry: ShouldRetry,
    mut on_retry: OnRetry,
    cancel: Option<CancellationToken>,
) -> Result<T, RetryOutcome<E>>
where
    Op: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    ShouldRetry: FnMut(&E) -> bool,
    OnRetry: FnMut(u32, &E),
{
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        if is_cancelled(&cancel) {
            return Err(RetryOutcome::Aborted);
        }

        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if !should_retry(&err) {
                    return Err(RetryOutcome::GaveUp(err));
                }
                on_retry(attempt, &err);

                if opts.max_attempts != 0 && attempt >= opts.max_attempts {
                    return Err(RetryOutcome::ExhaustedAttempts(err));
                }

                let delay_ms = calculate_reconnection_backoff(
                    attempt,
                    opts.base_delay_ms,
                    opts.max_delay_ms,
                    opts.jitter,
                );
                debug!(attempt, delay_ms, "retry backing off");
                if cancellable_delay(Duration::from_millis(delay_ms), &cancel).await {
                    return Err(RetryOutcome::Aborted);
                }
            }
        }
    }
}

#[derive(Debug)]
pub enum RetryOutcome<E> {
    /// `should_retry` rejected the error: not worth another attempt.
    GaveUp(E),
    /// The attempt budget ran out.
    ExhaustedAttempts(E),
    /// The cancel signal fired.
    Aborted,
}

fn is_cancelled(cancel: &Option<CancellationToken>) -> bool {
    cancel.as_ref().map(|token| token.is_cancelled()).unwrap_or(false)
}

/// Sleeps for `delay`, returning early (with `true`) if the cancel signal
/// fires first. Every exit path drops the timer, since `tokio::select!`
/// cancels whichever branch didn't win.
async fn cancellable_delay(delay: Duration, cancel: &Option<CancellationToken>) -> bool {
    match cancel {
        Some(token) => {
            tokio::select! {
                _ = tokio::time::sleep(delay) => false,
                _ = token.cancelled() => true,
            }
        }
        None => {
            tokio::time::sleep(delay).await;
            false
        }
    }
}
