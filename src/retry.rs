use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::CadreError;
use crate::log_warn;

/// Exponential-backoff retry policy (spec §4.3): the delay before attempt
/// `n` (1-indexed, n > 1) is `min(base_delay_ms * 2^(n-2), max_delay_ms)`.
/// No delay precedes the first attempt.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl RetryPolicy {
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let exponent = attempt.saturating_sub(2).min(63);
        let scaled = self.base_delay_ms.saturating_mul(1u64 << exponent);
        Duration::from_millis(scaled.min(self.max_delay_ms))
    }
}

/// The outcome of a completed `execute` call: how many attempts of `fn` ran,
/// and whether the result came from `fn` succeeding outright or from
/// `on_exhausted` supplying a recovery value after every attempt failed.
#[derive(Debug, Clone)]
pub struct RetryOutcome<T> {
    pub result: T,
    pub attempts: u32,
    pub recovery_used: bool,
}

/// Run `task` up to `policy.max_attempts` times, sleeping with exponential
/// backoff between attempts. `CadreError::BudgetExceeded` and
/// `CadreError::ShutdownRequested` are never retried — they propagate on the
/// first occurrence untouched, since a retry cannot change either outcome.
/// `on_retry` is invoked between a failed attempt and the next one, with the
/// attempt number that just failed and the error it produced.
///
/// `on_exhausted` is invoked once, after the final attempt fails. If it
/// returns `Some(value)`, the call is treated as successful with
/// `recovery_used=true` and `value` as the result; if it returns `None`, the
/// last error is returned to the caller.
pub async fn execute<F, Fut, T>(
    policy: RetryPolicy,
    cancel: &CancellationToken,
    mut task: F,
    mut on_retry: impl FnMut(u32, &CadreError),
    mut on_exhausted: impl FnMut(&CadreError) -> Option<T>,
) -> Result<RetryOutcome<T>, CadreError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, CadreError>>,
{
    let mut attempt = 1;
    loop {
        if cancel.is_cancelled() {
            return Err(CadreError::ShutdownRequested);
        }

        match task(attempt).await {
            Ok(value) => {
                return Ok(RetryOutcome {
                    result: value,
                    attempts: attempt,
                    recovery_used: false,
                })
            }
            Err(err) if err.is_budget_exceeded() || err.is_shutdown() => return Err(err),
            Err(err) => {
                if attempt >= policy.max_attempts {
                    return match on_exhausted(&err) {
                        Some(value) => Ok(RetryOutcome {
                            result: value,
                            attempts: attempt,
                            recovery_used: true,
                        }),
                        None => Err(err),
                    };
                }

                on_retry(attempt, &err);
                log_warn!("attempt {} failed: {} (retrying)", attempt, err);

                let delay = policy.delay_for_attempt(attempt + 1);
                if !delay.is_zero() {
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => return Err(CadreError::ShutdownRequested),
                    }
                }

                attempt += 1;
            }
        }
    }
}
