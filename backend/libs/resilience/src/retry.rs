/// Retry loops driven by a [`BackoffPolicy`], optionally interrupted by shutdown
use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tracing::warn;

use crate::backoff::BackoffPolicy;

#[derive(Debug, thiserror::Error)]
pub enum RetryError<E> {
    #[error("Gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: E },
    #[error("Retry cancelled by shutdown after {attempts} attempts")]
    Cancelled { attempts: u32 },
}

impl<E> RetryError<E> {
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::Exhausted { attempts, .. } | RetryError::Cancelled { attempts } => *attempts,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, RetryError::Cancelled { .. })
    }
}

/// Execute `op` until it succeeds, the policy gives up, or `shutdown` flips to
/// `true`. Only the waits between attempts observe shutdown; an attempt already
/// running is never interrupted.
///
/// `op` receives the 1-based attempt number.
pub async fn with_retry_until_shutdown<P, F, Fut, T, E>(
    policy: &P,
    shutdown: &mut watch::Receiver<bool>,
    mut op: F,
) -> Result<T, RetryError<E>>
where
    P: BackoffPolicy + ?Sized,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0;

    loop {
        if *shutdown.borrow() {
            return Err(RetryError::Cancelled { attempts: attempt });
        }

        attempt += 1;
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) => {
                let Some(delay) = policy.next_delay(attempt) else {
                    warn!(attempts = attempt, error = %e, "Max retries reached");
                    return Err(RetryError::Exhausted {
                        attempts: attempt,
                        last: e,
                    });
                };

                warn!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Attempt failed, retrying"
                );

                if !sleep_unless_shutdown(delay, shutdown).await {
                    return Err(RetryError::Cancelled { attempts: attempt });
                }
            }
        }
    }
}

/// Sleep for `delay`, returning early with `false` if shutdown is requested.
///
/// A dropped shutdown sender means shutdown can no longer be requested, so the
/// full delay is honored in that case.
pub async fn sleep_unless_shutdown(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    if *shutdown.borrow() {
        return false;
    }

    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);

    let stopped = tokio::select! {
        _ = &mut sleep => return true,
        changed = shutdown.wait_for(|stop| *stop) => changed.is_ok(),
    };

    if stopped {
        return false;
    }

    sleep.await;
    true
}
