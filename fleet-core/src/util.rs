use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt as _};
use std::future::Future;
use std::time::{Duration, Instant};

pub trait FutureWaitExt: Future {
    fn wait(self) -> Self::Output;
}

impl<F> FutureWaitExt for F
where
    F: Future,
{
    fn wait(self) -> Self::Output {
        futures::executor::block_on(self)
    }
}

#[cfg_attr(test, mockall::automock)]
pub trait AsyncSleeping: 'static + Send + Sync {
    #[must_use]
    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()> {
        async_std::task::sleep(duration).boxed()
    }
}

pub struct AsyncSleep;
impl AsyncSleeping for AsyncSleep {}

/// The shared clock. Engines never call `Utc::now` directly so SLA arithmetic
/// stays testable.
#[cfg_attr(test, mockall::automock)]
pub trait Now: 'static + Send + Sync {
    fn utc_now(&self) -> DateTime<Utc>;
    fn instant_now(&self) -> Instant;
}

pub fn default_now() -> impl Now {
    DefaultNow {}
}

struct DefaultNow;
impl Now for DefaultNow {
    fn utc_now(&self) -> DateTime<Utc> {
        Utc::now()
    }
    fn instant_now(&self) -> Instant {
        Instant::now()
    }
}

/// First backoff delay.
const INITIAL_BACKOFF: Duration = Duration::from_millis(50);
/// Backoff delays double up to this cap.
const MAX_BACKOFF: Duration = Duration::from_secs(1);
/// Attempts before giving up.
pub const RETRY_ATTEMPTS: u32 = 5;

/// Runs `operation` until it succeeds or the retry budget is exhausted,
/// sleeping with exponential backoff (50ms doubling, capped at 1s) between
/// attempts. Returns the last error on exhaustion.
pub async fn retry_with_backoff<T, E, Fut>(
    sleep: &dyn AsyncSleeping,
    mut operation: impl FnMut() -> Fut,
) -> Result<T, E>
where
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Debug,
{
    let mut backoff = INITIAL_BACKOFF;
    let mut attempt = 1;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt >= RETRY_ATTEMPTS => return Err(err),
            Err(err) => {
                log::warn!(
                    "transient failure (attempt {}/{}), retrying in {:?}: {:?}",
                    attempt,
                    RETRY_ATTEMPTS,
                    backoff,
                    err,
                );
                sleep.sleep(backoff).await;
                backoff = (backoff * 2).min(MAX_BACKOFF);
                attempt += 1;
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::test_util::InstantSleep;
    use super::*;
    use anyhow::{anyhow, Result};
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn retry_returns_first_success() {
        let calls = AtomicU32::new(0);
        let result: Result<u32> = retry_with_backoff(&InstantSleep, || {
            let attempt = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if attempt < 3 {
                    Err(anyhow!("transient"))
                } else {
                    Ok(attempt)
                }
            }
        })
        .wait();
        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn retry_exhausts_budget() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = retry_with_backoff(&InstantSleep, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(anyhow!("permanent")) }
        })
        .wait();
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), RETRY_ATTEMPTS);
    }
}
