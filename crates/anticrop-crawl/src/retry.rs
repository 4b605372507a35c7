//! Retry with exponential backoff
//!
//! Wraps every network call of the crawl and archive paths. Retryability is
//! an explicit predicate passed by the call site, and the process-wide
//! shutdown signal always wins over a pending backoff sleep.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;

/// Process-wide cooperative shutdown signal.
///
/// Triggering never preempts anything; crawl loops poll [`is_triggered`] at
/// their boundaries and backoff sleeps race against [`triggered`].
///
/// [`is_triggered`]: Shutdown::is_triggered
/// [`triggered`]: Shutdown::triggered
#[derive(Debug, Clone, Default)]
pub struct Shutdown {
    inner: Arc<ShutdownInner>,
}

#[derive(Debug, Default)]
struct ShutdownInner {
    flag: AtomicBool,
    notify: Notify,
}

impl Shutdown {
    /// Creates an untriggered signal.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Raises the signal and wakes every waiter.
    pub fn trigger(&self) {
        self.inner.flag.store(true, Ordering::Release);
        self.inner.notify.notify_waiters();
    }

    /// Raises the signal, then waits out a grace period for in-flight
    /// network calls to finish.
    pub async fn trigger_with_grace(&self, grace: Duration) {
        self.trigger();
        tokio::time::sleep(grace).await;
    }

    /// Whether shutdown was requested.
    #[inline]
    #[must_use]
    pub fn is_triggered(&self) -> bool {
        self.inner.flag.load(Ordering::Acquire)
    }

    /// Resolves once the signal is raised.
    pub async fn triggered(&self) {
        loop {
            if self.is_triggered() {
                return;
            }
            let notified = self.inner.notify.notified();
            if self.is_triggered() {
                return;
            }
            notified.await;
        }
    }
}

/// Why a retried operation gave up.
#[derive(Debug, thiserror::Error)]
pub enum RetryError<E> {
    /// Shutdown was requested while waiting or about to try again.
    #[error("operation cancelled by shutdown")]
    Cancelled,

    /// The operation failed with a non-retryable error, or retries ran out.
    #[error(transparent)]
    Inner(E),
}

/// Retries `op` with exponential backoff (`2^attempt` seconds).
///
/// `max_attempts == 0` retries without bound. Errors rejected by
/// `is_retryable` are returned immediately.
///
/// # Errors
/// - `RetryError::Cancelled` once the shutdown signal is raised
/// - `RetryError::Inner` for a terminal error
pub async fn retry<T, E, F, Fut>(
    max_attempts: u32,
    shutdown: &Shutdown,
    is_retryable: impl Fn(&E) -> bool,
    mut op: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt: u32 = 0;
    loop {
        if shutdown.is_triggered() {
            return Err(RetryError::Cancelled);
        }
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if !is_retryable(&e) => return Err(RetryError::Inner(e)),
            Err(e) => {
                attempt += 1;
                if max_attempts != 0 && attempt >= max_attempts {
                    return Err(RetryError::Inner(e));
                }
                let delay = Duration::from_secs(1 << attempt.min(16));
                tracing::debug!(attempt, delay_secs = delay.as_secs(), "retrying after failure");
                tokio::select! {
                    () = shutdown.triggered() => return Err(RetryError::Cancelled),
                    () = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[tokio::test(start_paused = true)]
    async fn retry_succeeds_after_transient_failures() {
        let shutdown = Shutdown::new();
        let calls = AtomicU32::new(0);
        let result: Result<u32, RetryError<&str>> = retry(
            5,
            &shutdown,
            |_| true,
            || async {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err("transient")
                } else {
                    Ok(n)
                }
            },
        )
        .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_gives_up_after_max_attempts() {
        let shutdown = Shutdown::new();
        let calls = AtomicU32::new(0);
        let result: Result<(), RetryError<&str>> = retry(
            3,
            &shutdown,
            |_| true,
            || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err("always")
            },
        )
        .await;
        assert!(matches!(result, Err(RetryError::Inner("always"))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_rejects_non_retryable_immediately() {
        let shutdown = Shutdown::new();
        let calls = AtomicU32::new(0);
        let result: Result<(), RetryError<&str>> = retry(
            0,
            &shutdown,
            |e| *e != "fatal",
            || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err("fatal")
            },
        )
        .await;
        assert!(matches!(result, Err(RetryError::Inner("fatal"))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_interrupts_backoff() {
        let shutdown = Shutdown::new();
        let trigger = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.trigger();
        });
        let result: Result<(), RetryError<&str>> = retry(
            0,
            &shutdown,
            |_| true,
            || async { Err("transient") },
        )
        .await;
        assert!(matches!(result, Err(RetryError::Cancelled)));
    }

    #[tokio::test]
    async fn triggered_resolves_for_existing_trigger() {
        let shutdown = Shutdown::new();
        shutdown.trigger();
        shutdown.triggered().await;
        assert!(shutdown.is_triggered());
    }
}
