//! Batch persistence retry with a fixed backoff schedule.
//!
//! The first attempt always runs. After a failure the driver sleeps for the
//! next schedule entry (the last entry repeats once the schedule runs out)
//! and tries again, up to `max_retries` extra attempts. A shutdown signal
//! during a backoff sleep abandons the remaining attempts.

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;

use crate::config::WorkerConfig;
use crate::shutdown::wait_cancelled;

/// How a retried operation ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryOutcome {
    /// Succeeded; `attempts` = 1 means no retry was needed.
    Succeeded { attempts: u32 },
    /// Every attempt failed.
    Exhausted { attempts: u32, last_error: String },
    /// Shutdown arrived while waiting to retry.
    Interrupted { attempts: u32, last_error: String },
}

impl RetryOutcome {
    pub fn attempts(&self) -> u32 {
        match self {
            RetryOutcome::Succeeded { attempts }
            | RetryOutcome::Exhausted { attempts, .. }
            | RetryOutcome::Interrupted { attempts, .. } => *attempts,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, RetryOutcome::Succeeded { .. })
    }
}

/// Retry budget and backoff schedule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: Vec<Duration>,
}

impl RetryPolicy {
    pub fn from_config(config: &WorkerConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            backoff: config.retry_backoff.clone(),
        }
    }

    /// Delay before retry number `retry` (0-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        match self.backoff.last() {
            Some(last) => self.backoff.get(retry as usize).copied().unwrap_or(*last),
            None => Duration::ZERO,
        }
    }

    /// Run `operation` until it succeeds, the budget runs out, or `shutdown`
    /// fires during a backoff sleep.
    pub async fn run<F, Fut, E>(
        &self,
        shutdown: &mut watch::Receiver<bool>,
        mut operation: F,
    ) -> RetryOutcome
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<(), E>>,
        E: std::fmt::Display,
    {
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            let last_error = match operation().await {
                Ok(()) => return RetryOutcome::Succeeded { attempts },
                Err(e) => e.to_string(),
            };

            let retry = attempts - 1;
            if retry >= self.max_retries {
                return RetryOutcome::Exhausted {
                    attempts,
                    last_error,
                };
            }

            let delay = self.delay_for(retry);
            tracing::debug!(
                attempt = attempts,
                delay_ms = delay.as_millis() as u64,
                error = %last_error,
                "Batch insert failed, will retry"
            );

            tokio::select! {
                _ = wait_cancelled(shutdown) => {
                    return RetryOutcome::Interrupted { attempts, last_error };
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use tokio::time::Instant;

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            backoff: [1, 2, 4].map(Duration::from_secs).to_vec(),
        }
    }

    fn failing_until(calls: Arc<AtomicU32>, ok_on: u32) -> impl FnMut() -> std::future::Ready<Result<(), String>> {
        move || {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            std::future::ready(if n >= ok_on {
                Ok(())
            } else {
                Err(format!("attempt {} failed", n))
            })
        }
    }

    #[test]
    fn test_delay_clamps_to_last_entry() {
        let p = policy(10);
        assert_eq!(p.delay_for(0), Duration::from_secs(1));
        assert_eq!(p.delay_for(2), Duration::from_secs(4));
        assert_eq!(p.delay_for(7), Duration::from_secs(4));
        assert_eq!(
            RetryPolicy {
                max_retries: 1,
                backoff: Vec::new()
            }
            .delay_for(0),
            Duration::ZERO
        );
    }

    #[test]
    fn test_from_config_defaults() {
        let p = RetryPolicy::from_config(&WorkerConfig::default());
        assert_eq!(p.max_retries, 5);
        assert_eq!(p.delay_for(4), Duration::from_secs(16));
        assert_eq!(p.delay_for(9), Duration::from_secs(16));
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_backoff() {
        let (_tx, mut rx) = watch::channel(false);
        let calls = Arc::new(AtomicU32::new(0));
        let started = Instant::now();

        let outcome = policy(5).run(&mut rx, failing_until(calls.clone(), 3)).await;

        assert_eq!(outcome, RetryOutcome::Succeeded { attempts: 3 });
        assert_eq!(started.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausts_budget() {
        let (_tx, mut rx) = watch::channel(false);
        let calls = Arc::new(AtomicU32::new(0));

        let outcome = policy(4).run(&mut rx, failing_until(calls.clone(), u32::MAX)).await;

        assert_eq!(outcome.attempts(), 5);
        assert!(matches!(outcome, RetryOutcome::Exhausted { ref last_error, .. } if last_error == "attempt 5 failed"));
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_zero_retries_single_attempt() {
        let (_tx, mut rx) = watch::channel(false);
        let calls = Arc::new(AtomicU32::new(0));
        let outcome = policy(0).run(&mut rx, failing_until(calls.clone(), 2)).await;
        assert!(!outcome.is_success());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_interrupts_backoff() {
        let (tx, mut rx) = watch::channel(false);
        let calls = Arc::new(AtomicU32::new(0));

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(1500)).await;
            tx.send_replace(true);
        });
        let outcome = policy(5).run(&mut rx, failing_until(calls.clone(), u32::MAX)).await;

        // Attempt 1 at t=0, attempt 2 at t=1s, shutdown during the 2s sleep.
        assert!(matches!(outcome, RetryOutcome::Interrupted { attempts: 2, .. }));
    }
}
