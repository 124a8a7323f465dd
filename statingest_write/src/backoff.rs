//! Bounded exponential backoff for backend calls.

use std::{future::Future, num::NonZeroUsize, time::Duration};

use thiserror::Error;
use tokio::time::Instant;
use tracing::warn;

/// Exponential backoff with a bounded number of attempts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffConfig {
    /// Total number of attempts, including the first one.
    pub max_attempts: NonZeroUsize,

    /// Sleep before the second attempt.
    pub init_backoff: Duration,

    /// Upper bound for any single sleep.
    pub max_backoff: Duration,

    /// Growth factor between consecutive sleeps.
    pub base: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            max_attempts: NonZeroUsize::new(3).expect("3 is non-zero"),
            init_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(1),
            base: 2.,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BackoffError<E>
where
    E: std::error::Error + 'static,
{
    #[error("{task_name} failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        task_name: &'static str,
        attempts: usize,
        source: E,
    },

    #[error("{task_name} gave up after {attempts} attempts, deadline exceeded: {source}")]
    DeadlineExceeded {
        task_name: &'static str,
        attempts: usize,
        source: E,
    },
}

impl<E> BackoffError<E>
where
    E: std::error::Error + 'static,
{
    pub fn attempts(&self) -> usize {
        match self {
            Self::RetriesExhausted { attempts, .. } | Self::DeadlineExceeded { attempts, .. } => {
                *attempts
            }
        }
    }

    pub fn into_source(self) -> E {
        match self {
            Self::RetriesExhausted { source, .. } | Self::DeadlineExceeded { source, .. } => {
                source
            }
        }
    }
}

/// Retry state for one operation.
///
/// The deadline is only checked between attempts; a call that has started always runs to
/// completion.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    config: BackoffConfig,
    deadline: Instant,
    next_backoff: Duration,
}

impl Backoff {
    pub fn new(config: &BackoffConfig, deadline: Instant) -> Self {
        Self {
            config: *config,
            deadline,
            next_backoff: config.init_backoff,
        }
    }

    /// Run `do_stuff` until it succeeds, attempts run out, or sleeping again would pass the
    /// deadline.
    pub async fn retry_all_errors<F, F1, T, E>(
        mut self,
        task_name: &'static str,
        mut do_stuff: F,
    ) -> Result<T, BackoffError<E>>
    where
        F: (FnMut() -> F1) + Send,
        F1: Future<Output = Result<T, E>> + Send,
        E: std::error::Error + Send + 'static,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let e = match do_stuff().await {
                Ok(v) => return Ok(v),
                Err(e) => e,
            };

            if attempt >= self.config.max_attempts.get() {
                return Err(BackoffError::RetriesExhausted {
                    task_name,
                    attempts: attempt,
                    source: e,
                });
            }

            let backoff = self.next();
            let wakeup = Instant::now().checked_add(backoff);
            if wakeup.is_none_or(|t| t >= self.deadline) {
                return Err(BackoffError::DeadlineExceeded {
                    task_name,
                    attempts: attempt,
                    source: e,
                });
            }

            warn!(
                error=%e,
                task_name,
                attempt,
                backoff_ms=backoff.as_millis() as u64,
                "request encountered non-fatal error, retrying",
            );
            tokio::time::sleep(backoff).await;
        }
    }

    fn next(&mut self) -> Duration {
        let current = self.next_backoff;
        let grown = current.as_secs_f64() * self.config.base.max(1.);
        self.next_backoff = Duration::try_from_secs_f64(grown)
            .map_or(self.config.max_backoff, |d| d.min(self.config.max_backoff));
        current.min(self.config.max_backoff)
    }
}
