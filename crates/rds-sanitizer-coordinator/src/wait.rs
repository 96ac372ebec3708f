//! Resource waiting with exponential backoff and cancellation support.
//!
//! Every asynchronous control-plane transition (snapshot creation, restore,
//! credential propagation, deletion, sanitizer task completion) is awaited
//! through [`poll_until`], so they all share the same backoff, timeout and
//! cancellation behavior.

use backon::{BackoffBuilder, ExponentialBuilder};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Configuration for resource waiting with exponential backoff.
#[derive(Debug, Clone)]
pub struct WaitConfig {
    /// Initial delay between checks
    pub initial_delay: Duration,
    /// Maximum delay between checks (cap for exponential growth)
    pub max_delay: Duration,
    /// Maximum total time to wait before timeout
    pub timeout: Duration,
    /// Whether to randomize delays so concurrent runs spread their polls
    pub jitter: bool,
}

impl Default for WaitConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(60),
            timeout: Duration::from_secs(3600),
            jitter: true,
        }
    }
}

impl WaitConfig {
    /// Same intervals with a different bound
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        Self {
            timeout,
            ..self.clone()
        }
    }
}

/// Why a wait ended without the condition being met
#[derive(Debug, Error)]
pub enum WaitError<E> {
    #[error("timed out waiting for {resource} after {elapsed:?} ({attempts} attempts)")]
    Timeout {
        resource: String,
        elapsed: Duration,
        attempts: u32,
    },

    #[error("wait for {0} cancelled")]
    Cancelled(String),

    /// The check itself failed; the wait is abandoned
    #[error(transparent)]
    Check(E),
}

/// Poll `check` until it yields a value.
///
/// `Ok(Some(v))` ends the wait, `Ok(None)` schedules another check after
/// the next backoff delay, `Err` abandons the wait. Cancellation is checked
/// before every attempt and during every sleep; the timeout is checked
/// before every attempt, and a sleep never extends past it.
pub async fn poll_until<T, E, F, Fut>(
    config: &WaitConfig,
    cancel: Option<&CancellationToken>,
    mut check: F,
    resource_name: &str,
) -> Result<T, WaitError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>, E>>,
    E: std::fmt::Debug,
{
    let start = Instant::now();
    let mut attempts = 0u32;

    let mut builder = ExponentialBuilder::default()
        .with_min_delay(config.initial_delay)
        .with_max_delay(config.max_delay)
        .with_factor(2.0);
    if config.jitter {
        builder = builder.with_jitter();
    }
    let mut delays = builder.build();

    loop {
        attempts += 1;

        if cancel.is_some_and(|token| token.is_cancelled()) {
            return Err(WaitError::Cancelled(resource_name.to_string()));
        }

        let elapsed = start.elapsed();
        if elapsed >= config.timeout {
            return Err(WaitError::Timeout {
                resource: resource_name.to_string(),
                elapsed,
                attempts,
            });
        }

        match check().await {
            Ok(Some(value)) => {
                debug!(resource = %resource_name, attempts, "Resource ready");
                return Ok(value);
            }
            Ok(None) => {
                let remaining = config.timeout.saturating_sub(start.elapsed());
                let delay = delays
                    .next()
                    .unwrap_or(config.max_delay)
                    .min(remaining);
                debug!(
                    resource = %resource_name,
                    attempt = attempts,
                    delay_ms = delay.as_millis(),
                    "Resource not ready, retrying"
                );

                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = async {
                        match cancel {
                            Some(token) => token.cancelled().await,
                            None => std::future::pending::<()>().await,
                        }
                    } => {
                        return Err(WaitError::Cancelled(resource_name.to_string()));
                    }
                }
            }
            Err(e) => {
                warn!(resource = %resource_name, error = ?e, "Resource check failed");
                return Err(WaitError::Check(e));
            }
        }
    }
}

/// Wait for a boolean condition; see [`poll_until`].
pub async fn wait_for_resource<E, F, Fut>(
    config: &WaitConfig,
    cancel: Option<&CancellationToken>,
    mut check: F,
    resource_name: &str,
) -> Result<(), WaitError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool, E>>,
    E: std::fmt::Debug,
{
    poll_until(
        config,
        cancel,
        || {
            let ready = check();
            async move { ready.await.map(|ready| ready.then_some(())) }
        },
        resource_name,
    )
    .await
}
