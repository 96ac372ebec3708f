//! Backoff for control-plane requests

use std::future::Future;
use std::time::Duration;

use anyhow::Result;
use backon::{ExponentialBuilder, Retryable};
use tracing::warn;

use super::error::{AwsError, classify_anyhow_error};

fn backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_secs(2))
        .with_max_delay(Duration::from_secs(30))
        .with_max_times(8)
        .with_jitter()
}

/// Run `request`, retrying while `retry_when` holds
pub(crate) async fn send_with_retry<T, F, Fut>(
    operation: &str,
    request: F,
    retry_when: fn(&anyhow::Error) -> bool,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    request
        .retry(backoff())
        .when(retry_when)
        .notify(|e, delay| {
            warn!(
                operation,
                delay = ?delay,
                error = %classify_anyhow_error(e),
                "Transient AWS error, retrying..."
            );
        })
        .await
}

/// A busy resource rejects modifications until it settles
pub(crate) fn is_retryable_modify_error(e: &anyhow::Error) -> bool {
    matches!(
        classify_anyhow_error(e),
        AwsError::Throttled | AwsError::InvalidState(_)
    )
}
