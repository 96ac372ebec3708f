//! Sanitizer task output from CloudWatch Logs

use anyhow::{Context, Result};
use tracing::debug;

use super::context::{AwsContext, FromAwsContext};
use super::error::{is_not_found, is_retryable};
use super::retry::send_with_retry;

/// Upper bound on pages read from one stream; sanitizer output is short
const MAX_PAGES: usize = 50;

#[derive(Clone)]
pub struct LogReader {
    client: aws_sdk_cloudwatchlogs::Client,
}

impl FromAwsContext for LogReader {
    fn from_context(ctx: &AwsContext) -> Self {
        Self {
            client: ctx.logs_client(),
        }
    }
}

impl LogReader {
    /// All lines of a stream, oldest first
    ///
    /// A stream that does not exist yet (the task never started) reads as
    /// empty.
    pub async fn read_stream(&self, group: &str, stream: &str) -> Result<Vec<String>> {
        let mut lines = Vec::new();
        let mut token: Option<String> = None;

        for _ in 0..MAX_PAGES {
            let result = send_with_retry(
                "GetLogEvents",
                || async {
                    self.client
                        .get_log_events()
                        .log_group_name(group)
                        .log_stream_name(stream)
                        .start_from_head(true)
                        .set_next_token(token.clone())
                        .send()
                        .await
                        .with_context(|| format!("Failed to read log stream {group}/{stream}"))
                },
                is_retryable,
            )
            .await;

            let page = match result {
                Ok(page) => page,
                Err(e) if is_not_found(&e) => {
                    debug!(group, stream, "Log stream does not exist");
                    break;
                }
                Err(e) => return Err(e),
            };

            lines.extend(
                page.events()
                    .iter()
                    .filter_map(|e| e.message())
                    .flat_map(str::lines)
                    .map(str::to_string),
            );

            // The forward token repeats once the end of the stream is reached
            let next = page.next_forward_token().map(str::to_string);
            if next.is_none() || next == token {
                break;
            }
            token = next;
        }

        Ok(lines)
    }
}
