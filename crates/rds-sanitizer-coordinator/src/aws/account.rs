//! AWS account identity and target account validation

use anyhow::{Context, Result};
use thiserror::Error;
use tracing::info;

use super::context::AwsContext;

/// Strongly-typed AWS account ID (12-digit string)
#[derive(Debug, Clone, PartialEq, Eq, Hash, derive_more::Display, derive_more::Deref)]
pub struct AccountId(String);

#[derive(Debug, Error, PartialEq, Eq)]
#[error("'{0}' is not a 12-digit AWS account id")]
pub struct InvalidAccountId(pub String);

impl AccountId {
    pub fn parse(s: &str) -> Result<Self, InvalidAccountId> {
        if s.len() == 12 && s.bytes().all(|b| b.is_ascii_digit()) {
            Ok(AccountId(s.to_string()))
        } else {
            Err(InvalidAccountId(s.to_string()))
        }
    }
}

/// Fetch the current AWS account ID via STS GetCallerIdentity
///
/// Requires no special permissions; used to validate credentials before a
/// run creates anything.
pub async fn get_current_account_id(aws: &AwsContext) -> Result<AccountId> {
    let identity = aws
        .sts_client()
        .get_caller_identity()
        .send()
        .await
        .context("Failed to get AWS caller identity - check credentials")?;

    let account = identity
        .account()
        .context("No account ID returned from STS GetCallerIdentity")?;

    info!(account_id = %account, "AWS account validated");

    Ok(AccountId(account.to_string()))
}
