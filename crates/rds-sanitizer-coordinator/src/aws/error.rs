//! AWS error classification
//!
//! SDK errors are reduced to the few categories the pipeline acts on: a
//! missing resource is a successful delete, an existing one acknowledges an
//! earlier create, throttling and service-side hiccups are retried, busy
//! resources are retried by callers that expect them. Codes come from
//! `ProvideErrorMetadata` where the operation error type is known, and from
//! the error's Debug output otherwise.

use aws_sdk_rds::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum AwsError {
    /// Deleted, or never created
    #[error("{resource_type} not found: {resource_id}")]
    NotFound {
        resource_type: &'static str,
        resource_id: String,
    },

    /// An earlier create with the same identifier was accepted
    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("request throttled")]
    Throttled,

    /// Timeouts, dropped connections and 5xx responses
    #[error("AWS temporarily unavailable: {0}")]
    Unavailable(String),

    /// The resource is busy (creating, modifying, backing up)
    #[error("invalid resource state: {0}")]
    InvalidState(String),

    #[error("AWS request failed ({}): {message}", .code.as_deref().unwrap_or("no code"))]
    Sdk {
        code: Option<String>,
        message: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Category {
    NotFound,
    AlreadyExists,
    Throttled,
    Unavailable,
    InvalidState,
    Other,
}

/// Codes the coordinator recognizes
///
/// `Fault` spellings precede their prefixes so that substring matching on
/// Debug output picks the whole code.
const KNOWN_CODES: &[(&str, Category)] = &[
    ("DBInstanceNotFoundFault", Category::NotFound),
    ("DBInstanceNotFound", Category::NotFound),
    ("DBSnapshotNotFoundFault", Category::NotFound),
    ("DBSnapshotNotFound", Category::NotFound),
    ("ResourceNotFoundException", Category::NotFound),
    ("DBInstanceAlreadyExistsFault", Category::AlreadyExists),
    ("DBInstanceAlreadyExists", Category::AlreadyExists),
    ("DBSnapshotAlreadyExistsFault", Category::AlreadyExists),
    ("DBSnapshotAlreadyExists", Category::AlreadyExists),
    ("ThrottlingException", Category::Throttled),
    ("Throttling", Category::Throttled),
    ("RequestLimitExceeded", Category::Throttled),
    ("ServiceUnavailable", Category::Unavailable),
    ("InternalFailure", Category::Unavailable),
    ("InternalError", Category::Unavailable),
    ("RequestTimeout", Category::Unavailable),
    ("DispatchFailure", Category::Unavailable),
    ("TimeoutError", Category::Unavailable),
    ("InvalidDBInstanceStateFault", Category::InvalidState),
    ("InvalidDBInstanceState", Category::InvalidState),
    ("InvalidDBSnapshotStateFault", Category::InvalidState),
    ("InvalidDBSnapshotState", Category::InvalidState),
    ("InsufficientDBInstanceCapacity", Category::Other),
    ("InstanceQuotaExceeded", Category::Other),
    ("SnapshotQuotaExceeded", Category::Other),
    ("StorageQuotaExceeded", Category::Other),
    ("SharedSnapshotQuotaExceeded", Category::Other),
    ("DBSubnetGroupNotFoundFault", Category::Other),
    ("KMSKeyNotAccessibleFault", Category::Other),
    ("ClusterNotFoundException", Category::Other),
];

fn category(code: &str) -> Category {
    KNOWN_CODES
        .iter()
        .find(|(known, _)| *known == code)
        .map_or(Category::Other, |(_, category)| *category)
}

impl AwsError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, AwsError::NotFound { .. })
    }

    /// Transient everywhere; busy resources are only retried by callers
    /// that expect them
    pub fn is_retryable(&self) -> bool {
        matches!(self, AwsError::Throttled | AwsError::Unavailable(_))
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, AwsError::AlreadyExists(_))
    }

    pub fn is_invalid_state(&self) -> bool {
        matches!(self, AwsError::InvalidState(_))
    }

    /// What an operator can do about this error, for codes where it is clear
    pub fn hint(&self) -> Option<&'static str> {
        let AwsError::Sdk {
            code: Some(code), ..
        } = self
        else {
            return None;
        };
        let hint = match code.as_str() {
            "InsufficientDBInstanceCapacity" => {
                "Pass --instance-class with a class available in this region, or retry later."
            }
            "InstanceQuotaExceeded" => "Request a DB instance quota increase in Service Quotas.",
            "SnapshotQuotaExceeded" => "Delete old manual snapshots or request a quota increase.",
            "StorageQuotaExceeded" => "Request a storage quota increase in Service Quotas.",
            "SharedSnapshotQuotaExceeded" => {
                "A manual snapshot can be shared with at most 20 accounts."
            }
            "DBSubnetGroupNotFoundFault" => "Check --db-subnet-group exists in this region.",
            "KMSKeyNotAccessibleFault" => {
                "The coordinator's role needs access to the source database's KMS key."
            }
            "ClusterNotFoundException" => "Check --cluster exists in this region.",
            _ => return None,
        };
        Some(hint)
    }
}

/// Classify an error code and message
pub fn classify_aws_error(code: Option<&str>, message: Option<&str>) -> AwsError {
    let message = message.unwrap_or_default().to_string();
    let Some(code) = code else {
        return AwsError::Sdk {
            code: None,
            message,
        };
    };

    match category(code) {
        Category::NotFound => AwsError::NotFound {
            resource_type: if code.starts_with("DBSnapshot") {
                "DB snapshot"
            } else if code.starts_with("DBInstance") {
                "DB instance"
            } else {
                "resource"
            },
            resource_id: message,
        },
        Category::AlreadyExists => AwsError::AlreadyExists(message),
        Category::Throttled => AwsError::Throttled,
        Category::Unavailable => AwsError::Unavailable(if message.is_empty() {
            code.to_string()
        } else {
            message
        }),
        Category::InvalidState => AwsError::InvalidState(message),
        Category::Other => AwsError::Sdk {
            code: Some(code.to_string()),
            message,
        },
    }
}

/// Classify a typed SDK error
///
/// Failures that never produced a parseable response, and 5xx responses
/// without a recognized code, are transient.
fn classify_sdk_error<E>(error: &SdkError<E>) -> AwsError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
{
    match error {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
            AwsError::Unavailable(DisplayErrorContext(error).to_string())
        }
        _ => {
            let server_error = error
                .raw_response()
                .is_some_and(|response| response.status().is_server_error());
            match classify_aws_error(error.code(), error.message()) {
                AwsError::Sdk { .. } if server_error => {
                    AwsError::Unavailable(DisplayErrorContext(error).to_string())
                }
                classified => classified,
            }
        }
    }
}

/// `cause` classified, if it is an SDK error of one of the given operation
/// error types
macro_rules! classify_sdk_cause {
    ($cause:expr => $($op:ty),+ $(,)?) => {{
        let mut found = None;
        $(
            if found.is_none() {
                if let Some(e) = $cause.downcast_ref::<SdkError<$op>>() {
                    found = Some(classify_sdk_error(e));
                }
            }
        )+
        found
    }};
}

/// Classify the first AWS error found in an `anyhow` chain
///
/// An [`AwsError`] placed in the chain directly is taken as is.
pub fn classify_anyhow_error(error: &anyhow::Error) -> AwsError {
    use aws_sdk_cloudwatchlogs::operation::get_log_events::GetLogEventsError;
    use aws_sdk_ecs::operation::{
        describe_tasks::DescribeTasksError, run_task::RunTaskError, stop_task::StopTaskError,
    };
    use aws_sdk_rds::operation as rds;

    for cause in error.chain() {
        if let Some(e) = cause.downcast_ref::<AwsError>() {
            return e.clone();
        }
        let classified = classify_sdk_cause!(cause =>
            rds::describe_db_instances::DescribeDBInstancesError,
            rds::describe_db_snapshots::DescribeDBSnapshotsError,
            rds::create_db_snapshot::CreateDBSnapshotError,
            rds::restore_db_instance_from_db_snapshot::RestoreDBInstanceFromDBSnapshotError,
            rds::modify_db_instance::ModifyDBInstanceError,
            rds::modify_db_snapshot_attribute::ModifyDBSnapshotAttributeError,
            rds::delete_db_instance::DeleteDBInstanceError,
            rds::delete_db_snapshot::DeleteDBSnapshotError,
            RunTaskError,
            DescribeTasksError,
            StopTaskError,
            GetLogEventsError,
        );
        if let Some(classified) = classified {
            return classified;
        }
    }

    let debug = format!("{error:?}");
    match code_in_debug_output(&debug) {
        Some(code) => classify_aws_error(Some(&code), Some(&error.to_string())),
        None => AwsError::Sdk {
            code: None,
            message: error.to_string(),
        },
    }
}

pub fn is_not_found(error: &anyhow::Error) -> bool {
    classify_anyhow_error(error).is_not_found()
}

pub fn is_retryable(error: &anyhow::Error) -> bool {
    classify_anyhow_error(error).is_retryable()
}

/// A known code mentioned anywhere in `debug`, else the value of a
/// `code: Some("...")` field
fn code_in_debug_output(debug: &str) -> Option<String> {
    if let Some((code, _)) = KNOWN_CODES.iter().find(|(code, _)| debug.contains(code)) {
        return Some((*code).to_string());
    }

    const FIELD: &str = "code: Some(\"";
    let start = debug.find(FIELD)? + FIELD.len();
    let len = debug[start..].find('"')?;
    Some(debug[start..start + len].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classify(code: &str) -> AwsError {
        classify_aws_error(Some(code), Some("prod-db-0a1b2c3d4e"))
    }

    #[test]
    fn test_categories() {
        assert!(matches!(
            classify("DBSnapshotNotFound"),
            AwsError::NotFound {
                resource_type: "DB snapshot",
                ..
            }
        ));
        assert!(classify("DBInstanceNotFoundFault").is_not_found());
        assert!(classify("DBInstanceAlreadyExists").is_already_exists());
        assert!(classify("ThrottlingException").is_retryable());
        assert!(classify("RequestLimitExceeded").is_retryable());

        let busy = classify("InvalidDBInstanceState");
        assert!(busy.is_invalid_state());
        assert!(!busy.is_retryable());
    }

    #[test]
    fn test_service_side_failures_are_transient() {
        for code in ["ServiceUnavailable", "InternalFailure", "InternalError", "RequestTimeout"] {
            let classified = classify(code);
            assert!(
                matches!(classified, AwsError::Unavailable(_)),
                "{code} classified as {classified:?}"
            );
            assert!(classified.is_retryable(), "{code} should be retried");
        }
    }

    #[test]
    fn test_sdk_timeout_is_transient() {
        use aws_sdk_ecs::operation::describe_tasks::DescribeTasksError;
        use aws_sdk_rds::operation::describe_db_instances::DescribeDBInstancesError;

        let rds: SdkError<DescribeDBInstancesError> =
            SdkError::timeout_error("operation timed out after 30s");
        let err = anyhow::Error::new(rds).context("Failed to describe DB instance prod-db");
        assert!(matches!(classify_anyhow_error(&err), AwsError::Unavailable(_)));
        assert!(is_retryable(&err));

        let ecs: SdkError<DescribeTasksError> = SdkError::timeout_error("read timed out");
        assert!(is_retryable(&anyhow::Error::new(ecs)));
    }

    #[test]
    fn test_dispatch_failure_in_debug_output_is_transient() {
        let err = anyhow::anyhow!(
            "DispatchFailure(DispatchFailure {{ source: ConnectorError {{ kind: Io }} }})"
        );
        assert!(is_retryable(&err));
        assert!(!is_retryable(&anyhow::anyhow!("AccessDenied: not authorized")));
    }

    #[test]
    fn test_unknown_and_missing_codes() {
        assert!(matches!(
            classify("SomeNewError"),
            AwsError::Sdk { code: Some(c), .. } if c == "SomeNewError"
        ));
        assert!(matches!(
            classify_aws_error(None, Some("something failed")),
            AwsError::Sdk { code: None, .. }
        ));
    }

    #[test]
    fn test_typed_error_in_chain_wins() {
        let err = anyhow::Error::new(AwsError::NotFound {
            resource_type: "DB instance",
            resource_id: "orders-abc".to_string(),
        })
        .context("Failed to delete instance");
        assert!(is_not_found(&err));

        let throttled = anyhow::Error::new(AwsError::Throttled).context("describe");
        assert!(is_retryable(&throttled));
    }

    #[test]
    fn test_code_from_debug_output() {
        let fault = r#"ServiceError { source: DBInstanceNotFoundFault { message: "gone" } }"#;
        assert_eq!(
            code_in_debug_output(fault).as_deref(),
            Some("DBInstanceNotFoundFault")
        );

        let field = r#"ErrorMetadata { code: Some("AccessDenied"), message: "no" }"#;
        assert_eq!(code_in_debug_output(field).as_deref(), Some("AccessDenied"));

        assert!(code_in_debug_output("connection refused").is_none());
    }

    #[test]
    fn test_every_known_code_is_found_in_debug_output() {
        for (code, _) in KNOWN_CODES {
            let debug = format!("ServiceError {{ source: {code} {{ message: \"x\" }} }}");
            assert_eq!(code_in_debug_output(&debug).as_deref(), Some(*code));
        }
    }

    #[test]
    fn test_hints() {
        assert!(classify("KMSKeyNotAccessibleFault").hint().is_some());
        assert!(classify("SharedSnapshotQuotaExceeded").hint().is_some());
        assert!(classify("SomeNewError").hint().is_none());
        assert!(AwsError::Throttled.hint().is_none());
    }
}
