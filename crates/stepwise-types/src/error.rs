use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error name recorded for unrecoverable engine errors.
pub const FATAL_ERROR_NAME: &str = "WorkflowFatalError";
/// Error name recorded when a step closure or event wait exceeds its deadline.
pub const TIMEOUT_ERROR_NAME: &str = "WorkflowTimeoutError";
/// Error name recorded for storage or engine failures unrelated to user data.
pub const INTERNAL_ERROR_NAME: &str = "WorkflowInternalError";
/// Error name (and message prefix) that user code uses to opt out of retries.
pub const NON_RETRYABLE_ERROR_NAME: &str = "NonRetryableError";
/// Error name recorded when an instance is aborted mid-run.
pub const ABORTED_ERROR_NAME: &str = "WorkflowAbortedError";
/// Error name recorded for operations the engine does not implement.
pub const NOT_SUPPORTED_ERROR_NAME: &str = "WorkflowNotSupportedError";

/// Errors from repository operations (used by the storage ports in stepwise-core).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RepositoryError {
    #[error("database connection error")]
    Connection,

    #[error("query error: {0}")]
    Query(String),

    #[error("entity not found")]
    NotFound,

    #[error("conflict: {0}")]
    Conflict(String),
}

/// Serializable `{name, message}` form of an error.
///
/// This is what lands in log metadata and in the step error cache, and what
/// a replay turns back into a [`WorkflowError`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub name: String,
    pub message: String,
}

impl ErrorRecord {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ErrorRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

/// Error taxonomy of the workflow engine.
///
/// - **Fatal** / **InvalidStep**: unrecoverable, ends the instance. `InvalidStep`
///   is caused by user code (bad step name, step limit) and is not escalated.
/// - **Timeout**: a closure or event wait exceeded its deadline.
/// - **Internal** / **Storage**: failures unrelated to user data.
/// - **NonRetryable**: user-signalled, stops the retry loop immediately.
/// - **User**: ordinary user error, retried up to the configured limit.
#[derive(Debug, Clone, Error)]
pub enum WorkflowError {
    #[error("{0}")]
    Fatal(String),

    #[error("{0}")]
    InvalidStep(String),

    #[error("{0}")]
    Timeout(String),

    #[error("{0}")]
    Internal(String),

    #[error("{0}")]
    NonRetryable(String),

    #[error("{name}: {message}")]
    User { name: String, message: String },

    #[error("instance aborted: {0}")]
    Aborted(String),

    #[error("operation not supported: {0}")]
    NotSupported(String),

    #[error("storage error: {0}")]
    Storage(#[from] RepositoryError),
}

impl WorkflowError {
    /// Ordinary user error with the generic `Error` name.
    pub fn user(message: impl Into<String>) -> Self {
        Self::User {
            name: "Error".to_string(),
            message: message.into(),
        }
    }

    /// User error with an explicit name.
    pub fn named(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::User {
            name: name.into(),
            message: message.into(),
        }
    }

    /// Error that bypasses the retry loop.
    pub fn non_retryable(message: impl Into<String>) -> Self {
        Self::NonRetryable(message.into())
    }

    /// Stable error name, as recorded in the log.
    pub fn name(&self) -> &str {
        match self {
            Self::Fatal(_) | Self::InvalidStep(_) => FATAL_ERROR_NAME,
            Self::Timeout(_) => TIMEOUT_ERROR_NAME,
            Self::Internal(_) | Self::Storage(_) => INTERNAL_ERROR_NAME,
            Self::NonRetryable(_) => NON_RETRYABLE_ERROR_NAME,
            Self::User { name, .. } => name,
            Self::Aborted(_) => ABORTED_ERROR_NAME,
            Self::NotSupported(_) => NOT_SUPPORTED_ERROR_NAME,
        }
    }

    /// Message without the name prefix.
    pub fn message(&self) -> String {
        match self {
            Self::Fatal(m)
            | Self::InvalidStep(m)
            | Self::Timeout(m)
            | Self::Internal(m)
            | Self::NonRetryable(m)
            | Self::Aborted(m)
            | Self::NotSupported(m) => m.clone(),
            Self::User { message, .. } => message.clone(),
            Self::Storage(e) => e.to_string(),
        }
    }

    /// Whether this error must skip the retry loop.
    ///
    /// Matches the `NonRetryableError` name or a message carrying that prefix.
    pub fn is_non_retryable(&self) -> bool {
        match self {
            Self::NonRetryable(_) => true,
            Self::User { name, message } => {
                name == NON_RETRYABLE_ERROR_NAME || message.starts_with(NON_RETRYABLE_ERROR_NAME)
            }
            _ => false,
        }
    }

    /// Whether the error was caused by user code rather than the engine.
    ///
    /// User errors are never escalated to operational alerting.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidStep(_) | Self::NonRetryable(_) | Self::User { .. } | Self::Timeout(_)
        )
    }

    /// Convert to the serializable record stored in logs and step caches.
    pub fn to_record(&self) -> ErrorRecord {
        ErrorRecord::new(self.name(), self.message())
    }

    /// Rebuild an error from a stored record.
    pub fn from_record(record: ErrorRecord) -> Self {
        match record.name.as_str() {
            FATAL_ERROR_NAME => Self::Fatal(record.message),
            TIMEOUT_ERROR_NAME => Self::Timeout(record.message),
            INTERNAL_ERROR_NAME => Self::Internal(record.message),
            NON_RETRYABLE_ERROR_NAME => Self::NonRetryable(record.message),
            ABORTED_ERROR_NAME => Self::Aborted(record.message),
            NOT_SUPPORTED_ERROR_NAME => Self::NotSupported(record.message),
            _ => Self::User {
                name: record.name,
                message: record.message,
            },
        }
    }
}

impl From<ErrorRecord> for WorkflowError {
    fn from(record: ErrorRecord) -> Self {
        Self::from_record(record)
    }
}
