use thiserror::Error;

/// Message shown to users in place of internal error details.
pub const INTERNAL_ERROR_MESSAGE: &str = "an internal error occurred";

/// Workflow-visible error codes raised by the engine itself.
pub mod codes {
    /// Instance cancelled through the API.
    pub const CANCELLED_API: &str = "direktiv.cancels.api";
    /// Child cancelled because its parent failed or was cancelled.
    pub const CANCELLED_PARENT: &str = "direktiv.cancels.parent";
    /// Soft (interrupt) deadline reached.
    pub const SOFT_TIMEOUT: &str = "direktiv.cancels.timeout.soft";
    /// Hard (kill) deadline reached.
    pub const HARD_TIMEOUT: &str = "direktiv.cancels.timeout.hard";
    /// A retry policy ran out of attempts.
    pub const RETRIES_EXCEEDED: &str = "direktiv.retries.exceeded";
    /// Every branch of an OR-mode parallel state failed.
    pub const ALL_BRANCHES_FAILED: &str = "direktiv.branches.allFailed";
    /// A transform did not produce a single object.
    pub const NOT_OBJECT: &str = "direktiv.jq.notObject";
    /// An expression could not be compiled or evaluated.
    pub const BAD_EXPRESSION: &str = "direktiv.jq.badCommand";
    /// A validate state rejected its subject.
    pub const SCHEMA_FAILED: &str = "direktiv.schema.failed";
    /// A transition names a state that does not exist.
    pub const UNKNOWN_STATE: &str = "direktiv.workflow.unknownState";
    /// A foreach array expression did not produce an array.
    pub const FOREACH_INPUT: &str = "direktiv.foreach.input";
    /// An action reported a failure without an error code.
    pub const ACTION_CRASHED: &str = "direktiv.action.crashed";
    /// A function request could not be handed to the invoker.
    pub const DISPATCH_FAILED: &str = "direktiv.action.dispatchFailed";
    /// A subflow could not be resolved.
    pub const SUBFLOW_NOT_FOUND: &str = "direktiv.subflow.notExist";
    /// A variable could not be encoded or decoded.
    pub const VARIABLE_ENCODING: &str = "direktiv.var.encoding";
    /// A duration string is not valid ISO-8601.
    pub const BAD_DURATION: &str = "direktiv.duration.invalid";
    /// Code recorded on instances that crashed on an internal error.
    pub const INTERNAL: &str = "direktiv.internal";
}

/// Core error type for direktiv operations.
#[derive(Error, Debug)]
pub enum DirektivError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("SQL error: {0}")]
    Sql(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Cluster error: {0}")]
    Cluster(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Workflow-visible error that error catchers and retry policies may handle.
    #[error("{code}: {message}")]
    Catchable { code: String, message: String },

    /// Workflow-visible error that always fails the instance.
    #[error("{code}: {message}")]
    Uncatchable { code: String, message: String },
}

impl DirektivError {
    /// Create a catchable error.
    pub fn catchable(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Catchable {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Create an uncatchable error.
    pub fn uncatchable(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Uncatchable {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Whether error catchers may handle this error.
    pub fn is_catchable(&self) -> bool {
        matches!(self, Self::Catchable { .. })
    }

    /// Whether this is an engine or infrastructure fault.
    pub fn is_internal(&self) -> bool {
        !matches!(self, Self::Catchable { .. } | Self::Uncatchable { .. })
    }

    /// Whether the operation may succeed if attempted again later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }

    /// Workflow-visible error code, if any.
    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Catchable { code, .. } | Self::Uncatchable { code, .. } => Some(code),
            _ => None,
        }
    }

    /// Message suitable for users and log streams.
    pub fn public_message(&self) -> String {
        match self {
            Self::Catchable { message, .. } | Self::Uncatchable { message, .. } => {
                message.clone()
            }
            _ => INTERNAL_ERROR_MESSAGE.to_string(),
        }
    }
}

impl From<serde_json::Error> for DirektivError {
    fn from(e: serde_json::Error) -> Self {
        DirektivError::Serialization(e.to_string())
    }
}

impl From<serde_yaml::Error> for DirektivError {
    fn from(e: serde_yaml::Error) -> Self {
        DirektivError::Serialization(e.to_string())
    }
}

/// Result type alias using DirektivError.
pub type Result<T> = std::result::Result<T, DirektivError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let caught = DirektivError::catchable("my.code", "boom");
        assert!(caught.is_catchable());
        assert!(!caught.is_internal());
        assert_eq!(caught.code(), Some("my.code"));

        let fatal = DirektivError::uncatchable(codes::CANCELLED_API, "cancelled");
        assert!(!fatal.is_catchable());
        assert!(!fatal.is_internal());

        let internal = DirektivError::internal("corrupt memory");
        assert!(internal.is_internal());
        assert_eq!(internal.code(), None);
        assert_eq!(internal.public_message(), INTERNAL_ERROR_MESSAGE);
    }

    #[test]
    fn test_timeout_is_retryable() {
        assert!(DirektivError::Timeout("lock".into()).is_retryable());
        assert!(!DirektivError::Database("down".into()).is_retryable());
    }
}
