//! Error types for pipeflow.
//!
//! Every error carries a machine-readable code so API layers and callers
//! can branch without parsing messages.

use thiserror::Error;

/// Result type alias for pipeflow operations.
pub type Result<T> = std::result::Result<T, Error>;

/// pipeflow error kinds.
///
/// Validation errors are surfaced synchronously to the caller before any run
/// record exists; errors after persistence are stored on the run record and
/// move the run to `failed`.
#[derive(Error, Debug)]
pub enum Error {
    #[error("malformed yaml: {0}")]
    MalformedYaml(String),

    #[error("{0}")]
    InvalidNamePattern(String),

    #[error("{0}")]
    InvalidParamType(String),

    #[error("{0}")]
    UnsupportedSysParam(String),

    #[error("{0}")]
    InvalidCrossRef(String),

    #[error("{0}")]
    CycleDetected(String),

    #[error("{0}")]
    Validation(String),

    #[error("access denied: {0}")]
    AccessDenied(String),

    #[error("run not found: {0}")]
    RunNotFound(String),

    #[error("action not allowed: {0}")]
    ActionNotAllowed(String),

    #[error("io operation failure: {0}")]
    IoOperationFailure(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Stable error code for programmatic consumers.
    pub fn code(&self) -> &'static str {
        match self {
            Error::MalformedYaml(_) => "MALFORMED_YAML",
            Error::InvalidNamePattern(_) => "INVALID_NAME_PATTERN",
            Error::InvalidParamType(_) => "INVALID_PARAM_TYPE",
            Error::UnsupportedSysParam(_) => "UNSUPPORTED_SYS_PARAM",
            Error::InvalidCrossRef(_) => "INVALID_CROSS_REF",
            Error::CycleDetected(_) => "CYCLE_DETECTED",
            Error::Validation(_) => "VALIDATION_ERROR",
            Error::AccessDenied(_) => "ACCESS_DENIED",
            Error::RunNotFound(_) => "RUN_NOT_FOUND",
            Error::ActionNotAllowed(_) => "ACTION_NOT_ALLOWED",
            Error::IoOperationFailure(_) | Error::Io(_) => "IO_OPERATION_FAILURE",
            Error::Internal(_) | Error::Database(_) | Error::Json(_) => "INTERNAL_ERROR",
        }
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Error::MalformedYaml(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(Error::MalformedYaml("x".into()).code(), "MALFORMED_YAML");
        assert_eq!(Error::CycleDetected("x".into()).code(), "CYCLE_DETECTED");
        assert_eq!(Error::RunNotFound("run-1".into()).code(), "RUN_NOT_FOUND");
        assert_eq!(
            Error::ActionNotAllowed("stop".into()).code(),
            "ACTION_NOT_ALLOWED"
        );
    }

    #[test]
    fn test_yaml_error_maps_to_malformed() {
        let err: Error = serde_yaml::from_str::<i32>("[unclosed").unwrap_err().into();
        assert_eq!(err.code(), "MALFORMED_YAML");
    }
}
