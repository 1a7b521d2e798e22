//! Typed errors for provider lifecycle operations and their HTTP mapping

use hyper::StatusCode;
use serde::Serialize;
use thiserror::Error;

/// Errors raised by provider lifecycle operations.
///
/// Every state conflict is a distinct variant so callers can react to the
/// specific transition that failed instead of parsing messages.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// The provider is still running its background initialization
    #[error("provider is initializing, try again later")]
    Initializing,

    /// No instance with that name is known
    #[error("no agent named {0}")]
    NotFound(String),

    /// An instance with that name already exists
    #[error("agent {0} already exists")]
    AlreadyExists(String),

    /// The instance is already running
    #[error("agent {0} is already running")]
    AlreadyRunning(String),

    /// The instance is not running
    #[error("no running agent named {0}")]
    NotRunning(String),

    /// Admission control rejected the start
    #[error("not enough free memory to start agent {0}")]
    NotEnoughFreeMemory(String),

    /// The username contains characters outside the allowed set
    #[error("invalid agent name {0:?}")]
    InvalidName(String),

    /// The backend (subprocess or container runtime) failed
    #[error("backend failure: {0}")]
    Backend(#[source] anyhow::Error),

    /// Filesystem access to the instance layout failed
    #[error("instance storage failure: {0}")]
    Storage(#[source] std::io::Error),
}

impl ProviderError {
    /// HTTP status carried by the control API for this error class
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProviderError::Initializing => StatusCode::SERVICE_UNAVAILABLE,
            ProviderError::NotFound(_) => StatusCode::NOT_FOUND,
            ProviderError::AlreadyExists(_) => StatusCode::CONFLICT,
            ProviderError::AlreadyRunning(_) => StatusCode::CONFLICT,
            ProviderError::NotRunning(_) => StatusCode::CONFLICT,
            ProviderError::NotEnoughFreeMemory(_) => StatusCode::CONFLICT,
            ProviderError::InvalidName(_) => StatusCode::BAD_REQUEST,
            ProviderError::Backend(_) => StatusCode::BAD_GATEWAY,
            ProviderError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable error code string for the JSON body and X-Agentgate-Error header
    pub fn code(&self) -> &'static str {
        match self {
            ProviderError::Initializing => "INITIALIZING",
            ProviderError::NotFound(_) => "NOT_FOUND",
            ProviderError::AlreadyExists(_) => "ALREADY_EXISTS",
            ProviderError::AlreadyRunning(_) => "ALREADY_RUNNING",
            ProviderError::NotRunning(_) => "NOT_RUNNING",
            ProviderError::NotEnoughFreeMemory(_) => "NOT_ENOUGH_FREE_MEMORY",
            ProviderError::InvalidName(_) => "INVALID_NAME",
            ProviderError::Backend(_) => "BACKEND_FAILURE",
            ProviderError::Storage(_) => "STORAGE_FAILURE",
        }
    }
}

impl From<std::io::Error> for ProviderError {
    fn from(err: std::io::Error) -> Self {
        ProviderError::Storage(err)
    }
}

/// JSON error body returned by the control API
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: &'static str,
    pub message: String,
    pub status: u16,
}

impl ErrorBody {
    pub fn from_error(err: &ProviderError) -> Self {
        Self {
            code: err.code(),
            message: err.to_string(),
            status: err.status_code().as_u16(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"{}","status":{}}}"#,
                self.code,
                self.message.replace('"', "\\\""),
                self.status
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(
            ProviderError::Initializing.status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ProviderError::NotFound("bob".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ProviderError::AlreadyExists("bob".into()).status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ProviderError::AlreadyRunning("bob".into()).status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ProviderError::NotRunning("bob".into()).status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ProviderError::NotEnoughFreeMemory("bob".into()).status_code(),
            StatusCode::CONFLICT
        );
    }

    #[test]
    fn test_conflicts_are_distinguishable() {
        assert_ne!(
            ProviderError::AlreadyRunning("a".into()).code(),
            ProviderError::NotRunning("a".into()).code()
        );
        assert_ne!(
            ProviderError::AlreadyExists("a".into()).code(),
            ProviderError::AlreadyRunning("a".into()).code()
        );
    }

    #[test]
    fn test_error_body_json() {
        let err = ProviderError::NotFound("alice".into());
        let json = ErrorBody::from_error(&err).to_json();

        assert!(json.contains("\"code\":\"NOT_FOUND\""));
        assert!(json.contains("alice"));
        assert!(json.contains("\"status\":404"));
    }
}
