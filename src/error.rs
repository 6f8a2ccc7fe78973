use crate::storage::{CodecError, StoreError};
use apiplane_common::NameError;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Status;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("no storage destination registered for API group {0:?}")]
    UnknownGroup(String),

    #[error("group version {group_version} is already installed")]
    AlreadyInstalled { group_version: String },

    #[error("{kind} {name:?} already exists")]
    AlreadyExists { kind: String, name: String },

    #[error("{kind} {name:?} not found")]
    NotFound { kind: String, name: String },

    #[error("operation cannot be fulfilled on {kind} {name:?}: {message}")]
    Conflict {
        kind: String,
        name: String,
        message: String,
    },

    #[error("teardown of {resource} left {} failure(s): {}", .failures.len(), .failures.join("; "))]
    PartialTeardownFailure {
        resource: String,
        failures: Vec<String>,
    },

    #[error("storage unavailable: {0}")]
    StoreUnavailable(String),

    #[error("request did not complete within {0}s")]
    Timeout(u64),

    #[error("encoding error: {0}")]
    EncodingError(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("invalid: {0}")]
    Invalid(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("method {method} is not allowed on {path}")]
    MethodNotAllowed { method: String, path: String },

    #[error("resource type {0} is being removed")]
    Removing(String),

    #[error("Metrics error: {0}")]
    MetricsError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ApiError>;

impl ApiError {
    pub fn not_found(kind: impl Into<String>, name: impl Into<String>) -> Self {
        ApiError::NotFound {
            kind: kind.into(),
            name: name.into(),
        }
    }

    pub fn already_exists(kind: impl Into<String>, name: impl Into<String>) -> Self {
        ApiError::AlreadyExists {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Map a store failure on a named object into the API taxonomy
    pub fn from_store(err: StoreError, kind: &str, name: &str) -> Self {
        match err {
            StoreError::NotFound { .. } => ApiError::not_found(kind, name),
            StoreError::AlreadyExists { .. } => ApiError::already_exists(kind, name),
            StoreError::Conflict { expected, actual, .. } => ApiError::Conflict {
                kind: kind.to_string(),
                name: name.to_string(),
                message: format!(
                    "resource version {} does not match current {}",
                    expected, actual
                ),
            },
            other => other.into(),
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            ApiError::BadRequest(_) => 400,
            ApiError::Forbidden(_) => 403,
            ApiError::NotFound { .. } => 404,
            ApiError::MethodNotAllowed { .. } => 405,
            ApiError::AlreadyInstalled { .. }
            | ApiError::AlreadyExists { .. }
            | ApiError::Conflict { .. } => 409,
            ApiError::Invalid(_) => 422,
            ApiError::StoreUnavailable(_) | ApiError::Removing(_) => 503,
            ApiError::Timeout(_) => 504,
            ApiError::UnknownGroup(_)
            | ApiError::PartialTeardownFailure { .. }
            | ApiError::EncodingError(_)
            | ApiError::MetricsError(_)
            | ApiError::ConfigError(_)
            | ApiError::Internal(_)
            | ApiError::IoError(_) => 500,
        }
    }

    /// Machine-readable reason, following the Kubernetes `StatusReason` values
    pub fn reason(&self) -> &'static str {
        match self {
            ApiError::BadRequest(_) => "BadRequest",
            ApiError::Forbidden(_) => "Forbidden",
            ApiError::NotFound { .. } => "NotFound",
            ApiError::MethodNotAllowed { .. } => "MethodNotAllowed",
            ApiError::AlreadyInstalled { .. } | ApiError::AlreadyExists { .. } => "AlreadyExists",
            ApiError::Conflict { .. } => "Conflict",
            ApiError::Invalid(_) => "Invalid",
            ApiError::StoreUnavailable(_) | ApiError::Removing(_) => "ServiceUnavailable",
            ApiError::Timeout(_) => "Timeout",
            _ => "InternalError",
        }
    }

    pub fn to_status(&self) -> Status {
        Status {
            code: Some(i32::from(self.status_code())),
            message: Some(self.to_string()),
            reason: Some(self.reason().to_string()),
            status: Some("Failure".to_string()),
            ..Default::default()
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { key } => ApiError::not_found("key", key),
            StoreError::AlreadyExists { key } => ApiError::already_exists("key", key),
            StoreError::Conflict {
                key,
                expected,
                actual,
            } => ApiError::Conflict {
                kind: "key".to_string(),
                name: key,
                message: format!(
                    "resource version {} does not match current {}",
                    expected, actual
                ),
            },
            StoreError::Unavailable(msg) => ApiError::StoreUnavailable(msg),
        }
    }
}

impl From<CodecError> for ApiError {
    fn from(err: CodecError) -> Self {
        ApiError::EncodingError(err.to_string())
    }
}

impl From<NameError> for ApiError {
    fn from(err: NameError) -> Self {
        ApiError::Invalid(err.to_string())
    }
}

impl From<prometheus::Error> for ApiError {
    fn from(err: prometheus::Error) -> Self {
        ApiError::MetricsError(err.to_string())
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self {
        ApiError::EncodingError(err.to_string())
    }
}
