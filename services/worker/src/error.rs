//! Worker error taxonomy.
//!
//! Every failure that reaches the control plane is one of these variants.
//! Each carries a stable [`ErrorKind`] and status code plus a human-readable
//! message; backend transport errors are folded into `Unexpected`.

use connect_protocol::{ProtocolError, WorkerResponse};
use serde::Serialize;
use thiserror::Error;

use crate::k8s::KubeError;
use crate::resources::PoolError;
use crate::runtime::RuntimeError;

/// Stable classification of a worker failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    AlreadyExists,
    NotExist,
    NotStarted,
    QuotaExceeded,
    Unauthorized,
    InvalidParams,
    ImagePullFailed,
    NotSupported,
    Failed,
    Unexpected,
}

impl ErrorKind {
    /// Status code reported to the control plane.
    pub fn status_code(self) -> u16 {
        match self {
            ErrorKind::Unauthorized => 401,
            ErrorKind::InvalidParams => 452,
            ErrorKind::NotExist | ErrorKind::NotStarted => 453,
            ErrorKind::AlreadyExists => 454,
            ErrorKind::QuotaExceeded => 457,
            ErrorKind::NotSupported => 502,
            ErrorKind::ImagePullFailed => 503,
            ErrorKind::Failed | ErrorKind::Unexpected => 500,
        }
    }

    /// Canonical name, used in logs.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::AlreadyExists => "ALREADY_EXIST",
            ErrorKind::NotExist => "NOT_EXIST",
            ErrorKind::NotStarted => "NOT_STARTED",
            ErrorKind::QuotaExceeded => "QUOTA_EXCEED",
            ErrorKind::Unauthorized => "UNAUTHORIZED",
            ErrorKind::InvalidParams => "INVALID_PARAMS",
            ErrorKind::ImagePullFailed => "IMAGE_PULL_FAILED",
            ErrorKind::NotSupported => "NOT_SUPPORTED",
            ErrorKind::Failed => "FAILED",
            ErrorKind::Unexpected => "UNEXPECTED",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors returned by worker operations.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("{0}")]
    AlreadyExists(String),

    #[error("{0}")]
    NotExist(String),

    #[error("{0}")]
    NotStarted(String),

    #[error("{0}")]
    QuotaExceeded(String),

    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    InvalidParams(String),

    #[error("failed to pull image {image}: {message}")]
    ImagePullFailed { image: String, message: String },

    #[error("{0}")]
    NotSupported(String),

    /// The cluster rejected a mutation.
    #[error("{0}")]
    Failed(String),

    #[error("container runtime error: {0}")]
    Runtime(#[from] RuntimeError),

    #[error("cluster error: {0}")]
    Cluster(#[from] KubeError),

    #[error("{0}")]
    Unexpected(String),
}

impl WorkerError {
    /// Classification of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            WorkerError::AlreadyExists(_) => ErrorKind::AlreadyExists,
            WorkerError::NotExist(_) => ErrorKind::NotExist,
            WorkerError::NotStarted(_) => ErrorKind::NotStarted,
            WorkerError::QuotaExceeded(_) => ErrorKind::QuotaExceeded,
            WorkerError::Unauthorized(_) => ErrorKind::Unauthorized,
            WorkerError::InvalidParams(_) => ErrorKind::InvalidParams,
            WorkerError::ImagePullFailed { .. } => ErrorKind::ImagePullFailed,
            WorkerError::NotSupported(_) => ErrorKind::NotSupported,
            WorkerError::Failed(_) => ErrorKind::Failed,
            WorkerError::Runtime(_) | WorkerError::Cluster(_) | WorkerError::Unexpected(_) => {
                ErrorKind::Unexpected
            }
        }
    }

    /// Status code reported to the control plane.
    pub fn status_code(&self) -> u16 {
        self.kind().status_code()
    }

    /// Convert into the failure response shape.
    pub fn to_response(&self) -> WorkerResponse {
        WorkerResponse::failure(self.to_string(), self.status_code())
    }

    /// Shorthand for the ownership failure used across backends.
    pub fn unauthorized() -> Self {
        WorkerError::Unauthorized("Unauthorized Address.".to_string())
    }
}

impl From<PoolError> for WorkerError {
    fn from(err: PoolError) -> Self {
        WorkerError::QuotaExceeded(err.to_string())
    }
}

impl From<ProtocolError> for WorkerError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::UnknownRequestType(_) => {
                WorkerError::NotExist("Function Not Exist".to_string())
            }
            other => WorkerError::InvalidParams(other.to_string()),
        }
    }
}
