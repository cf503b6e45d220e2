// SPDX-FileCopyrightText: © 2024 Technical University of Munich, Chair of Connected Mobility
// SPDX-License-Identifier: MIT

/// Errors returned by the deployment pipeline operations.
///
/// Each variant maps onto one of the status codes exposed to the management
/// API, see [`PipelineError::status_code`].
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PipelineError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("permission denied: {0}")]
    Authorization(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("concurrent modification: {0}")]
    Conflict(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("artifact store unavailable: {0}")]
    StoreUnavailable(String),

    /// The build itself failed, the payload is the error reported by the
    /// builder, unchanged.
    #[error("build failed: {0}")]
    Build(serde_json::Value),

    #[error("internal error: {0}")]
    Internal(String),
}

impl PipelineError {
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Validation(_) => 400,
            Self::Authorization(_) => 403,
            Self::NotFound(_) => 404,
            Self::Timeout(_) => 408,
            Self::Conflict(_) | Self::StoreUnavailable(_) | Self::Build(_) | Self::Internal(_) => 500,
        }
    }

    /// True if the error must never be retried by the pipeline itself.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Validation(_) | Self::Authorization(_) | Self::Build(_))
    }
}

/// Failures reported by an artifact store implementation.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StoreError {
    /// The operation may succeed if repeated, e.g., connection dropped.
    #[error("transient store failure: {0}")]
    Transient(String),

    #[error("store failure: {0}")]
    Permanent(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

impl From<StoreError> for PipelineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Transient(msg) => PipelineError::StoreUnavailable(msg),
            StoreError::Permanent(msg) => PipelineError::Internal(msg),
        }
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(err: serde_json::Error) -> Self {
        PipelineError::Internal(format!("serialization: {}", err))
    }
}

pub type PipelineResult<T> = Result<T, PipelineError>;
