use std::time::Duration;
use thiserror::Error;

/// The kind taxonomy from the error-handling design: classification, not type name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorErrorKind {
    Validation,
    Conflict,
    NotFound,
    TransientRemote,
    FatalRemote,
    Storage,
    Cancellation,
    Panic,
}

#[derive(Error, Debug, Clone)]
#[error("{kind:?}: {message}")]
pub struct OrchestratorError {
    pub kind: OrchestratorErrorKind,
    pub message: String,
}

impl OrchestratorError {
    pub fn new(kind: OrchestratorErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(OrchestratorErrorKind::Validation, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(OrchestratorErrorKind::NotFound, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(OrchestratorErrorKind::Conflict, message)
    }
}

/// Per-provider failure kind, mirroring the shape of an AI-provider client error enum.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProviderError {
    #[error("authentication error: {0}")]
    Authentication(String),

    #[error("rate limit exceeded: {details}")]
    RateLimitExceeded {
        details: String,
        retry_delay: Option<Duration>,
    },

    #[error("server error: {0}")]
    ServerError(String),

    #[error("network error: {0}")]
    NetworkError(String),

    #[error("request failed: {0}")]
    RequestFailed(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("unsupported operation: {0}")]
    NotImplemented(String),

    #[error("empty or unparseable response: {0}")]
    EmptyResponse(String),
}

impl ProviderError {
    /// 4xx (other than 429) and auth failures are not retryable; everything
    /// else transient (timeouts, network errors, 429, 5xx) is.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProviderError::RateLimitExceeded { .. }
                | ProviderError::ServerError(_)
                | ProviderError::NetworkError(_)
                | ProviderError::Timeout(_)
        )
    }

    pub fn telemetry_type(&self) -> &'static str {
        match self {
            ProviderError::Authentication(_) => "auth",
            ProviderError::RateLimitExceeded { .. } => "rate_limit",
            ProviderError::ServerError(_) => "server",
            ProviderError::NetworkError(_) => "network",
            ProviderError::RequestFailed(_) => "request",
            ProviderError::Timeout(_) => "timeout",
            ProviderError::NotImplemented(_) => "not_implemented",
            ProviderError::EmptyResponse(_) => "empty_response",
        }
    }
}

impl From<ProviderError> for OrchestratorErrorKind {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::Authentication(_) => OrchestratorErrorKind::FatalRemote,
            ProviderError::RateLimitExceeded { .. }
            | ProviderError::ServerError(_)
            | ProviderError::NetworkError(_)
            | ProviderError::Timeout(_) => OrchestratorErrorKind::TransientRemote,
            ProviderError::RequestFailed(_)
            | ProviderError::NotImplemented(_)
            | ProviderError::EmptyResponse(_) => OrchestratorErrorKind::FatalRemote,
        }
    }
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("sqlx error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<StoreError> for OrchestratorError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(m) => OrchestratorError::new(OrchestratorErrorKind::NotFound, m),
            StoreError::Conflict(m) => OrchestratorError::new(OrchestratorErrorKind::Conflict, m),
            other => OrchestratorError::new(OrchestratorErrorKind::Storage, other.to_string()),
        }
    }
}
