//! Error taxonomy shared across the daemon's components.
//!
//! Kinds map onto HTTP statuses at the route layer; internal callers match
//! on the variant instead of inspecting strings.

use axum::http::StatusCode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("{0}")]
    Fatal(String),
}

impl RuntimeError {
    pub fn status(&self) -> StatusCode {
        match self {
            RuntimeError::NotFound(_) => StatusCode::NOT_FOUND,
            RuntimeError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            RuntimeError::PreconditionFailed(_) => StatusCode::CONFLICT,
            RuntimeError::BackendUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            RuntimeError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            RuntimeError::Transient(_) | RuntimeError::Fatal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_map_to_expected_statuses() {
        assert_eq!(
            RuntimeError::NotFound("session".into()).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            RuntimeError::InvalidInput("port 0".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            RuntimeError::PreconditionFailed("dirty worktree".into()).status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            RuntimeError::BackendUnavailable("docker".into()).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }
}
