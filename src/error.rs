use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};

use crate::filesystem::metadata::MetadataError;
use crate::filesystem::session::SessionState;

pub type TusResult<T> = Result<T, TusError>;

/// Everything the engine can refuse or fail with.
#[derive(Debug, thiserror::Error)]
pub enum TusError {
    #[error("invalid upload length: {0}")]
    InvalidLength(i64),

    #[error("upload length {length} exceeds the maximum of {max} bytes")]
    MaxSizeExceeded { length: u64, max: u64 },

    #[error("upload session not found: {0}")]
    NotFound(String),

    #[error("offset mismatch: server is at {expected}, chunk starts at {actual}")]
    OffsetMismatch { expected: u64, actual: u64 },

    #[error("chunk would end at {attempted}, past the declared length {declared}")]
    OverLength { declared: u64, attempted: u64 },

    #[error("upload session expired: {0}")]
    Expired(String),

    #[error("illegal session transition from {from:?} to {to:?}")]
    IllegalTransition { from: SessionState, to: SessionState },

    #[error("finalize failed: {0}")]
    FinalizeFailed(String),

    #[error("invalid upload metadata: {0}")]
    InvalidMetadata(#[from] MetadataError),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("session record error: {0}")]
    Persist(#[from] serde_json::Error),
}

impl TusError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidLength(_) => StatusCode::BAD_REQUEST,
            Self::MaxSizeExceeded { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::OffsetMismatch { .. } => StatusCode::CONFLICT,
            Self::OverLength { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Self::Expired(_) => StatusCode::GONE,
            Self::IllegalTransition { .. } => StatusCode::FORBIDDEN,
            Self::FinalizeFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::InvalidMetadata(_) => StatusCode::BAD_REQUEST,
            Self::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Persist(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for TusError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "tus request failed");
        } else {
            tracing::debug!(error = %self, "tus request rejected");
        }

        (status, self.to_string()).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_errors_map_to_tus_statuses() {
        assert_eq!(
            TusError::OffsetMismatch { expected: 10, actual: 0 }.status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(TusError::NotFound("x".into()).status_code(), StatusCode::NOT_FOUND);
        assert_eq!(TusError::Expired("x".into()).status_code(), StatusCode::GONE);
        assert_eq!(
            TusError::IllegalTransition {
                from: SessionState::Finalized,
                to: SessionState::Active
            }
            .status_code(),
            StatusCode::FORBIDDEN
        );
    }
}
