use crate::delivery::DeliveryError;
use fast_store::model::KeyClass;
use fast_store::reader::FastStoreError;
use hyper::StatusCode;
use thiserror::Error;

/// Result type alias for ingest-router operations
pub type Result<T, E = IngestError> = std::result::Result<T, E>;

/// Errors surfaced by the ingestion pipeline.
///
/// Authorization failures are deliberately distinct from "not found" so that
/// clients can tell misconfiguration apart from credential problems.
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("malformed request: {0}")]
    Malformed(String),

    #[error("unknown event type: {0}")]
    UnknownEventType(String),

    #[error("no stream found for {0}")]
    StreamNotFound(String),

    #[error("domain {0} is claimed by more than one stream")]
    AmbiguousDomain(String),

    #[error("invalid write key")]
    InvalidWriteKey,

    #[error("this endpoint requires a {} write key", expected.as_str())]
    KeyClassMismatch { expected: KeyClass },

    /// Routing is impossible without the cache; there is no degraded mode.
    #[error("configuration cache unavailable: {0}")]
    CacheUnavailable(#[from] FastStoreError),

    #[error("event delivery failed: {0}")]
    DeliveryFailed(#[from] DeliveryError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl IngestError {
    pub fn status(&self) -> StatusCode {
        match self {
            IngestError::Malformed(_) => StatusCode::BAD_REQUEST,
            IngestError::UnknownEventType(_)
            | IngestError::StreamNotFound(_)
            | IngestError::AmbiguousDomain(_) => StatusCode::NOT_FOUND,
            IngestError::InvalidWriteKey => StatusCode::UNAUTHORIZED,
            IngestError::KeyClassMismatch { .. } => StatusCode::FORBIDDEN,
            IngestError::DeliveryFailed(_) => StatusCode::BAD_GATEWAY,
            IngestError::CacheUnavailable(_)
            | IngestError::Io(_)
            | IngestError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}
