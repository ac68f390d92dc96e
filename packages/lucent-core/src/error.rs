//! API-facing error type.
//!
//! Pipeline modules define their own error enums (`QueueError`,
//! `DeframeError`, `FtlError`, `IngestError`); this module maps what the
//! HTTP surface can produce onto status codes and a JSON error body.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

/// Errors returned by the HTTP playback surface.
#[derive(Debug, Error)]
pub enum LucentError {
    /// The channel exists but has no attached stream (or never existed).
    #[error("channel offline: {0}")]
    ChannelOffline(String),

    /// The requested web chunk is no longer (or not yet) retained.
    #[error("chunk not found")]
    ChunkNotFound,

    /// The requested track rendition is not maintained in this mode.
    #[error("track not found")]
    TrackNotFound,

    /// Internal failure serving the request.
    #[error("internal error: {0}")]
    Internal(String),
}

impl LucentError {
    /// Machine-readable error code for API responses.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::ChannelOffline(_) => "channel_offline",
            Self::ChunkNotFound => "chunk_not_found",
            Self::TrackNotFound => "track_not_found",
            Self::Internal(_) => "internal_error",
        }
    }

    /// Maps the error to an HTTP status code.
    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::ChannelOffline(_) | Self::ChunkNotFound | Self::TrackNotFound => {
                StatusCode::NOT_FOUND
            }
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Convenient Result alias for API handlers.
pub type LucentResult<T> = Result<T, LucentError>;

#[derive(Serialize)]
struct ErrorResponse {
    error: &'static str,
    message: String,
    status: u16,
}

impl IntoResponse for LucentError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorResponse {
            error: self.code(),
            message: self.to_string(),
            status: status.as_u16(),
        };
        (status, Json(body)).into_response()
    }
}
