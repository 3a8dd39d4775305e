//! Error handling for the Vigil camserver

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Error types
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Unknown camera or subscription
    #[error("Not found: {0}")]
    NotFound(String),

    /// Detector RPC unreachable or unhealthy
    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    /// RPC response or viewer write exceeded its deadline
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Mode / detector-ordering validation failure
    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    /// gRPC status returned by a detector service
    #[error("RPC error: {0}")]
    Rpc(#[from] tonic::Status),

    /// gRPC channel setup error
    #[error("Transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    /// JPEG decode/encode error
    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Stable error code used in API responses and logs
    pub fn code(&self) -> &'static str {
        match self {
            Error::NotFound(_) => "NOT_FOUND",
            Error::ServiceUnavailable(_) => "SERVICE_UNAVAILABLE",
            Error::Timeout(_) => "TIMEOUT",
            Error::InvalidConfig(_) => "INVALID_CONFIG",
            Error::Rpc(_) => "RPC_ERROR",
            Error::Transport(_) => "TRANSPORT_ERROR",
            Error::Image(_) => "IMAGE_ERROR",
            Error::Serialization(_) => "SERIALIZATION_ERROR",
            Error::Http(_) => "HTTP_ERROR",
            Error::Io(_) => "IO_ERROR",
            Error::Internal(_) => "INTERNAL_ERROR",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::InvalidConfig(_) => StatusCode::BAD_REQUEST,
            Error::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Error::Rpc(_) | Error::Transport(_) | Error::Http(_) => StatusCode::BAD_GATEWAY,
            Error::Image(_) | Error::Serialization(_) | Error::Io(_) | Error::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status();
        let error_code = self.code();
        let message = self.to_string();

        tracing::error!(
            status = %status,
            error_code = %error_code,
            message = %message,
            "Request error"
        );

        let body = Json(json!({
            "error_code": error_code,
            "message": message
        }));

        (status, body).into_response()
    }
}
