//! Error taxonomy for the proxy.
//!
//! Every failure a caller can see is one of these variants. The HTTP status
//! and the `error` field of the JSON body are derived from the variant.

use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use ibkr_wire::WireError;

use crate::models::ApiResponse;

#[derive(Debug, Clone, thiserror::Error)]
pub enum ProxyError {
    #[error("Not connected to IB gateway")]
    NotConnected,

    #[error("Connection to IB gateway lost")]
    ConnectionLost,

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("IB gateway rejected request (code {code}): {message}")]
    UpstreamRejected { code: i32, message: String },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Method {0} not found")]
    UnsupportedMethod(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

impl ProxyError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::NotConnected | Self::ConnectionLost | Self::Connection(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            Self::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::UpstreamRejected { .. } | Self::Protocol(_) => StatusCode::BAD_GATEWAY,
            Self::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            Self::UnsupportedMethod(_) | Self::NotFound(_) => StatusCode::NOT_FOUND,
        }
    }

    /// Taxonomy name reported in the `error` field.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotConnected => "NotConnected",
            Self::ConnectionLost => "ConnectionLost",
            Self::Connection(_) => "ConnectionError",
            Self::Timeout(_) => "TimeoutError",
            Self::UpstreamRejected { .. } => "UpstreamRejected",
            Self::Protocol(_) => "ProtocolError",
            Self::InvalidArgument(_) => "InvalidArgument",
            Self::UnsupportedMethod(_) => "UnsupportedMethod",
            Self::NotFound(_) => "NotFound",
        }
    }

    /// Caller errors are final; everything else may succeed on a later try.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Self::InvalidArgument(_) | Self::NotFound(_) | Self::UnsupportedMethod(_)
        )
    }
}

impl From<WireError> for ProxyError {
    fn from(err: WireError) -> Self {
        match err {
            WireError::Disconnected(_) | WireError::Io(_) => Self::ConnectionLost,
            WireError::Connection(msg) => Self::Connection(msg),
            err @ (WireError::Redirect(_) | WireError::UnsupportedServerVersion { .. }) => {
                Self::Connection(err.to_string())
            }
            err @ (WireError::RequestNotSupported { .. }
            | WireError::Encoding(_)
            | WireError::Decoding(_)
            | WireError::Protocol(_)) => Self::Protocol(err.to_string()),
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = ApiResponse::error(self.to_string(), status.as_u16() as i32, self.kind());
        (status, Json(body)).into_response()
    }
}

pub type Result<T> = std::result::Result<T, ProxyError>;
