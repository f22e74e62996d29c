//! Error taxonomy for the request-processing engine.
//!
//! Every failure the core itself produces maps onto a small set of HTTP
//! statuses. Handlers and filters return [`ApiError`]; the filter chain is the
//! single place where errors (and panics) are translated into an error
//! response, so controllers never build status codes by hand.
//!
//! The user-visible body for every non-2xx/3xx response produced by the core
//! is `{"error":{"message": <str>, "parameter"?: <str>}}`.

use http::StatusCode;
use serde_json::{json, Value};
use thiserror::Error;

/// Errors produced while processing a request.
#[derive(Debug, Clone, Error)]
pub enum ApiError {
    /// Malformed request: bad or missing parameter, unparsable JSON body.
    #[error("{message}")]
    InvalidRequest {
        message: String,
        /// Name of the offending parameter, when one can be pointed at.
        parameter: Option<String>,
    },

    /// Authentication required or rejected.
    #[error("{0}")]
    Unauthorized(String),

    /// Authenticated but not allowed (path or permission restriction).
    #[error("{0}")]
    Forbidden(String),

    /// No route or no such resource.
    #[error("{0}")]
    NotFound(String),

    /// The path exists but has no handler for this HTTP method.
    #[error("method not allowed")]
    MethodNotAllowed,

    /// Uncaught handler failure surfaced as 500.
    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    /// Missing required parameter.
    pub fn param_required(name: &str) -> Self {
        ApiError::InvalidRequest {
            message: "parameter is required".into(),
            parameter: Some(name.to_string()),
        }
    }

    /// Parameter present but not parsable as the requested type.
    pub fn param_invalid(name: &str) -> Self {
        ApiError::InvalidRequest {
            message: "invalid value format".into(),
            parameter: Some(name.to_string()),
        }
    }

    /// Bad request without a specific parameter to blame.
    pub fn invalid_request(message: impl Into<String>) -> Self {
        ApiError::InvalidRequest {
            message: message.into(),
            parameter: None,
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        ApiError::NotFound(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        ApiError::Internal(message.into())
    }

    /// HTTP status this error maps to.
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::InvalidRequest { .. } => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// `true` for errors in the 5xx range.
    #[must_use]
    pub fn is_server_error(&self) -> bool {
        self.status().is_server_error()
    }

    /// JSON body sent to the client for this error.
    #[must_use]
    pub fn to_body(&self) -> Value {
        let mut error = json!({ "message": self.to_string() });
        if let ApiError::InvalidRequest {
            parameter: Some(name),
            ..
        } = self
        {
            error["parameter"] = Value::String(name.clone());
        }
        json!({ "error": error })
    }
}
