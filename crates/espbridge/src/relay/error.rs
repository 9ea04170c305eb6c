use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::response::Response;
use axum::Json;
use serde::Serialize;

/// Failures returned by the relay endpoints.
///
/// The `Display` text is for logs. Callers only ever see `public_message`,
/// which never includes upstream error details.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("invalid input: {0}")]
    InvalidInput(&'static str),

    #[error("device at {0} is unreachable")]
    Unreachable(String),

    #[error("device at {0} timed out")]
    Timeout(String),

    #[error("failed to reach device at {address}: {source}")]
    Upstream {
        address: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("proxy fetch of {url} failed: {source}")]
    ProxyFetch {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("method not allowed")]
    MethodNotAllowed,

    #[error("internal error: {0}")]
    Internal(String),
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
    pub kind: &'static str,
}

impl RelayError {
    pub fn status(&self) -> StatusCode {
        match self {
            RelayError::InvalidInput(_) | RelayError::Unreachable(_) => StatusCode::BAD_REQUEST,
            RelayError::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            RelayError::Timeout(_)
            | RelayError::Upstream { .. }
            | RelayError::ProxyFetch { .. }
            | RelayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            RelayError::InvalidInput(_) => "invalid_input",
            RelayError::Unreachable(_) => "unreachable",
            RelayError::Timeout(_) => "timeout",
            RelayError::Upstream { .. } | RelayError::ProxyFetch { .. } => "upstream",
            RelayError::MethodNotAllowed => "method_not_allowed",
            RelayError::Internal(_) => "internal",
        }
    }

    pub fn public_message(&self) -> &'static str {
        match self {
            RelayError::InvalidInput(message) => *message,
            RelayError::Unreachable(_) => "Device is unreachable",
            RelayError::Timeout(_) => "Device timed out",
            RelayError::Upstream { .. } => "Failed to reach device",
            RelayError::ProxyFetch { .. } => "Failed to fetch from target URL",
            RelayError::MethodNotAllowed => "Method not allowed",
            RelayError::Internal(_) => "Internal server error",
        }
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!("{}", self);
        } else {
            tracing::info!("{}", self);
        }

        let body = ErrorBody {
            error: self.public_message().to_string(),
            kind: self.kind(),
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(
            RelayError::InvalidInput("IP is required").status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            RelayError::Unreachable("192.0.2.1".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            RelayError::Timeout("192.0.2.1".into()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            RelayError::MethodNotAllowed.status(),
            StatusCode::METHOD_NOT_ALLOWED
        );
    }

    #[test]
    fn test_internal_detail_is_not_public() {
        let err = RelayError::Internal("panicked at src/relay/forwarder.rs:42".into());
        assert_eq!(err.public_message(), "Internal server error");
        assert!(err.to_string().contains("forwarder.rs"));
    }
}
