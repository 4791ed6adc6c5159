use http::StatusCode;
use thiserror::Error;

/// Trait for domain errors that can be converted to HTTP responses
///
/// Implemented by each feature crate's error type. The server layer
/// converts these into actual HTTP responses, keeping domain errors
/// decoupled from axum.
pub trait HttpError: std::error::Error {
    /// HTTP status code for this error
    fn status_code(&self) -> StatusCode;

    /// Machine-readable error type (e.g. `invalid_request_error`)
    fn error_type(&self) -> &str;

    /// Message safe to expose to API consumers
    fn client_message(&self) -> String;
}

/// Outcome of a failed dispatch attempt
///
/// The variant decides how the retry loop and the health manager react:
/// channel errors always retry, caller-attributable errors never do, and
/// upstream errors are classified by configured status-code ranges.
#[derive(Debug, Clone, Error)]
pub enum RelayError {
    /// Backend-attributable failure (connection refused, timeout, revoked credential)
    #[error("channel error: {message}")]
    Channel {
        /// HTTP-equivalent status, 0 when the transport failed before a response
        status: u16,
        message: String,
    },

    /// Caller sent a request the gateway will not forward
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Tenant balance cannot cover the request
    #[error("insufficient quota: {0}")]
    Quota(String),

    /// Upstream answered with a non-success status
    #[error("upstream error (status {status}): {message}")]
    Upstream {
        status: u16,
        message: String,
        /// Provider error code, if the body carried one
        code: Option<String>,
    },

    /// No channel could be selected for the request
    #[error("{0}")]
    NoChannel(String),

    /// Unexpected gateway failure
    #[error("internal error: {message}")]
    Internal {
        message: String,
        /// Correlation id attached once the request gives up
        request_id: Option<String>,
    },
}

impl RelayError {
    /// Build an internal error from any displayable cause
    pub fn internal(message: impl std::fmt::Display) -> Self {
        Self::Internal {
            message: message.to_string(),
            request_id: None,
        }
    }

    /// HTTP-equivalent status code of the failure
    ///
    /// May fall outside 100-599 for transport-level failures.
    pub const fn status(&self) -> u16 {
        match self {
            Self::Channel { status, .. } | Self::Upstream { status, .. } => *status,
            Self::InvalidRequest(_) => 400,
            Self::Quota(_) => 403,
            Self::NoChannel(_) => 503,
            Self::Internal { .. } => 500,
        }
    }

    /// Whether the failure is attributable to the backend itself
    pub const fn is_channel_error(&self) -> bool {
        matches!(self, Self::Channel { .. })
    }

    /// Whether the failure must never be retried on another channel
    pub const fn is_skip_retry(&self) -> bool {
        matches!(
            self,
            Self::InvalidRequest(_) | Self::Quota(_) | Self::NoChannel(_) | Self::Internal { .. }
        )
    }

    /// Annotate the error with the request correlation id
    #[must_use]
    pub fn with_request_id(self, request_id: &str) -> Self {
        let suffix = |message: String| format!("{message} (request id: {request_id})");

        match self {
            Self::Channel { status, message } => Self::Channel {
                status,
                message: suffix(message),
            },
            Self::InvalidRequest(message) => Self::InvalidRequest(suffix(message)),
            Self::Quota(message) => Self::Quota(suffix(message)),
            Self::Upstream { status, message, code } => Self::Upstream {
                status,
                message: suffix(message),
                code,
            },
            Self::NoChannel(message) => Self::NoChannel(suffix(message)),
            Self::Internal { message, .. } => Self::Internal {
                message,
                request_id: Some(request_id.to_owned()),
            },
        }
    }
}

impl HttpError for RelayError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::Channel { status, .. } | Self::Upstream { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::Quota(_) => StatusCode::FORBIDDEN,
            Self::NoChannel(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_type(&self) -> &str {
        match self {
            Self::Channel { .. } => "channel_error",
            Self::InvalidRequest(_) => "invalid_request_error",
            Self::Quota(_) => "insufficient_quota",
            Self::Upstream { .. } => "upstream_error",
            Self::NoChannel(_) => "no_available_channel",
            Self::Internal { .. } => "internal_error",
        }
    }

    fn client_message(&self) -> String {
        match self {
            Self::Internal {
                request_id: Some(id), ..
            } => format!("an internal error occurred (request id: {id})"),
            Self::Internal { .. } => "an internal error occurred".to_owned(),
            Self::Channel { message, .. } | Self::Upstream { message, .. } => message.clone(),
            Self::InvalidRequest(message) | Self::Quota(message) | Self::NoChannel(message) => message.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_flags() {
        let channel = RelayError::Channel {
            status: 0,
            message: "connection refused".to_owned(),
        };
        assert!(channel.is_channel_error());
        assert!(!channel.is_skip_retry());

        let upstream = RelayError::Upstream {
            status: 429,
            message: "slow down".to_owned(),
            code: None,
        };
        assert!(!upstream.is_channel_error());
        assert!(!upstream.is_skip_retry());

        assert!(RelayError::InvalidRequest("bad".to_owned()).is_skip_retry());
        assert!(RelayError::Quota("empty".to_owned()).is_skip_retry());
    }

    #[test]
    fn request_id_is_appended_to_client_message() {
        let err = RelayError::Upstream {
            status: 502,
            message: "bad gateway".to_owned(),
            code: None,
        }
        .with_request_id("req-1");

        assert_eq!(err.client_message(), "bad gateway (request id: req-1)");
        assert_eq!(err.status_code(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn internal_message_is_hidden() {
        let err = RelayError::internal("pool exhausted").with_request_id("req-2");
        assert_eq!(err.client_message(), "an internal error occurred (request id: req-2)");
        assert!(err.to_string().contains("pool exhausted"));
    }

    #[test]
    fn transport_status_maps_to_bad_gateway() {
        let err = RelayError::Channel {
            status: 0,
            message: "timeout".to_owned(),
        };
        assert_eq!(err.status_code(), StatusCode::BAD_GATEWAY);
        assert_eq!(err.status(), 0);
    }
}
