use axum::Json;
use axum::response::{IntoResponse, Response};
use conduit_core::{HttpError, RelayError};
use http::StatusCode;
use serde::Serialize;
use thiserror::Error;

/// Errors returned by the dispatch routes
#[derive(Debug, Error)]
pub enum ApiError {
    /// Relay failure, already carrying the request id
    #[error(transparent)]
    Relay(#[from] RelayError),

    /// Missing or unknown bearer token
    #[error("{0}")]
    Unauthorized(String),

    /// Authenticated but not allowed
    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    NotFound(String),
}

impl HttpError for ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::Relay(e) => e.status_code(),
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
        }
    }

    fn error_type(&self) -> &str {
        match self {
            Self::Relay(e) => e.error_type(),
            Self::Unauthorized(_) => "authentication_error",
            Self::Forbidden(_) => "permission_error",
            Self::NotFound(_) => "not_found_error",
        }
    }

    fn client_message(&self) -> String {
        match self {
            Self::Relay(e) => e.client_message(),
            Self::Unauthorized(message) | Self::Forbidden(message) | Self::NotFound(message) => message.clone(),
        }
    }
}

/// OpenAI-compatible error body
#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: ErrorDetails,
}

#[derive(Debug, Serialize)]
struct ErrorDetails {
    message: String,
    r#type: String,
    code: Option<String>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        let code = match &self {
            Self::Relay(RelayError::Upstream { code: Some(code), .. }) => code.clone(),
            _ => status.as_u16().to_string(),
        };

        let body = ErrorResponse {
            error: ErrorDetails {
                message: self.client_message(),
                r#type: self.error_type().to_owned(),
                code: Some(code),
            },
        };

        (status, Json(body)).into_response()
    }
}

/// Envelope used by every admin route
#[derive(Debug, Serialize)]
pub struct AdminResponse<T: Serialize> {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T: Serialize> AdminResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            message: String::new(),
            data: Some(data),
        }
    }
}

impl AdminResponse<()> {
    pub fn done(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            data: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            data: None,
        }
    }
}

impl<T: Serialize> IntoResponse for AdminResponse<T> {
    fn into_response(self) -> Response {
        Json(self).into_response()
    }
}

#[cfg(test)]
mod tests {
    use axum::body::to_bytes;
    use serde_json::{Value, json};

    use super::*;

    async fn body_of(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn upstream_code_is_passed_through() {
        let error = ApiError::from(
            RelayError::Upstream {
                status: 429,
                message: "rate limited".to_owned(),
                code: Some("rate_limit_exceeded".to_owned()),
            }
            .with_request_id("req-1"),
        );

        let response = error.into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

        assert_eq!(
            body_of(response).await,
            json!({
                "error": {
                    "message": "rate limited (request id: req-1)",
                    "type": "upstream_error",
                    "code": "rate_limit_exceeded"
                }
            })
        );
    }

    #[tokio::test]
    async fn local_errors_use_status_as_code() {
        let response = ApiError::Unauthorized("invalid token".to_owned()).into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let body = body_of(response).await;
        assert_eq!(body["error"]["type"], "authentication_error");
        assert_eq!(body["error"]["code"], "401");
    }

    #[tokio::test]
    async fn admin_envelope_omits_missing_data() {
        let body = body_of(AdminResponse::failed("channel 9 not found").into_response()).await;
        assert_eq!(body, json!({ "success": false, "message": "channel 9 not found" }));

        let body = body_of(AdminResponse::ok(json!({ "count": 2 })).into_response()).await;
        assert_eq!(body["data"]["count"], 2);
        assert_eq!(body["success"], true);
    }
}
