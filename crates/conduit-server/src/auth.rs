use std::sync::Arc;

use axum::extract::Request;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use secrecy::{ExposeSecret, SecretString};

use crate::error::{AdminResponse, ApiError};
use crate::tenants::TenantDirectory;

fn bearer_token(request: &Request) -> Option<&str> {
    request
        .headers()
        .get(http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

/// Resolve the bearer token to a tenant and attach it to the request
pub async fn tenant_middleware(tenants: Arc<TenantDirectory>, mut request: Request, next: Next) -> Response {
    let Some(token) = bearer_token(&request) else {
        return ApiError::Unauthorized("missing bearer token".to_owned()).into_response();
    };

    let Some(tenant) = tenants.authenticate(token).cloned() else {
        tracing::debug!(path = %request.uri().path(), "unknown tenant token");
        return ApiError::Unauthorized("invalid token".to_owned()).into_response();
    };

    request.extensions_mut().insert(tenant);
    next.run(request).await
}

/// Reject admin requests without the configured token
pub async fn admin_middleware(admin_token: SecretString, request: Request, next: Next) -> Response {
    if bearer_token(&request) != Some(admin_token.expose_secret()) {
        tracing::warn!(path = %request.uri().path(), "admin request rejected");
        return (http::StatusCode::UNAUTHORIZED, AdminResponse::failed("invalid admin token")).into_response();
    }

    next.run(request).await
}
