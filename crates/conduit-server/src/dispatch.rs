//! Tenant-facing dispatch routes

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use conduit_core::{DispatchContext, RelayError, Tenant, new_request_id};
use conduit_tasks::{Task, TaskError, TaskStatus};
use http::{HeaderMap, Uri};
use serde::Serialize;
use serde_json::Value;

use crate::auth::tenant_middleware;
use crate::error::ApiError;
use crate::gateway::Gateway;

/// Header that pins a request to one channel
pub const PIN_HEADER: &str = "x-conduit-channel";

pub fn router(gateway: Gateway) -> Router {
    let tenants = Arc::clone(&gateway.tenants);

    Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/videos", post(submit_video))
        .route("/v1/videos/{id}", get(get_video))
        .route_layer(axum::middleware::from_fn(move |req, next| {
            let tenants = Arc::clone(&tenants);
            async move { tenant_middleware(tenants, req, next).await }
        }))
        .with_state(gateway)
}

fn invalid_request(request_id: &str, message: impl Into<String>) -> ApiError {
    RelayError::InvalidRequest(message.into()).with_request_id(request_id).into()
}

fn parse_body(request_id: &str, body: &Bytes) -> Result<Value, ApiError> {
    let value: Value = serde_json::from_slice(body)
        .map_err(|e| invalid_request(request_id, format!("request body is not valid JSON: {e}")))?;

    if !value.is_object() {
        return Err(invalid_request(request_id, "request body must be a JSON object"));
    }

    Ok(value)
}

/// Build the per-request context from the tenant, headers and body
fn dispatch_context(
    request_id: String,
    tenant: Tenant,
    uri: &Uri,
    headers: &HeaderMap,
    body: &Value,
) -> Result<DispatchContext, ApiError> {
    let model = body
        .get("model")
        .and_then(Value::as_str)
        .filter(|model| !model.is_empty())
        .ok_or_else(|| invalid_request(&request_id, "model is required"))?;

    let pinned_channel = headers
        .get(PIN_HEADER)
        .map(|value| {
            value
                .to_str()
                .ok()
                .and_then(|v| v.trim().parse::<i64>().ok())
                .ok_or_else(|| invalid_request(&request_id, format!("{PIN_HEADER} must be a channel id")))
        })
        .transpose()?;

    if pinned_channel.is_some() && !tenant.admin {
        return Err(ApiError::Forbidden(format!(
            "only admin tenants may pin a channel (request id: {request_id})"
        )));
    }

    let mut ctx = DispatchContext::with_request_id(request_id, tenant, model);
    ctx.pinned_channel = pinned_channel;
    ctx.path = uri.path().to_owned();
    ctx.user_agent = headers
        .get(http::header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(ToOwned::to_owned);
    ctx.headers = headers.clone();

    Ok(ctx)
}

/// Parse the body and build the context under one request id
fn prepare(tenant: Tenant, uri: &Uri, headers: &HeaderMap, body: &Bytes) -> Result<(DispatchContext, Value), ApiError> {
    let request_id = new_request_id();
    let body = parse_body(&request_id, body)?;
    let ctx = dispatch_context(request_id, tenant, uri, headers, &body)?;

    Ok((ctx, body))
}

async fn chat_completions(
    State(gateway): State<Gateway>,
    Extension(tenant): Extension<Tenant>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let (mut ctx, body) = prepare(tenant, &uri, &headers, &body)?;

    let outcome = gateway.relay.chat(&mut ctx, &body).await?;

    Ok(Json(outcome.body))
}

/// Public view of a task
#[derive(Debug, Serialize)]
struct TaskView {
    id: String,
    object: &'static str,
    model: String,
    status: TaskStatus,
    progress: String,
    created_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    started_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    completed_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl From<Task> for TaskView {
    fn from(task: Task) -> Self {
        Self {
            id: task.id,
            object: "video",
            model: task.model,
            status: task.status,
            progress: task.progress,
            created_at: task.submit_time,
            started_at: task.start_time,
            completed_at: task.finish_time,
            url: task.result_url,
            error: task.fail_reason,
        }
    }
}

async fn submit_video(
    State(gateway): State<Gateway>,
    Extension(tenant): Extension<Tenant>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<TaskView>, ApiError> {
    let (mut ctx, body) = prepare(tenant, &uri, &headers, &body)?;

    let task = gateway.relay.submit_task(&mut ctx, &body).await?;

    Ok(Json(task.into()))
}

async fn get_video(
    State(gateway): State<Gateway>,
    Extension(tenant): Extension<Tenant>,
    Path(id): Path<String>,
) -> Result<Json<TaskView>, ApiError> {
    let not_found = || ApiError::NotFound(format!("task {id} not found"));

    let task = match gateway.tasks.get(&id).await {
        Ok(task) => task,
        Err(TaskError::NotFound(_)) => return Err(not_found()),
        Err(e) => return Err(RelayError::internal(e).into()),
    };

    // other tenants' tasks are indistinguishable from missing ones
    if task.tenant_id != tenant.id {
        return Err(not_found());
    }

    Ok(Json(task.into()))
}

#[cfg(test)]
mod tests {
    use conduit_core::HttpError;
    use serde_json::json;

    use super::*;

    fn tenant(admin: bool) -> Tenant {
        Tenant {
            id: 7,
            name: "acme".to_owned(),
            group: "default".to_owned(),
            admin,
        }
    }

    fn uri() -> Uri {
        "/v1/chat/completions".parse().unwrap()
    }

    #[test]
    fn context_carries_request_facts() {
        let mut headers = HeaderMap::new();
        headers.insert(http::header::USER_AGENT, "codex-cli/1.0".parse().unwrap());
        headers.insert("x-session-id", "abc".parse().unwrap());

        let body = json!({ "model": "gpt-4o" });
        let ctx = dispatch_context("r1".to_owned(), tenant(false), &uri(), &headers, &body).unwrap();

        assert_eq!(ctx.request_id, "r1");
        assert_eq!(ctx.model, "gpt-4o");
        assert_eq!(ctx.group, "default");
        assert_eq!(ctx.path, "/v1/chat/completions");
        assert_eq!(ctx.user_agent.as_deref(), Some("codex-cli/1.0"));
        assert_eq!(ctx.headers.get("x-session-id").unwrap(), "abc");
        assert!(ctx.pinned_channel.is_none());
    }

    #[test]
    fn missing_model_is_rejected() {
        let body = json!({ "messages": [] });
        let err = dispatch_context("r1".to_owned(), tenant(false), &uri(), &HeaderMap::new(), &body).unwrap_err();
        assert!(matches!(err, ApiError::Relay(RelayError::InvalidRequest(_))));
    }

    #[test]
    fn only_admins_may_pin() {
        let mut headers = HeaderMap::new();
        headers.insert(PIN_HEADER, "3".parse().unwrap());
        let body = json!({ "model": "gpt-4o" });

        let ctx = dispatch_context("r1".to_owned(), tenant(true), &uri(), &headers, &body).unwrap();
        assert_eq!(ctx.pinned_channel, Some(3));

        let err = dispatch_context("r2".to_owned(), tenant(false), &uri(), &headers, &body).unwrap_err();
        assert!(matches!(err, ApiError::Forbidden(_)));

        headers.insert(PIN_HEADER, "three".parse().unwrap());
        let err = dispatch_context("r3".to_owned(), tenant(true), &uri(), &headers, &body).unwrap_err();
        assert!(matches!(err, ApiError::Relay(RelayError::InvalidRequest(_))));
    }

    #[test]
    fn body_must_be_a_json_object() {
        assert!(parse_body("r1", &Bytes::from_static(b"{\"model\":\"x\"}")).is_ok());
        assert!(parse_body("r1", &Bytes::from_static(b"[1,2]")).is_err());
        assert!(parse_body("r1", &Bytes::from_static(b"not json")).is_err());
    }

    #[test]
    fn early_rejections_carry_the_request_id() {
        let mut pinned = HeaderMap::new();
        pinned.insert(PIN_HEADER, "3".parse().unwrap());

        let cases = [
            (HeaderMap::new(), Bytes::from_static(b"not json")),
            (HeaderMap::new(), Bytes::from_static(b"[1]")),
            (HeaderMap::new(), Bytes::from_static(b"{\"messages\":[]}")),
            (pinned, Bytes::from_static(b"{\"model\":\"gpt-4o\"}")),
        ];

        for (headers, body) in cases {
            let err = prepare(tenant(false), &uri(), &headers, &body).unwrap_err();
            let message = err.client_message();

            let id = message
                .rsplit_once("(request id: ")
                .and_then(|(_, rest)| rest.strip_suffix(')'))
                .unwrap_or_else(|| panic!("no request id in {message:?}"));
            assert_eq!(id.len(), 36, "{message}");
        }
    }
}
