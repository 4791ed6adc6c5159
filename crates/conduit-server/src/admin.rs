//! Operator routes under `/api`
//!
//! Every route answers `{success, message, data?}` with status 200, failures
//! included, except a rejected admin token.

use axum::extract::{Path, Query, State};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use conduit_channels::KeyError;
use conduit_core::ChannelStatus;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::auth::admin_middleware;
use crate::error::AdminResponse;
use crate::gateway::Gateway;

const OPERATOR_REASON: &str = "disabled by operator";

pub fn router(gateway: Gateway, admin_token: SecretString) -> Router {
    Router::new()
        .route("/api/channel/test", get(test_all_channels))
        .route("/api/channel/test/{id}", get(test_channel))
        .route("/api/channel/{id}/enable", post(enable_channel))
        .route("/api/channel/{id}/disable", post(disable_channel))
        .route("/api/channel/tag/enabled", post(enable_tag))
        .route("/api/channel/tag/disabled", post(disable_tag))
        .route("/api/channel/multi_key/manage", post(manage_keys))
        .route("/api/affinity/stats", get(affinity_stats))
        .route("/api/affinity", delete(clear_affinity))
        .route("/api/settings/status_codes", put(update_status_codes))
        .route_layer(axum::middleware::from_fn(move |req, next| {
            let token = admin_token.clone();
            async move { admin_middleware(token, req, next).await }
        }))
        .with_state(gateway)
}

#[derive(Debug, Deserialize)]
struct TestQuery {
    model: Option<String>,
}

/// Probe result in the shape callers poll for
#[derive(Debug, Serialize)]
struct TestResult {
    success: bool,
    message: String,
    time: f64,
}

async fn test_channel(State(gateway): State<Gateway>, Path(id): Path<i64>, Query(query): Query<TestQuery>) -> Response {
    match gateway.tester.test_channel(id, query.model.as_deref()).await {
        Ok(report) => Json(TestResult {
            success: report.success,
            message: report.message,
            time: report.time,
        })
        .into_response(),
        Err(e) => Json(TestResult {
            success: false,
            message: e.to_string(),
            time: 0.0,
        })
        .into_response(),
    }
}

async fn test_all_channels(State(gateway): State<Gateway>) -> AdminResponse<()> {
    if gateway.tester.start_test_all() {
        AdminResponse::done("channel test started")
    } else {
        AdminResponse::failed("a channel test is already running")
    }
}

async fn enable_channel(State(gateway): State<Gateway>, Path(id): Path<i64>) -> Response {
    match gateway.health.enable_channel(id) {
        Ok(previous) => AdminResponse::ok(json!({ "id": id, "previous": previous, "status": ChannelStatus::Enabled }))
            .into_response(),
        Err(e) => AdminResponse::failed(e.to_string()).into_response(),
    }
}

async fn disable_channel(State(gateway): State<Gateway>, Path(id): Path<i64>) -> Response {
    match gateway.health.disable_channel(id) {
        Ok(previous) => {
            AdminResponse::ok(json!({ "id": id, "previous": previous, "status": ChannelStatus::ManuallyDisabled }))
                .into_response()
        }
        Err(e) => AdminResponse::failed(e.to_string()).into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct TagRequest {
    tag: String,
}

async fn enable_tag(State(gateway): State<Gateway>, Json(request): Json<TagRequest>) -> Response {
    if request.tag.trim().is_empty() {
        return AdminResponse::failed("tag must not be empty").into_response();
    }

    let count = gateway.health.enable_tag(request.tag.trim());
    AdminResponse::ok(json!({ "tag": request.tag, "count": count })).into_response()
}

async fn disable_tag(State(gateway): State<Gateway>, Json(request): Json<TagRequest>) -> Response {
    if request.tag.trim().is_empty() {
        return AdminResponse::failed("tag must not be empty").into_response();
    }

    let count = gateway.health.disable_tag(request.tag.trim());
    AdminResponse::ok(json!({ "tag": request.tag, "count": count })).into_response()
}

#[derive(Debug, Deserialize)]
struct ManageKeysRequest {
    channel_id: i64,
    action: String,
    key_index: Option<usize>,
    page: Option<usize>,
    page_size: Option<usize>,
    status: Option<ChannelStatus>,
}

async fn manage_keys(State(gateway): State<Gateway>, Json(request): Json<ManageKeysRequest>) -> Response {
    let entry = match gateway.channels.get(request.channel_id) {
        Ok(entry) => entry,
        Err(e) => return AdminResponse::failed(e.to_string()).into_response(),
    };

    let key_index = || {
        request
            .key_index
            .ok_or_else(|| AdminResponse::failed("key_index is required").into_response())
    };

    let result = match request.action.as_str() {
        "get_key_status" => entry
            .list_keys(request.page.unwrap_or(1), request.page_size.unwrap_or(0), request.status)
            .map(|page| AdminResponse::ok(page).into_response()),
        "disable_key" => match key_index() {
            Ok(index) => entry
                .update_keys(|pool| pool.disable(index, ChannelStatus::ManuallyDisabled, OPERATOR_REASON))
                .map(|_| AdminResponse::done(format!("key {index} disabled")).into_response()),
            Err(response) => return response,
        },
        "enable_key" => match key_index() {
            Ok(index) => entry
                .update_keys(|pool| pool.enable(index))
                .map(|_| AdminResponse::done(format!("key {index} enabled")).into_response()),
            Err(response) => return response,
        },
        "enable_all_keys" => entry
            .update_keys(|pool| Ok(pool.enable_all()))
            .map(|count| AdminResponse::ok(json!({ "count": count })).into_response()),
        "disable_all_keys" => entry
            .update_keys(|pool| Ok(pool.disable_all(OPERATOR_REASON)))
            .map(|count| AdminResponse::ok(json!({ "count": count })).into_response()),
        "delete_key" => match key_index() {
            Ok(index) => entry
                .update_keys(|pool| pool.delete(index))
                .map(|()| AdminResponse::done(format!("key {index} deleted")).into_response()),
            Err(response) => return response,
        },
        "delete_disabled_keys" => entry
            .update_keys(|pool| pool.delete_auto_disabled())
            .map(|count| AdminResponse::ok(json!({ "count": count })).into_response()),
        other => return AdminResponse::failed(format!("unknown action: {other}")).into_response(),
    };

    result.unwrap_or_else(|e: KeyError| {
        tracing::debug!(channel_id = request.channel_id, action = %request.action, error = %e, "key operation rejected");
        AdminResponse::failed(e.to_string()).into_response()
    })
}

async fn affinity_stats(State(gateway): State<Gateway>) -> Response {
    AdminResponse::ok(gateway.affinity.stats()).into_response()
}

#[derive(Debug, Deserialize)]
struct ClearAffinityQuery {
    #[serde(default)]
    all: bool,
    rule_name: Option<String>,
}

async fn clear_affinity(State(gateway): State<Gateway>, Query(query): Query<ClearAffinityQuery>) -> Response {
    if query.all {
        let count = gateway.affinity.clear_all();
        return AdminResponse::ok(json!({ "cleared": count })).into_response();
    }

    let Some(rule_name) = query.rule_name else {
        return AdminResponse::failed("either all=true or rule_name is required").into_response();
    };

    match gateway.affinity.clear_by_rule(&rule_name) {
        Ok(count) => AdminResponse::ok(json!({ "cleared": count, "rule_name": rule_name })).into_response(),
        Err(e) => AdminResponse::failed(e.to_string()).into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct StatusCodesRequest {
    auto_disable: Option<String>,
    auto_retry: Option<String>,
}

async fn update_status_codes(State(gateway): State<Gateway>, Json(request): Json<StatusCodesRequest>) -> Response {
    match gateway
        .health
        .update_status_codes(request.auto_disable.as_deref(), request.auto_retry.as_deref())
    {
        Ok((auto_disable, auto_retry)) => {
            AdminResponse::ok(json!({ "auto_disable": auto_disable, "auto_retry": auto_retry })).into_response()
        }
        Err(e) => AdminResponse::failed(e.to_string()).into_response(),
    }
}
