//! Mock OpenAI-compatible upstream for integration tests
//!
//! Chat responses follow a script of status codes, one per request, falling
//! back to success once the script runs out.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{Json, Router, routing};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

/// Mock upstream with scripted failures
pub struct MockUpstream {
    addr: SocketAddr,
    shutdown: CancellationToken,
    state: Arc<MockState>,
}

struct MockState {
    chat_count: AtomicU32,
    video_count: AtomicU32,
    script: Mutex<VecDeque<u16>>,
    /// Bearer tokens seen on chat requests, in order
    keys: Mutex<Vec<String>>,
    /// Models seen on chat requests, in order
    models: Mutex<Vec<String>>,
    /// Body returned by `GET /v1/videos/{id}`
    video_status: Mutex<Value>,
}

impl MockUpstream {
    /// Start a mock upstream that always succeeds
    pub async fn start() -> anyhow::Result<Self> {
        Self::start_scripted(&[]).await
    }

    /// Start a mock upstream that answers the first requests with `statuses`
    pub async fn start_scripted(statuses: &[u16]) -> anyhow::Result<Self> {
        let state = Arc::new(MockState {
            chat_count: AtomicU32::new(0),
            video_count: AtomicU32::new(0),
            script: Mutex::new(statuses.iter().copied().collect()),
            keys: Mutex::new(Vec::new()),
            models: Mutex::new(Vec::new()),
            video_status: Mutex::new(json!({ "status": "queued" })),
        });

        let app = Router::new()
            .route("/v1/chat/completions", routing::post(handle_chat))
            .route("/v1/videos", routing::post(handle_submit_video))
            .route("/v1/videos/{id}", routing::get(handle_get_video))
            .with_state(Arc::clone(&state));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let shutdown = CancellationToken::new();
        let shutdown_clone = shutdown.clone();

        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    shutdown_clone.cancelled().await;
                })
                .await
                .ok();
        });

        Ok(Self { addr, shutdown, state })
    }

    /// Base URL to configure as a channel
    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Always answer chat requests with `status`
    pub fn fail_always(&self, status: u16) {
        let mut script = self.state.script.lock().unwrap();
        script.clear();
        script.extend(std::iter::repeat_n(status, 1000));
    }

    /// Clear the script so every request succeeds
    pub fn heal(&self) {
        self.state.script.lock().unwrap().clear();
    }

    pub fn set_video_status(&self, body: Value) {
        *self.state.video_status.lock().unwrap() = body;
    }

    pub fn chat_count(&self) -> u32 {
        self.state.chat_count.load(Ordering::Relaxed)
    }

    pub fn video_count(&self) -> u32 {
        self.state.video_count.load(Ordering::Relaxed)
    }

    pub fn keys(&self) -> Vec<String> {
        self.state.keys.lock().unwrap().clone()
    }

    pub fn models(&self) -> Vec<String> {
        self.state.models.lock().unwrap().clone()
    }
}

impl Drop for MockUpstream {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn bearer(headers: &HeaderMap) -> String {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .unwrap_or_default()
        .to_owned()
}

fn scripted_failure(state: &MockState) -> Option<Response> {
    let status = state.script.lock().unwrap().pop_front()?;

    if status == 200 {
        return None;
    }

    let status = StatusCode::from_u16(status).unwrap();
    Some(
        (
            status,
            Json(json!({
                "error": {
                    "message": format!("mock upstream failure {}", status.as_u16()),
                    "type": "upstream_error",
                    "code": "mock_failure"
                }
            })),
        )
            .into_response(),
    )
}

async fn handle_chat(State(state): State<Arc<MockState>>, headers: HeaderMap, Json(body): Json<Value>) -> Response {
    state.chat_count.fetch_add(1, Ordering::Relaxed);
    state.keys.lock().unwrap().push(bearer(&headers));

    let model = body["model"].as_str().unwrap_or_default().to_owned();
    state.models.lock().unwrap().push(model.clone());

    if let Some(failure) = scripted_failure(&state) {
        return failure;
    }

    Json(json!({
        "id": "chatcmpl-mock",
        "object": "chat.completion",
        "created": 1_700_000_000,
        "model": model,
        "choices": [{
            "index": 0,
            "message": { "role": "assistant", "content": "Hello from mock upstream" },
            "finish_reason": "stop"
        }],
        "usage": {
            "prompt_tokens": 10,
            "completion_tokens": 5,
            "total_tokens": 15,
            "prompt_tokens_details": { "cached_tokens": 4 }
        }
    }))
    .into_response()
}

async fn handle_submit_video(State(state): State<Arc<MockState>>) -> Response {
    let n = state.video_count.fetch_add(1, Ordering::Relaxed) + 1;

    if let Some(failure) = scripted_failure(&state) {
        return failure;
    }

    Json(json!({ "id": format!("video_{n}"), "status": "queued" })).into_response()
}

async fn handle_get_video(State(state): State<Arc<MockState>>, Path(id): Path<String>) -> Response {
    let mut body = state.video_status.lock().unwrap().clone();
    body["id"] = Value::String(id);
    Json(body).into_response()
}
