//! Upstream task status retrieval

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use url::Url;

use crate::error::TaskError;
use crate::task::{Task, TaskStatus};

/// Upstream view of a task, with the status already mapped to a wire name
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchedTask {
    /// `SUBMITTED`, `QUEUED`, `IN_PROGRESS`, `SUCCESS`, `FAILURE`, empty, or
    /// an unrecognized upstream value passed through verbatim
    pub status: String,
    pub progress: Option<String>,
    pub result_url: Option<String>,
    pub reason: Option<String>,
    pub total_tokens: i64,
}

impl FetchedTask {
    pub fn with_status(status: TaskStatus) -> Self {
        Self {
            status: status.as_str().to_owned(),
            ..Self::default()
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            reason: Some(reason.into()),
            ..Self::with_status(TaskStatus::Failure)
        }
    }
}

/// Retrieves task state from the upstream that accepted it
#[async_trait]
pub trait TaskFetcher: Send + Sync {
    async fn fetch(&self, base_url: &Url, key: &SecretString, upstream_id: &str) -> Result<FetchedTask, TaskError>;

    /// Final quota of a completed task when the upstream reports its own cost
    fn completion_quota(&self, _task: &Task, _result: &FetchedTask) -> Option<i64> {
        None
    }
}

#[derive(Debug, Deserialize)]
struct VideoResponse {
    #[serde(default)]
    status: String,
    #[serde(default)]
    progress: Option<u32>,
    #[serde(default)]
    error: Option<VideoError>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    usage: Option<VideoUsage>,
}

#[derive(Debug, Deserialize)]
struct VideoError {
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct VideoUsage {
    #[serde(default)]
    total_tokens: i64,
}

/// Fetcher for OpenAI-compatible video APIs
#[derive(Debug, Clone)]
pub struct HttpTaskFetcher {
    client: Client,
}

impl HttpTaskFetcher {
    pub fn new(timeout: Duration) -> Result<Self, TaskError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TaskError::Transport(e.to_string()))?;

        Ok(Self { client })
    }

    fn task_url(base_url: &Url, upstream_id: &str) -> String {
        let base = base_url.as_str().trim_end_matches('/');
        format!("{base}/v1/videos/{upstream_id}")
    }
}

#[async_trait]
impl TaskFetcher for HttpTaskFetcher {
    async fn fetch(&self, base_url: &Url, key: &SecretString, upstream_id: &str) -> Result<FetchedTask, TaskError> {
        let response = self
            .client
            .get(Self::task_url(base_url, upstream_id))
            .bearer_auth(key.expose_secret())
            .send()
            .await
            .map_err(|e| TaskError::Transport(e.to_string()))?;

        let status = response.status();

        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(TaskError::Upstream {
                status: status.as_u16(),
                message,
            });
        }

        let body: VideoResponse = response
            .json()
            .await
            .map_err(|e| TaskError::InvalidResponse(e.to_string()))?;

        tracing::debug!(upstream_id, status = %body.status, "fetched upstream task");

        Ok(map_video_response(body))
    }
}

fn map_video_response(body: VideoResponse) -> FetchedTask {
    let mut fetched = FetchedTask {
        total_tokens: body.usage.map_or(0, |u| u.total_tokens),
        result_url: body.url.filter(|url| !url.is_empty()),
        ..FetchedTask::default()
    };

    fetched.status = match body.status.as_str() {
        "" => String::new(),
        "queued" | "pending" => TaskStatus::Queued.as_str().to_owned(),
        "processing" | "in_progress" => TaskStatus::InProgress.as_str().to_owned(),
        "completed" => TaskStatus::Success.as_str().to_owned(),
        "failed" | "cancelled" => {
            fetched.reason = Some(
                body.error
                    .map(|e| e.message)
                    .filter(|m| !m.is_empty())
                    .unwrap_or_else(|| "task failed".to_owned()),
            );
            TaskStatus::Failure.as_str().to_owned()
        }
        other => other.to_owned(),
    };

    if let Some(progress) = body.progress.filter(|p| (1..100).contains(p)) {
        fetched.progress = Some(format!("{progress}%"));
    }

    fetched
}
