//! OpenAI-compatible adaptor

use async_trait::async_trait;
use conduit_config::ProviderKind;
use conduit_core::{RelayError, Usage};
use reqwest::{Client, Response};
use secrecy::ExposeSecret;
use serde::Deserialize;
use serde_json::Value;

use crate::adaptor::{ProviderAdaptor, UpstreamResponse, UpstreamTarget};

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: String,
    #[serde(default)]
    code: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
struct UsageBody {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
    #[serde(default)]
    prompt_tokens_details: Option<PromptTokensDetails>,
}

#[derive(Debug, Default, Deserialize)]
struct PromptTokensDetails {
    #[serde(default)]
    cached_tokens: u32,
}

impl From<UsageBody> for Usage {
    fn from(body: UsageBody) -> Self {
        Self {
            prompt_tokens: body.prompt_tokens,
            completion_tokens: body.completion_tokens,
            cached_tokens: body.prompt_tokens_details.map_or(0, |details| details.cached_tokens),
        }
    }
}

/// Adaptor for OpenAI-compatible chat completion and video APIs
#[derive(Debug, Clone, Default)]
pub struct OpenAiAdaptor {
    client: Client,
}

impl OpenAiAdaptor {
    pub fn new() -> Self {
        Self::default()
    }

    fn url(target: &UpstreamTarget, path: &str) -> String {
        let base = target.base_url.as_str().trim_end_matches('/');
        format!("{base}{path}")
    }

    async fn post(&self, target: &UpstreamTarget, path: &str, request: &Value) -> Result<Value, RelayError> {
        let mut body = request.clone();
        if let Some(object) = body.as_object_mut() {
            object.insert("model".to_owned(), Value::String(target.model.clone()));
        }

        let response = self
            .client
            .post(Self::url(target, path))
            .bearer_auth(target.key.expose_secret())
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                tracing::error!(channel_id = target.channel_id, error = %e, "upstream request failed");
                RelayError::Channel {
                    status: e.status().map_or(0, |s| s.as_u16()),
                    message: transport_message(&e).to_owned(),
                }
            })?;

        if !response.status().is_success() {
            return Err(upstream_error(target, response).await);
        }

        let status = response.status().as_u16();
        response.json().await.map_err(|e| RelayError::Upstream {
            status,
            message: format!("failed to parse upstream response: {e}"),
            code: None,
        })
    }
}

/// Client-facing text for a transport failure; the request URL stays in the logs
fn transport_message(error: &reqwest::Error) -> &'static str {
    if error.is_timeout() {
        "upstream request timed out"
    } else if error.is_connect() {
        "failed to connect to upstream"
    } else {
        "upstream request failed"
    }
}

async fn upstream_error(target: &UpstreamTarget, response: Response) -> RelayError {
    let status = response.status().as_u16();
    let text = response.text().await.unwrap_or_default();

    tracing::warn!(channel_id = target.channel_id, status, "upstream returned error");

    match serde_json::from_str::<ErrorEnvelope>(&text) {
        Ok(envelope) => RelayError::Upstream {
            status,
            message: if envelope.error.message.is_empty() {
                format!("upstream returned status {status}")
            } else {
                envelope.error.message
            },
            code: envelope.error.code.map(|code| match code {
                Value::String(code) => code,
                other => other.to_string(),
            }),
        },
        Err(_) => RelayError::Upstream {
            status,
            message: if text.trim().is_empty() {
                format!("upstream returned status {status}")
            } else {
                text
            },
            code: None,
        },
    }
}

#[async_trait]
impl ProviderAdaptor for OpenAiAdaptor {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Openai
    }

    async fn chat(&self, target: &UpstreamTarget, request: &Value) -> Result<UpstreamResponse, RelayError> {
        let body = self.post(target, "/v1/chat/completions", request).await?;

        let usage = body
            .get("usage")
            .cloned()
            .and_then(|usage| serde_json::from_value::<UsageBody>(usage).ok())
            .map(Usage::from)
            .unwrap_or_default();

        Ok(UpstreamResponse { body, usage })
    }

    async fn submit_task(&self, target: &UpstreamTarget, request: &Value) -> Result<String, RelayError> {
        let body = self.post(target, "/v1/videos", request).await?;

        body.get("id")
            .or_else(|| body.get("task_id"))
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
            .map(ToOwned::to_owned)
            .ok_or_else(|| RelayError::Upstream {
                status: 502,
                message: "upstream returned no task id".to_owned(),
                code: None,
            })
    }
}
