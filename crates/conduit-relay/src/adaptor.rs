//! Provider adaptor seam

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use conduit_config::ProviderKind;
use conduit_core::{ChannelId, RelayError, Usage};
use secrecy::SecretString;
use serde_json::Value;
use url::Url;

use crate::openai::OpenAiAdaptor;

/// Where and how one attempt reaches the upstream
#[derive(Debug, Clone)]
pub struct UpstreamTarget {
    pub channel_id: ChannelId,
    pub base_url: Url,
    pub key: SecretString,
    /// Model name after channel mapping
    pub model: String,
}

/// Successful upstream answer to a chat request
#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    /// Body returned to the caller unchanged
    pub body: Value,
    pub usage: Usage,
}

/// Protocol translation for one provider kind
///
/// Transport failures map to [`RelayError::Channel`], non-success
/// responses to [`RelayError::Upstream`].
#[async_trait]
pub trait ProviderAdaptor: Send + Sync {
    fn kind(&self) -> ProviderKind;

    async fn chat(&self, target: &UpstreamTarget, request: &Value) -> Result<UpstreamResponse, RelayError>;

    /// Submit a long-running task, returning the upstream task id
    async fn submit_task(&self, target: &UpstreamTarget, request: &Value) -> Result<String, RelayError>;
}

/// Adaptors by provider kind
#[derive(Clone, Default)]
pub struct AdaptorRegistry {
    adaptors: HashMap<ProviderKind, Arc<dyn ProviderAdaptor>>,
}

impl std::fmt::Debug for AdaptorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdaptorRegistry")
            .field("kinds", &self.adaptors.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl AdaptorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in adaptor
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(OpenAiAdaptor::new()));
        registry
    }

    /// Register an adaptor, replacing any previous one of the same kind
    pub fn register(&mut self, adaptor: Arc<dyn ProviderAdaptor>) {
        self.adaptors.insert(adaptor.kind(), adaptor);
    }

    pub fn get(&self, kind: ProviderKind) -> Result<Arc<dyn ProviderAdaptor>, RelayError> {
        self.adaptors
            .get(&kind)
            .cloned()
            .ok_or_else(|| RelayError::internal(format!("no adaptor registered for provider '{}'", kind.as_str())))
    }
}
