use indexmap::IndexMap;
use secrecy::SecretString;
use serde::Deserialize;
use url::Url;

/// A configured upstream backend
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChannelConfig {
    /// Unique numeric identifier
    pub id: i64,
    pub name: String,
    /// Provider protocol
    #[serde(rename = "type", default)]
    pub kind: ProviderKind,
    pub base_url: Url,
    /// Credentials, one per slot
    pub keys: Vec<SecretString>,
    /// Rotation policy, present only for multi-key channels
    #[serde(default)]
    pub multi_key: Option<MultiKeyMode>,
    /// Initial status
    #[serde(default)]
    pub status: InitialStatus,
    /// Allow the health manager to disable this channel
    #[serde(default = "default_auto_ban")]
    pub auto_ban: bool,
    /// Higher tiers are tried first
    #[serde(default)]
    pub priority: i64,
    /// Relative share within a priority tier
    #[serde(default)]
    pub weight: u32,
    #[serde(default)]
    pub tag: Option<String>,
    /// Tenant groups allowed to use this channel
    #[serde(default = "default_groups")]
    pub groups: Vec<String>,
    /// Models served by this channel
    pub models: Vec<String>,
    /// Requested model name to upstream model name
    #[serde(default)]
    pub model_mapping: IndexMap<String, String>,
    /// Model used by health probes, defaults to the first served model
    #[serde(default)]
    pub test_model: Option<String>,
}

/// Supported provider protocols
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// OpenAI-compatible API
    #[default]
    Openai,
}

impl ProviderKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Openai => "openai",
        }
    }
}

/// Credential rotation policy for multi-key channels
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MultiKeyMode {
    /// Walk slots in order, remembering the position between requests
    #[default]
    Polling,
    /// Pick uniformly among enabled slots
    Random,
}

/// Status a channel starts with
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InitialStatus {
    #[default]
    Enabled,
    Disabled,
}

#[allow(clippy::missing_const_for_fn)]
fn default_auto_ban() -> bool {
    true
}

fn default_groups() -> Vec<String> {
    vec!["default".to_owned()]
}
