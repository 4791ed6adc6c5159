use serde::Deserialize;

/// Sticky routing configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AffinityConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Record the pin only after a successful call instead of at selection time
    #[serde(default = "default_switch_on_success")]
    pub switch_on_success: bool,
    /// Upper bound on cached entries
    #[serde(default = "default_max_entries")]
    pub max_entries: u64,
    /// TTL for rules that do not set their own
    #[serde(default = "default_ttl_seconds")]
    pub default_ttl_seconds: u64,
    #[serde(default)]
    pub rules: Vec<AffinityRuleConfig>,
}

impl Default for AffinityConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            switch_on_success: default_switch_on_success(),
            max_entries: default_max_entries(),
            default_ttl_seconds: default_ttl_seconds(),
            rules: Vec::new(),
        }
    }
}

/// One rule describing how to derive a sticky key from a request
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AffinityRuleConfig {
    pub name: String,
    /// Regexes on the requested model, at least one must match
    pub model_regex: Vec<String>,
    /// Regexes on the request path, any must match when present
    #[serde(default)]
    pub path_regex: Vec<String>,
    /// Case-insensitive user agent fragments, any must match when present
    #[serde(default)]
    pub user_agent_include: Vec<String>,
    /// Sources tried in order, the first non-empty value wins
    pub key_sources: Vec<KeySourceConfig>,
    /// Extracted value must match this regex
    #[serde(default)]
    pub value_regex: Option<String>,
    /// Entry lifetime, 0 falls back to the global default
    #[serde(default)]
    pub ttl_seconds: u64,
    #[serde(default)]
    pub include_using_group: bool,
    #[serde(default)]
    pub include_rule_name: bool,
    /// Fail fast instead of retrying when the pinned channel fails
    #[serde(default)]
    pub skip_retry_on_failure: bool,
    /// Drop the pin when the pinned channel fails
    #[serde(default)]
    pub forget_on_failure: bool,
}

/// Where a sticky key is read from
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
pub enum KeySourceConfig {
    /// Integer attribute of the dispatch context
    ContextInt { key: ContextIntKey },
    /// String attribute of the dispatch context
    ContextString { key: ContextStringKey },
    /// Request header value
    Header { name: String },
    /// Dotted path into the JSON request body (`metadata.user_id`, `messages.0.role`)
    JsonPath { path: String },
}

/// Integer context attributes usable as sticky keys
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextIntKey {
    TenantId,
}

/// String context attributes usable as sticky keys
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextStringKey {
    Group,
    Tenant,
    Model,
}

const fn default_switch_on_success() -> bool {
    true
}

const fn default_max_entries() -> u64 {
    100_000
}

const fn default_ttl_seconds() -> u64 {
    3600
}
