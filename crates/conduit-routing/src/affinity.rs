//! Sticky routing
//!
//! Requests that share a conversation (same session id, same user, same
//! tenant) should keep hitting the same channel so provider-side prompt
//! caches stay warm. Rules describe how to pull a key out of a request.
//! The cache maps that key to the channel that last served it.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use conduit_config::{AffinityConfig, AffinityRuleConfig, ContextIntKey, ContextStringKey, KeySourceConfig};
use conduit_core::{ChannelId, DispatchContext, Usage, fingerprint, now_secs};
use dashmap::DashMap;
use mini_moka::sync::Cache;
use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

const HINT_FULL_LEN: usize = 12;
const HINT_EDGE_LEN: usize = 4;

/// Affinity cache errors
#[derive(Debug, Error)]
pub enum AffinityError {
    /// Clear requested without a rule name
    #[error("rule name must not be empty")]
    EmptyRuleName,

    /// No rule with this name is configured
    #[error("unknown affinity rule: {0}")]
    UnknownRule(String),

    /// Entries of this rule cannot be told apart from other rules
    #[error("affinity rule '{0}' does not include its name in cache keys")]
    RuleNameNotIncluded(String),

    /// A rule pattern failed to compile
    #[error("invalid pattern in affinity rule '{rule}': {source}")]
    InvalidPattern {
        rule: String,
        #[source]
        source: regex::Error,
    },
}

/// Request facts affinity rules are evaluated against
#[derive(Debug, Clone, Copy)]
pub struct AffinityRequest<'a> {
    pub tenant_id: i64,
    pub tenant_name: &'a str,
    /// Group used for selection
    pub group: &'a str,
    pub model: &'a str,
    pub path: &'a str,
    pub user_agent: Option<&'a str>,
    pub headers: &'a http::HeaderMap,
    /// Parsed request body
    pub body: Option<&'a Value>,
}

impl<'a> AffinityRequest<'a> {
    pub fn from_context(ctx: &'a DispatchContext, body: Option<&'a Value>) -> Self {
        Self {
            tenant_id: ctx.tenant.id,
            tenant_name: &ctx.tenant.name,
            group: &ctx.group,
            model: &ctx.model,
            path: &ctx.path,
            user_agent: ctx.user_agent.as_deref(),
            headers: &ctx.headers,
            body,
        }
    }
}

/// A request matched by a rule, ready for lookup or record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AffinityMatch {
    pub rule_name: String,
    /// Full cache key
    pub cache_key: String,
    /// Short digest of the extracted value, safe to log
    pub key_fingerprint: String,
    /// Abbreviated extracted value, safe to log
    pub key_hint: String,
    /// Group the rule was evaluated under
    pub group: String,
    pub ttl: Duration,
    pub include_rule_name: bool,
    pub skip_retry_on_failure: bool,
    pub forget_on_failure: bool,
}

/// Cache occupancy report
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AffinityStats {
    pub enabled: bool,
    pub total: usize,
    /// Entries whose rule cannot be identified from the key
    pub unknown: usize,
    pub by_rule_name: BTreeMap<String, usize>,
    pub capacity: u64,
    pub algorithm: &'static str,
    /// Prompt-cache observations per live usage window
    pub usage_cache: Vec<UsageCacheStats>,
}

/// Prompt-cache counters for one (rule, group, key) window
///
/// A window lives for the rule TTL after its last observation, so the
/// counters describe how well pinning keeps provider-side caches warm.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UsageCacheStats {
    pub rule_name: String,
    pub using_group: String,
    pub key_fp: String,
    /// Responses that reported cached prompt tokens
    pub hit: u64,
    pub total: u64,
    pub window_seconds: u64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub cached_tokens: u64,
    pub last_seen_at: i64,
}

type UsageKey = (String, String, String);

#[derive(Debug, Clone)]
struct UsageWindow {
    stats: UsageCacheStats,
    expires_at: Instant,
}

impl UsageWindow {
    fn open(affinity: &AffinityMatch, now: Instant) -> Self {
        Self {
            stats: UsageCacheStats {
                rule_name: affinity.rule_name.clone(),
                using_group: affinity.group.clone(),
                key_fp: affinity.key_fingerprint.clone(),
                window_seconds: affinity.ttl.as_secs(),
                ..UsageCacheStats::default()
            },
            expires_at: now + affinity.ttl,
        }
    }
}

#[derive(Debug, Clone)]
struct AffinityEntry {
    channel_id: ChannelId,
    rule_name: String,
    include_rule_name: bool,
    expires_at: Instant,
}

#[derive(Debug)]
struct CompiledRule {
    name: String,
    model_regex: Vec<Regex>,
    path_regex: Vec<Regex>,
    user_agent_include: Vec<String>,
    key_sources: Vec<KeySourceConfig>,
    value_regex: Option<Regex>,
    ttl: Duration,
    include_using_group: bool,
    include_rule_name: bool,
    skip_retry_on_failure: bool,
    forget_on_failure: bool,
}

impl CompiledRule {
    fn compile(rule: &AffinityRuleConfig, default_ttl: Duration) -> Result<Self, AffinityError> {
        let compile = |pattern: &String| {
            Regex::new(pattern).map_err(|source| AffinityError::InvalidPattern {
                rule: rule.name.clone(),
                source,
            })
        };

        let ttl = if rule.ttl_seconds == 0 {
            default_ttl
        } else {
            Duration::from_secs(rule.ttl_seconds)
        };

        Ok(Self {
            name: rule.name.clone(),
            model_regex: rule.model_regex.iter().map(compile).collect::<Result<_, _>>()?,
            path_regex: rule.path_regex.iter().map(compile).collect::<Result<_, _>>()?,
            user_agent_include: rule
                .user_agent_include
                .iter()
                .map(|s| s.trim().to_lowercase())
                .filter(|s| !s.is_empty())
                .collect(),
            key_sources: rule.key_sources.clone(),
            value_regex: rule.value_regex.as_ref().map(compile).transpose()?,
            ttl,
            include_using_group: rule.include_using_group,
            include_rule_name: rule.include_rule_name,
            skip_retry_on_failure: rule.skip_retry_on_failure,
            forget_on_failure: rule.forget_on_failure,
        })
    }

    fn matches_filters(&self, request: &AffinityRequest<'_>) -> bool {
        if !self.model_regex.iter().any(|re| re.is_match(request.model)) {
            return false;
        }

        if !self.path_regex.is_empty() && !self.path_regex.iter().any(|re| re.is_match(request.path)) {
            return false;
        }

        if !self.user_agent_include.is_empty() {
            let user_agent = request.user_agent.unwrap_or_default().to_lowercase();
            if !self.user_agent_include.iter().any(|needle| user_agent.contains(needle)) {
                return false;
            }
        }

        true
    }

    fn extract(&self, request: &AffinityRequest<'_>) -> Option<String> {
        let value = self
            .key_sources
            .iter()
            .find_map(|source| extract_source(source, request).filter(|v| !v.is_empty()))?;

        match &self.value_regex {
            Some(re) if !re.is_match(&value) => None,
            _ => Some(value),
        }
    }

    fn cache_key(&self, group: &str, value: &str) -> String {
        let mut parts = Vec::with_capacity(3);

        if self.include_rule_name {
            parts.push(self.name.as_str());
        }

        if self.include_using_group {
            parts.push(group);
        }

        parts.push(value);
        parts.join(":")
    }
}

fn extract_source(source: &KeySourceConfig, request: &AffinityRequest<'_>) -> Option<String> {
    match source {
        KeySourceConfig::ContextInt {
            key: ContextIntKey::TenantId,
        } => (request.tenant_id != 0).then(|| request.tenant_id.to_string()),
        KeySourceConfig::ContextString { key } => Some(
            match key {
                ContextStringKey::Group => request.group,
                ContextStringKey::Tenant => request.tenant_name,
                ContextStringKey::Model => request.model,
            }
            .to_owned(),
        ),
        KeySourceConfig::Header { name } => request
            .headers
            .get(name.as_str())
            .and_then(|v| v.to_str().ok())
            .map(|v| v.trim().to_owned()),
        KeySourceConfig::JsonPath { path } => request.body.and_then(|body| json_path(body, path)),
    }
}

/// Resolve a dotted path such as `metadata.user_id` or `messages.0.content`
fn json_path(body: &Value, path: &str) -> Option<String> {
    let leaf = path
        .split('.')
        .filter(|segment| !segment.is_empty())
        .try_fold(body, |node, segment| match node {
            Value::Object(map) => map.get(segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        })?;

    match leaf {
        Value::String(s) => Some(s.trim().to_owned()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Null | Value::Array(_) | Value::Object(_) => None,
    }
}

fn key_hint(value: &str) -> String {
    let chars: Vec<char> = value.chars().collect();

    if chars.len() <= HINT_FULL_LEN {
        return value.to_owned();
    }

    let head: String = chars[..HINT_EDGE_LEN].iter().collect();
    let tail: String = chars[chars.len() - HINT_EDGE_LEN..].iter().collect();

    format!("{head}...{tail}")
}

/// Bounded sticky-routing table
pub struct AffinityCache {
    enabled: bool,
    switch_on_success: bool,
    capacity: u64,
    rules: Vec<CompiledRule>,
    entries: Cache<String, AffinityEntry>,
    usage: DashMap<UsageKey, UsageWindow>,
}

impl std::fmt::Debug for AffinityCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AffinityCache")
            .field("enabled", &self.enabled)
            .field("rules", &self.rules.len())
            .field("entries", &self.entries.entry_count())
            .finish_non_exhaustive()
    }
}

impl AffinityCache {
    pub fn new(config: &AffinityConfig) -> Result<Self, AffinityError> {
        let default_ttl = Duration::from_secs(config.default_ttl_seconds.max(1));

        let rules = config
            .rules
            .iter()
            .map(|rule| CompiledRule::compile(rule, default_ttl))
            .collect::<Result<Vec<_>, _>>()?;

        // entries carry their own expiry, the cache-wide TTL only bounds the longest rule
        let longest = rules.iter().map(|rule| rule.ttl).max().unwrap_or(default_ttl).max(default_ttl);

        let entries = Cache::builder()
            .max_capacity(config.max_entries)
            .time_to_live(longest)
            .build();

        Ok(Self {
            enabled: config.enabled,
            switch_on_success: config.switch_on_success,
            capacity: config.max_entries,
            rules,
            entries,
            usage: DashMap::new(),
        })
    }

    /// Record pins only after a successful call
    pub const fn switch_on_success(&self) -> bool {
        self.switch_on_success
    }

    /// First rule that matches the request and yields a usable key
    pub fn match_request(&self, request: &AffinityRequest<'_>) -> Option<AffinityMatch> {
        if !self.enabled {
            return None;
        }

        self.rules.iter().find_map(|rule| {
            if !rule.matches_filters(request) {
                return None;
            }

            let value = rule.extract(request)?;

            Some(AffinityMatch {
                rule_name: rule.name.clone(),
                cache_key: rule.cache_key(request.group, &value),
                key_fingerprint: fingerprint(&value),
                key_hint: key_hint(&value),
                group: request.group.to_owned(),
                ttl: rule.ttl,
                include_rule_name: rule.include_rule_name,
                skip_retry_on_failure: rule.skip_retry_on_failure,
                forget_on_failure: rule.forget_on_failure,
            })
        })
    }

    /// Channel pinned for the match, if the pin is still live
    pub fn lookup(&self, affinity: &AffinityMatch) -> Option<ChannelId> {
        let entry = self.entries.get(&affinity.cache_key)?;

        if entry.expires_at <= Instant::now() {
            self.entries.invalidate(&affinity.cache_key);
            return None;
        }

        Some(entry.channel_id)
    }

    /// Pin the match to a channel for the rule TTL
    pub fn record(&self, affinity: &AffinityMatch, channel_id: ChannelId) {
        let entry = AffinityEntry {
            channel_id,
            rule_name: affinity.rule_name.clone(),
            include_rule_name: affinity.include_rule_name,
            expires_at: Instant::now() + affinity.ttl,
        };

        self.entries.insert(affinity.cache_key.clone(), entry);

        tracing::debug!(
            rule = %affinity.rule_name,
            key_hint = %affinity.key_hint,
            key_fingerprint = %affinity.key_fingerprint,
            channel_id,
            "affinity recorded"
        );
    }

    /// Drop the pin for a match, but only while it still points at `channel_id`
    pub fn forget(&self, affinity: &AffinityMatch, channel_id: ChannelId) -> bool {
        if self.entries.get(&affinity.cache_key).is_none_or(|entry| entry.channel_id != channel_id) {
            return false;
        }

        self.entries.invalidate(&affinity.cache_key);

        tracing::debug!(
            rule = %affinity.rule_name,
            key_hint = %affinity.key_hint,
            channel_id,
            "affinity forgotten after failure"
        );
        true
    }

    /// Fold the usage of a successful response into the window of its match
    pub fn observe_usage(&self, affinity: &AffinityMatch, usage: &Usage) {
        if affinity.ttl.is_zero() {
            return;
        }

        let now = Instant::now();
        let key = (
            affinity.rule_name.clone(),
            affinity.group.clone(),
            affinity.key_fingerprint.clone(),
        );

        {
            let mut window = self.usage.entry(key).or_insert_with(|| UsageWindow::open(affinity, now));

            if window.expires_at <= now {
                *window = UsageWindow::open(affinity, now);
            }

            let stats = &mut window.stats;
            stats.total += 1;
            if usage.cached_tokens > 0 {
                stats.hit += 1;
            }
            stats.window_seconds = affinity.ttl.as_secs();
            stats.prompt_tokens += u64::from(usage.prompt_tokens);
            stats.completion_tokens += u64::from(usage.completion_tokens);
            stats.total_tokens += u64::from(usage.total_tokens());
            stats.cached_tokens += u64::from(usage.cached_tokens);
            stats.last_seen_at = now_secs();

            window.expires_at = now + affinity.ttl;
        }

        if u64::try_from(self.usage.len()).unwrap_or(u64::MAX) > self.capacity {
            self.usage.retain(|_, window| window.expires_at > now);
        }
    }

    /// Live usage windows ordered by rule, group and key
    pub fn usage_cache_stats(&self) -> Vec<UsageCacheStats> {
        let now = Instant::now();

        let mut stats: Vec<UsageCacheStats> = self
            .usage
            .iter()
            .filter(|window| window.value().expires_at > now)
            .map(|window| window.value().stats.clone())
            .collect();

        stats.sort_by(|a, b| {
            (&a.rule_name, &a.using_group, &a.key_fp).cmp(&(&b.rule_name, &b.using_group, &b.key_fp))
        });
        stats
    }

    fn live_entries(&self) -> Vec<(String, AffinityEntry)> {
        let now = Instant::now();

        self.entries
            .iter()
            .filter(|entry| entry.value().expires_at > now)
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    pub fn stats(&self) -> AffinityStats {
        let live = self.live_entries();
        let mut by_rule_name = BTreeMap::new();
        let mut unknown = 0;

        for (_, entry) in &live {
            if entry.include_rule_name {
                *by_rule_name.entry(entry.rule_name.clone()).or_insert(0) += 1;
            } else {
                unknown += 1;
            }
        }

        AffinityStats {
            enabled: self.enabled,
            total: live.len(),
            unknown,
            by_rule_name,
            capacity: self.capacity,
            algorithm: "tinylfu",
            usage_cache: self.usage_cache_stats(),
        }
    }

    /// Remove every entry, returning how many were live
    pub fn clear_all(&self) -> usize {
        let count = self.live_entries().len();
        self.entries.invalidate_all();

        tracing::info!(count, "affinity cache cleared");
        count
    }

    /// Remove the entries of one rule, returning how many were live
    pub fn clear_by_rule(&self, rule_name: &str) -> Result<usize, AffinityError> {
        let rule_name = rule_name.trim();

        if rule_name.is_empty() {
            return Err(AffinityError::EmptyRuleName);
        }

        let rule = self
            .rules
            .iter()
            .find(|rule| rule.name == rule_name)
            .ok_or_else(|| AffinityError::UnknownRule(rule_name.to_owned()))?;

        if !rule.include_rule_name {
            return Err(AffinityError::RuleNameNotIncluded(rule_name.to_owned()));
        }

        let prefix = format!("{rule_name}:");
        let keys: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| entry.key().starts_with(&prefix))
            .map(|entry| entry.key().clone())
            .collect();

        for key in &keys {
            self.entries.invalidate(key);
        }

        tracing::info!(rule = rule_name, count = keys.len(), "affinity rule cleared");
        Ok(keys.len())
    }
}

#[cfg(test)]
mod tests {
    use http::HeaderMap;
    use serde_json::json;

    use super::*;

    fn cache(rules: &str) -> AffinityCache {
        let config: AffinityConfig = toml::from_str(&format!("enabled = true\n{rules}")).unwrap();
        AffinityCache::new(&config).unwrap()
    }

    const SESSION_RULE: &str = r#"
        [[rules]]
        name = "sessions"
        model_regex = ["^claude-"]
        path_regex = ["^/v1/"]
        include_rule_name = true
        include_using_group = true
        key_sources = [
            { type = "json_path", path = "metadata.user_id" },
            { type = "header", name = "x-session-id" },
        ]
    "#;

    struct Facts {
        headers: HeaderMap,
        body: Value,
        model: &'static str,
        user_agent: Option<&'static str>,
    }

    impl Facts {
        fn new(body: Value) -> Self {
            Self {
                headers: HeaderMap::new(),
                body,
                model: "claude-sonnet-4",
                user_agent: None,
            }
        }

        fn request(&self) -> AffinityRequest<'_> {
            AffinityRequest {
                tenant_id: 7,
                tenant_name: "acme",
                group: "default",
                model: self.model,
                path: "/v1/chat/completions",
                user_agent: self.user_agent,
                headers: &self.headers,
                body: Some(&self.body),
            }
        }
    }

    #[test]
    fn json_path_key_builds_namespaced_cache_key() {
        let cache = cache(SESSION_RULE);
        let facts = Facts::new(json!({ "metadata": { "user_id": "user-session-0123456789" } }));

        let matched = cache.match_request(&facts.request()).unwrap();
        assert_eq!(matched.rule_name, "sessions");
        assert_eq!(matched.cache_key, "sessions:default:user-session-0123456789");
        assert_eq!(matched.key_hint, "user...6789");
        assert_eq!(matched.key_fingerprint.len(), 8);
        assert_eq!(matched.ttl, Duration::from_secs(3600));
    }

    #[test]
    fn falls_through_to_the_next_key_source() {
        let cache = cache(SESSION_RULE);
        let mut facts = Facts::new(json!({ "metadata": {} }));
        facts.headers.insert("x-session-id", "abc".parse().unwrap());

        let matched = cache.match_request(&facts.request()).unwrap();
        assert_eq!(matched.cache_key, "sessions:default:abc");
        assert_eq!(matched.key_hint, "abc");
    }

    #[test]
    fn model_filter_must_match() {
        let cache = cache(SESSION_RULE);
        let mut facts = Facts::new(json!({ "metadata": { "user_id": "u1" } }));
        facts.model = "gpt-4o";

        assert!(cache.match_request(&facts.request()).is_none());
    }

    #[test]
    fn user_agent_filter_is_case_insensitive() {
        let cache = cache(
            r#"
            [[rules]]
            name = "cli"
            model_regex = [".*"]
            user_agent_include = ["Claude-CLI"]
            key_sources = [{ type = "context_int", key = "tenant_id" }]
            "#,
        );

        let mut facts = Facts::new(json!({}));
        assert!(cache.match_request(&facts.request()).is_none());

        facts.user_agent = Some("claude-cli/1.0.3 (external)");
        let matched = cache.match_request(&facts.request()).unwrap();
        assert_eq!(matched.cache_key, "7");
    }

    #[test]
    fn value_regex_rejects_values() {
        let cache = cache(
            r#"
            [[rules]]
            name = "numeric"
            model_regex = [".*"]
            value_regex = "^[0-9]+$"
            key_sources = [{ type = "json_path", path = "messages.0.content" }]
            "#,
        );

        let facts = Facts::new(json!({ "messages": [{ "content": "hello" }] }));
        assert!(cache.match_request(&facts.request()).is_none());

        let facts = Facts::new(json!({ "messages": [{ "content": "12345" }] }));
        assert_eq!(cache.match_request(&facts.request()).unwrap().cache_key, "12345");
    }

    #[test]
    fn disabled_cache_never_matches() {
        let config: AffinityConfig = toml::from_str(&format!("enabled = false\n{SESSION_RULE}")).unwrap();
        let cache = AffinityCache::new(&config).unwrap();
        let facts = Facts::new(json!({ "metadata": { "user_id": "u1" } }));

        assert!(cache.match_request(&facts.request()).is_none());
    }

    #[test]
    fn same_key_resolves_to_the_same_channel_until_expiry() {
        let cache = cache(SESSION_RULE);
        let facts = Facts::new(json!({ "metadata": { "user_id": "u1" } }));
        let mut matched = cache.match_request(&facts.request()).unwrap();

        cache.record(&matched, 42);
        assert_eq!(cache.lookup(&matched), Some(42));
        assert_eq!(cache.lookup(&cache.match_request(&facts.request()).unwrap()), Some(42));

        matched.ttl = Duration::from_millis(20);
        cache.record(&matched, 43);
        std::thread::sleep(Duration::from_millis(40));

        assert_eq!(cache.lookup(&matched), None);
        assert_eq!(cache.stats().total, 0);
    }

    #[test]
    fn stats_group_entries_by_rule() {
        let cache = cache(&format!(
            r#"{SESSION_RULE}
            [[rules]]
            name = "tenants"
            model_regex = [".*"]
            key_sources = [{{ type = "context_int", key = "tenant_id" }}]
            "#
        ));

        let first = Facts::new(json!({ "metadata": { "user_id": "u1" } }));
        let second = Facts::new(json!({ "metadata": { "user_id": "u2" } }));
        let mut other = Facts::new(json!({}));
        other.model = "gpt-4o";

        for facts in [&first, &second, &other] {
            let matched = cache.match_request(&facts.request()).unwrap();
            cache.record(&matched, 1);
        }

        insta::assert_json_snapshot!(cache.stats(), @r#"
        {
          "enabled": true,
          "total": 3,
          "unknown": 1,
          "by_rule_name": {
            "sessions": 2
          },
          "capacity": 100000,
          "algorithm": "tinylfu",
          "usage_cache": []
        }
        "#);
    }

    #[test]
    fn clear_by_rule_removes_only_that_rule() {
        let cache = cache(&format!(
            r#"{SESSION_RULE}
            [[rules]]
            name = "tenants"
            model_regex = [".*"]
            key_sources = [{{ type = "context_int", key = "tenant_id" }}]
            "#
        ));

        let session = Facts::new(json!({ "metadata": { "user_id": "u1" } }));
        let mut tenant = Facts::new(json!({}));
        tenant.model = "gpt-4o";

        let session_match = cache.match_request(&session.request()).unwrap();
        let tenant_match = cache.match_request(&tenant.request()).unwrap();
        cache.record(&session_match, 1);
        cache.record(&tenant_match, 2);

        assert_eq!(cache.clear_by_rule("sessions").unwrap(), 1);
        assert_eq!(cache.lookup(&session_match), None);
        assert_eq!(cache.lookup(&tenant_match), Some(2));

        assert!(matches!(cache.clear_by_rule(" "), Err(AffinityError::EmptyRuleName)));
        assert!(matches!(cache.clear_by_rule("nope"), Err(AffinityError::UnknownRule(_))));
        assert!(matches!(
            cache.clear_by_rule("tenants"),
            Err(AffinityError::RuleNameNotIncluded(_))
        ));

        assert_eq!(cache.clear_all(), 1);
        assert_eq!(cache.lookup(&tenant_match), None);
    }

    #[test]
    fn usage_windows_count_cache_hits_per_key() {
        let cache = cache(SESSION_RULE);
        let first = cache
            .match_request(&Facts::new(json!({ "metadata": { "user_id": "u1" } })).request())
            .unwrap();
        let second = cache
            .match_request(&Facts::new(json!({ "metadata": { "user_id": "u2" } })).request())
            .unwrap();

        let cold = Usage {
            prompt_tokens: 100,
            completion_tokens: 10,
            cached_tokens: 0,
        };
        let warm = Usage {
            prompt_tokens: 100,
            completion_tokens: 5,
            cached_tokens: 80,
        };

        cache.observe_usage(&first, &cold);
        cache.observe_usage(&first, &warm);
        cache.observe_usage(&second, &cold);

        let stats = cache.stats().usage_cache;
        assert_eq!(stats.len(), 2);

        let u1 = stats.iter().find(|s| s.key_fp == first.key_fingerprint).unwrap();
        assert_eq!(u1.rule_name, "sessions");
        assert_eq!(u1.using_group, "default");
        assert_eq!((u1.hit, u1.total), (1, 2));
        assert_eq!(u1.prompt_tokens, 200);
        assert_eq!(u1.completion_tokens, 15);
        assert_eq!(u1.total_tokens, 215);
        assert_eq!(u1.cached_tokens, 80);
        assert_eq!(u1.window_seconds, 3600);
        assert!(u1.last_seen_at > 0);

        let u2 = stats.iter().find(|s| s.key_fp == second.key_fingerprint).unwrap();
        assert_eq!((u2.hit, u2.total), (0, 1));
    }

    #[test]
    fn usage_window_restarts_after_its_ttl() {
        let cache = cache(SESSION_RULE);
        let mut matched = cache
            .match_request(&Facts::new(json!({ "metadata": { "user_id": "u1" } })).request())
            .unwrap();
        matched.ttl = Duration::from_millis(20);

        let usage = Usage {
            prompt_tokens: 10,
            completion_tokens: 1,
            cached_tokens: 4,
        };
        cache.observe_usage(&matched, &usage);
        std::thread::sleep(Duration::from_millis(40));
        assert!(cache.usage_cache_stats().is_empty());

        cache.observe_usage(&matched, &usage);
        let stats = cache.usage_cache_stats();
        assert_eq!(stats.len(), 1);
        assert_eq!((stats[0].hit, stats[0].total), (1, 1));
    }

    #[test]
    fn forget_only_drops_a_pin_to_the_failed_channel() {
        let cache = cache(SESSION_RULE);
        let matched = cache
            .match_request(&Facts::new(json!({ "metadata": { "user_id": "u1" } })).request())
            .unwrap();

        cache.record(&matched, 5);
        assert!(!cache.forget(&matched, 6));
        assert_eq!(cache.lookup(&matched), Some(5));

        assert!(cache.forget(&matched, 5));
        assert_eq!(cache.lookup(&matched), None);
        assert!(!cache.forget(&matched, 5));
    }

    #[test]
    fn json_path_leaves() {
        let body = json!({ "a": { "n": 5, "b": true, "list": [null, "x"], "obj": {} } });
        assert_eq!(json_path(&body, "a.n").as_deref(), Some("5"));
        assert_eq!(json_path(&body, "a.b").as_deref(), Some("true"));
        assert_eq!(json_path(&body, "a.list.1").as_deref(), Some("x"));
        assert_eq!(json_path(&body, "a.list.0"), None);
        assert_eq!(json_path(&body, "a.obj"), None);
        assert_eq!(json_path(&body, "a.missing"), None);
    }
}
