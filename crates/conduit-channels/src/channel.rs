use conduit_config::{ChannelConfig, InitialStatus, ProviderKind};
use conduit_core::{ChannelId, ChannelStatus, now_secs};
use indexmap::IndexMap;
use url::Url;

use crate::multi_key::KeyPool;

/// Reason recorded when the last enabled slot of a multi-key channel goes away
pub const ALL_KEYS_DISABLED: &str = "all keys are disabled";

/// Runtime state of one upstream backend
#[derive(Debug, Clone)]
pub struct Channel {
    pub id: ChannelId,
    pub name: String,
    pub kind: ProviderKind,
    pub base_url: Url,
    pub status: ChannelStatus,
    pub status_reason: Option<String>,
    /// Unix time of the last status change
    pub status_changed_at: Option<i64>,
    pub auto_ban: bool,
    pub priority: i64,
    pub weight: u32,
    pub tag: Option<String>,
    pub groups: Vec<String>,
    pub models: Vec<String>,
    pub model_mapping: IndexMap<String, String>,
    pub test_model: Option<String>,
    /// Latency of the last probe
    pub response_time_ms: Option<u64>,
    pub tested_at: Option<i64>,
    pub keys: KeyPool,
}

impl Channel {
    pub fn from_config(config: &ChannelConfig) -> Self {
        let status = match config.status {
            InitialStatus::Enabled => ChannelStatus::Enabled,
            InitialStatus::Disabled => ChannelStatus::ManuallyDisabled,
        };

        Self {
            id: config.id,
            name: config.name.clone(),
            kind: config.kind,
            base_url: config.base_url.clone(),
            status,
            status_reason: None,
            status_changed_at: None,
            auto_ban: config.auto_ban,
            priority: config.priority,
            weight: config.weight,
            tag: config.tag.clone(),
            groups: config.groups.clone(),
            models: config.models.clone(),
            model_mapping: config.model_mapping.clone(),
            test_model: config.test_model.clone(),
            response_time_ms: None,
            tested_at: None,
            keys: KeyPool::new(config.keys.clone(), config.multi_key),
        }
    }

    pub fn in_group(&self, group: &str) -> bool {
        self.groups.iter().any(|g| g == group)
    }

    pub fn supports_model(&self, model: &str) -> bool {
        self.models.iter().any(|m| m == model)
    }

    /// Whether the channel is configured for the group and model, regardless of status
    pub fn serves(&self, group: &str, model: &str) -> bool {
        self.in_group(group) && self.supports_model(model)
    }

    /// Enabled and holding at least one usable credential
    pub fn is_selectable(&self) -> bool {
        self.status.is_enabled() && self.keys.has_usable_key()
    }

    pub const fn is_multi_key(&self) -> bool {
        self.keys.is_multi_key()
    }

    /// Model name to send upstream for a requested model
    pub fn upstream_model(&self, model: &str) -> String {
        self.model_mapping
            .get(model)
            .cloned()
            .unwrap_or_else(|| model.to_owned())
    }

    /// Model used by health probes
    pub fn probe_model(&self) -> Option<&str> {
        self.test_model
            .as_deref()
            .filter(|m| !m.is_empty())
            .or_else(|| self.models.first().map(String::as_str))
    }

    /// Change the channel status, returning the previous one
    pub fn set_status(&mut self, status: ChannelStatus, reason: Option<&str>) -> ChannelStatus {
        let previous = self.status;

        self.status = status;
        self.status_reason = reason.map(str::to_owned);
        self.status_changed_at = Some(now_secs());

        previous
    }

    pub fn record_probe(&mut self, response_time_ms: u64) {
        self.response_time_ms = Some(response_time_ms);
        self.tested_at = Some(now_secs());
    }

    /// Bring the channel status in line with its slots after a slot mutation
    ///
    /// Losing the last enabled slot auto-disables the channel. Gaining an
    /// enabled slot re-enables a channel that was auto-disabled. Manual
    /// channel status is never touched.
    pub(crate) fn reconcile_key_status(&mut self, enabled_before: usize) {
        if !self.is_multi_key() {
            return;
        }

        let enabled_after = self.keys.enabled_count();

        match self.status {
            ChannelStatus::Enabled if enabled_after == 0 => {
                self.set_status(ChannelStatus::AutoDisabled, Some(ALL_KEYS_DISABLED));
                tracing::warn!(channel_id = self.id, channel_name = %self.name, "all keys disabled, channel auto-disabled");
            }
            ChannelStatus::AutoDisabled if enabled_after > enabled_before => {
                self.set_status(ChannelStatus::Enabled, None);
                tracing::info!(channel_id = self.id, channel_name = %self.name, "key re-enabled, channel enabled");
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel(extra: &str) -> Channel {
        let toml = format!(
            r#"
            id = 4
            name = "edge"
            base_url = "https://api.example.com"
            keys = ["sk-1", "sk-2"]
            models = ["gpt-4o", "gpt-4o-mini"]
            {extra}
            "#
        );
        Channel::from_config(&toml::from_str(&toml).unwrap())
    }

    #[test]
    fn disabled_in_config_starts_manually_disabled() {
        let channel = channel("status = \"disabled\"");
        assert_eq!(channel.status, ChannelStatus::ManuallyDisabled);
        assert!(!channel.is_selectable());
    }

    #[test]
    fn mapping_and_probe_model() {
        let channel = channel("[model_mapping]\n\"gpt-4o\" = \"gpt-4o-2024-08-06\"");
        assert_eq!(channel.upstream_model("gpt-4o"), "gpt-4o-2024-08-06");
        assert_eq!(channel.upstream_model("gpt-4o-mini"), "gpt-4o-mini");
        assert_eq!(channel.probe_model(), Some("gpt-4o"));
    }

    #[test]
    fn serves_checks_group_and_model() {
        let channel = channel("groups = [\"vip\"]");
        assert!(channel.serves("vip", "gpt-4o"));
        assert!(!channel.serves("default", "gpt-4o"));
        assert!(!channel.serves("vip", "claude-3"));
    }

    #[test]
    fn losing_every_slot_auto_disables() {
        let mut channel = channel("multi_key = \"polling\"");
        let before = channel.keys.enabled_count();
        channel.keys.disable(0, ChannelStatus::AutoDisabled, "401").unwrap();
        channel.keys.disable(1, ChannelStatus::AutoDisabled, "401").unwrap();
        channel.reconcile_key_status(before);

        assert_eq!(channel.status, ChannelStatus::AutoDisabled);
        assert_eq!(channel.status_reason.as_deref(), Some(ALL_KEYS_DISABLED));

        channel.keys.enable(1).unwrap();
        channel.reconcile_key_status(0);
        assert_eq!(channel.status, ChannelStatus::Enabled);
        assert!(channel.status_reason.is_none());
    }

    #[test]
    fn manual_status_survives_slot_changes() {
        let mut channel = channel("multi_key = \"polling\"\nstatus = \"disabled\"");
        channel.keys.disable_all("maintenance");
        channel.keys.enable_all();
        channel.reconcile_key_status(0);
        assert_eq!(channel.status, ChannelStatus::ManuallyDisabled);
    }
}
