use std::collections::HashSet;
use std::path::Path;

use anyhow::{Context, bail};
use secrecy::ExposeSecret;

use crate::Config;

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Reads the file, expands `{{ env.VAR }}` placeholders, then
    /// deserializes and validates the result.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;

        Self::from_toml(&raw)
    }

    /// Parse and validate configuration text
    pub fn from_toml(raw: &str) -> anyhow::Result<Self> {
        let expanded = crate::env::expand_env(raw).context("config variable expansion failed")?;
        let config: Self = toml::from_str(&expanded).context("failed to parse config")?;

        config.validate()?;

        Ok(config)
    }

    /// Validate that the configuration is internally consistent
    pub fn validate(&self) -> anyhow::Result<()> {
        self.validate_channels()?;
        self.validate_affinity()?;
        self.validate_tenants()?;
        self.validate_admin()?;
        self.validate_tasks()?;
        Ok(())
    }

    fn validate_channels(&self) -> anyhow::Result<()> {
        if self.channels.is_empty() {
            bail!("at least one channel must be configured");
        }

        let mut ids = HashSet::new();

        for channel in &self.channels {
            if !ids.insert(channel.id) {
                bail!("duplicate channel id {}", channel.id);
            }

            if channel.keys.is_empty() {
                bail!("channel '{}' must have at least one key", channel.name);
            }

            if channel.keys.iter().any(|key| key.expose_secret().trim().is_empty()) {
                bail!("channel '{}' has an empty key", channel.name);
            }

            if channel.models.is_empty() {
                bail!("channel '{}' must serve at least one model", channel.name);
            }
        }

        Ok(())
    }

    fn validate_affinity(&self) -> anyhow::Result<()> {
        let mut names = HashSet::new();

        for rule in &self.affinity.rules {
            if rule.name.trim().is_empty() {
                bail!("affinity rule names must not be empty");
            }

            if !names.insert(rule.name.as_str()) {
                bail!("duplicate affinity rule '{}'", rule.name);
            }

            if rule.model_regex.is_empty() {
                bail!("affinity rule '{}' needs at least one model_regex", rule.name);
            }

            if rule.key_sources.is_empty() {
                bail!("affinity rule '{}' needs at least one key source", rule.name);
            }

            let patterns = rule
                .model_regex
                .iter()
                .chain(&rule.path_regex)
                .chain(rule.value_regex.as_ref());

            for pattern in patterns {
                regex::Regex::new(pattern)
                    .with_context(|| format!("invalid pattern in affinity rule '{}'", rule.name))?;
            }
        }

        Ok(())
    }

    fn validate_tenants(&self) -> anyhow::Result<()> {
        let mut ids = HashSet::new();
        let mut tokens = HashSet::new();

        for tenant in &self.tenants {
            if !ids.insert(tenant.id) {
                bail!("duplicate tenant id {}", tenant.id);
            }

            let token = tenant.token.expose_secret();

            if token.is_empty() {
                bail!("tenant '{}' has an empty token", tenant.name);
            }

            if !tokens.insert(token) {
                bail!("tenant '{}' reuses another tenant's token", tenant.name);
            }
        }

        Ok(())
    }

    fn validate_admin(&self) -> anyhow::Result<()> {
        if let Some(ref admin) = self.admin
            && admin.enabled
            && admin.token.expose_secret().is_empty()
        {
            bail!("admin.token must not be empty when the admin API is enabled");
        }

        Ok(())
    }

    fn validate_tasks(&self) -> anyhow::Result<()> {
        if self.tasks.enabled && self.tasks.poll_interval.is_zero() {
            bail!("tasks.poll_interval must be greater than 0");
        }

        if self.tasks.batch_limit == 0 {
            bail!("tasks.batch_limit must be greater than 0");
        }

        Ok(())
    }
}
