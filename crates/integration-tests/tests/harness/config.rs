//! Configuration builder for integration tests
//!
//! Renders TOML and runs it through the regular loader, so every test also
//! exercises parsing and validation.

use std::fmt::Write;

use conduit_config::Config;

pub const TENANT_TOKEN: &str = "sk-tenant";
pub const ADMIN_TENANT_TOKEN: &str = "sk-ops";
pub const ADMIN_TOKEN: &str = "sk-admin";

/// One channel entry
pub struct TestChannel {
    id: i64,
    base_url: String,
    keys: Vec<String>,
    priority: i64,
    models: Vec<String>,
    extra: Vec<String>,
}

impl TestChannel {
    pub fn new(id: i64, base_url: &str) -> Self {
        Self {
            id,
            base_url: base_url.to_owned(),
            keys: vec![format!("sk-channel-{id}")],
            priority: 0,
            models: vec!["gpt-4o".to_owned(), "sora-2".to_owned()],
            extra: Vec::new(),
        }
    }

    pub const fn priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    /// Multi-key channel with polling rotation
    pub fn keys(mut self, keys: &[&str]) -> Self {
        self.keys = keys.iter().map(|k| (*k).to_owned()).collect();
        self.extra.push("multi_key = \"polling\"".to_owned());
        self
    }

    pub fn no_auto_ban(mut self) -> Self {
        self.extra.push("auto_ban = false".to_owned());
        self
    }

    pub fn tag(mut self, tag: &str) -> Self {
        self.extra.push(format!("tag = \"{tag}\""));
        self
    }

    pub fn map_model(mut self, from: &str, to: &str) -> Self {
        self.extra.push(format!("model_mapping = {{ \"{from}\" = \"{to}\" }}"));
        self
    }

    fn render(&self, out: &mut String) {
        let quoted = |items: &[String]| {
            items
                .iter()
                .map(|item| format!("\"{item}\""))
                .collect::<Vec<_>>()
                .join(", ")
        };

        let _ = writeln!(out, "[[channels]]");
        let _ = writeln!(out, "id = {}", self.id);
        let _ = writeln!(out, "name = \"channel-{}\"", self.id);
        let _ = writeln!(out, "base_url = \"{}\"", self.base_url);
        let _ = writeln!(out, "keys = [{}]", quoted(&self.keys));
        let _ = writeln!(out, "priority = {}", self.priority);
        let _ = writeln!(out, "models = [{}]", quoted(&self.models));
        for line in &self.extra {
            let _ = writeln!(out, "{line}");
        }
        out.push('\n');
    }
}

/// Builder for test configurations
pub struct ConfigBuilder {
    channels: Vec<TestChannel>,
    retry_times: u32,
    tenant_quota: i64,
    admin: bool,
    sections: Vec<String>,
}

impl ConfigBuilder {
    /// One tenant with a comfortable balance, admin API enabled
    pub fn new() -> Self {
        Self {
            channels: Vec::new(),
            retry_times: 3,
            tenant_quota: 100_000,
            admin: true,
            sections: Vec::new(),
        }
    }

    pub fn with_channel(mut self, channel: TestChannel) -> Self {
        self.channels.push(channel);
        self
    }

    pub const fn with_retry_times(mut self, retry_times: u32) -> Self {
        self.retry_times = retry_times;
        self
    }

    pub const fn with_tenant_quota(mut self, quota: i64) -> Self {
        self.tenant_quota = quota;
        self
    }

    pub const fn without_admin(mut self) -> Self {
        self.admin = false;
        self
    }

    /// Append a raw TOML section
    pub fn with_section(mut self, toml: &str) -> Self {
        self.sections.push(toml.to_owned());
        self
    }

    pub fn render(&self) -> String {
        let mut out = String::new();

        let _ = writeln!(out, "[server]\nlisten_address = \"127.0.0.1:0\"\n");
        let _ = writeln!(out, "[dispatch]\nretry_times = {}\nrequest_timeout = \"10s\"\n", self.retry_times);
        let _ = writeln!(out, "[tasks]\npoll_interval = \"1h\"\n");

        if self.admin {
            let _ = writeln!(out, "[admin]\ntoken = \"{ADMIN_TOKEN}\"\n");
        }

        let _ = writeln!(out, "[billing.models.\"gpt-4o\"]\nratio = 1.0\n");
        let _ = writeln!(out, "[billing.models.\"sora-2\"]\nprice = 0.001\n");

        for section in &self.sections {
            let _ = writeln!(out, "{section}\n");
        }

        let _ = writeln!(
            out,
            "[[tenants]]\nid = 7\nname = \"acme\"\ntoken = \"{TENANT_TOKEN}\"\nquota = {}\n",
            self.tenant_quota
        );
        let _ = writeln!(
            out,
            "[[tenants]]\nid = 8\nname = \"ops\"\ntoken = \"{ADMIN_TENANT_TOKEN}\"\nquota = 100000\nadmin = true\n"
        );

        for channel in &self.channels {
            channel.render(&mut out);
        }

        out
    }

    pub fn build(&self) -> Config {
        Config::from_toml(&self.render()).expect("test config must be valid")
    }
}
