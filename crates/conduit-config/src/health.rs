use std::time::Duration;

use serde::Deserialize;

/// Health check endpoint configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HealthConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_path")]
    pub path: String,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: default_path(),
        }
    }
}

/// Channel probing and automatic health management
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChannelHealthConfig {
    /// Probe latency above which a channel counts as failing
    #[serde(default, deserialize_with = "crate::duration::deserialize_optional")]
    pub channel_disable_threshold: Option<Duration>,
    /// Pause between channels during a test-all sweep
    #[serde(default = "default_request_interval", deserialize_with = "crate::duration::deserialize")]
    pub request_interval: Duration,
    /// Run a test-all sweep on this schedule
    #[serde(default, deserialize_with = "crate::duration::deserialize_optional")]
    pub auto_test_interval: Option<Duration>,
}

impl Default for ChannelHealthConfig {
    fn default() -> Self {
        Self {
            channel_disable_threshold: None,
            request_interval: default_request_interval(),
            auto_test_interval: None,
        }
    }
}

#[allow(clippy::missing_const_for_fn)]
fn default_enabled() -> bool {
    true
}

fn default_path() -> String {
    "/health".to_string()
}

const fn default_request_interval() -> Duration {
    Duration::from_millis(0)
}
