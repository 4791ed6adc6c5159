use std::time::Duration;

use serde::Deserialize;

/// Background reconciliation of long-running generation tasks
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TasksConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Time between sweeps
    #[serde(default = "default_poll_interval", deserialize_with = "crate::duration::deserialize")]
    pub poll_interval: Duration,
    /// Unfinished tasks older than this are failed and refunded, `0s` keeps them forever
    #[serde(default = "default_timeout", deserialize_with = "crate::duration::deserialize_optional")]
    pub timeout: Option<Duration>,
    /// Maximum tasks handled by the timeout pass of one sweep
    #[serde(default = "default_batch_limit")]
    pub batch_limit: usize,
}

impl Default for TasksConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            poll_interval: default_poll_interval(),
            timeout: default_timeout(),
            batch_limit: default_batch_limit(),
        }
    }
}

const fn default_enabled() -> bool {
    true
}

const fn default_poll_interval() -> Duration {
    Duration::from_secs(15)
}

const fn default_timeout() -> Option<Duration> {
    Some(Duration::from_secs(24 * 60 * 60))
}

const fn default_batch_limit() -> usize {
    100
}
