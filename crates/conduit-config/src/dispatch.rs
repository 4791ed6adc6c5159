use std::time::Duration;

use serde::Deserialize;

use crate::status_codes::StatusCodeRanges;

/// Retry loop and error classification settings
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DispatchConfig {
    /// Additional attempts after the first one
    #[serde(default = "default_retry_times")]
    pub retry_times: u32,
    /// Upper bound for a single provider call
    #[serde(default = "default_request_timeout", deserialize_with = "crate::duration::deserialize")]
    pub request_timeout: Duration,
    /// Upstream status codes that disable the channel (when `auto_ban` allows)
    #[serde(default = "StatusCodeRanges::default_disable")]
    pub auto_disable_status_codes: StatusCodeRanges,
    /// Upstream status codes worth retrying on another channel
    #[serde(default = "StatusCodeRanges::default_retry")]
    pub auto_retry_status_codes: StatusCodeRanges,
    /// Groups tried in order when a tenant uses the `auto` group
    #[serde(default)]
    pub auto_groups: Vec<String>,
    /// Master switch for automatic disabling
    #[serde(default = "default_true")]
    pub automatic_disable: bool,
    /// Master switch for automatic re-enabling after a successful probe
    #[serde(default = "default_true")]
    pub automatic_enable: bool,
    /// Error message fragments that disable a channel regardless of status
    #[serde(default = "default_disable_keywords")]
    pub disable_keywords: Vec<String>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            retry_times: default_retry_times(),
            request_timeout: default_request_timeout(),
            auto_disable_status_codes: StatusCodeRanges::default_disable(),
            auto_retry_status_codes: StatusCodeRanges::default_retry(),
            auto_groups: Vec::new(),
            automatic_disable: true,
            automatic_enable: true,
            disable_keywords: default_disable_keywords(),
        }
    }
}

const fn default_retry_times() -> u32 {
    3
}

const fn default_request_timeout() -> Duration {
    Duration::from_secs(300)
}

const fn default_true() -> bool {
    true
}

fn default_disable_keywords() -> Vec<String> {
    [
        "your credit balance is too low",
        "this organization has been disabled",
        "you exceeded your current quota",
        "permission denied",
        "the security token included in the request is invalid",
        "operation not allowed",
        "your account is not authorized",
    ]
    .into_iter()
    .map(str::to_owned)
    .collect()
}
