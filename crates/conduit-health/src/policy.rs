use std::time::Duration;

use conduit_config::{ChannelHealthConfig, DispatchConfig, StatusCodeRanges};
use conduit_core::{ChannelStatus, RelayError};

const MIN_CODE: u16 = 100;
const MAX_CODE: u16 = 599;

/// Rules deciding whether a failure disables a channel or is worth a retry
#[derive(Debug, Clone)]
pub struct HealthPolicy {
    pub auto_disable: StatusCodeRanges,
    pub auto_retry: StatusCodeRanges,
    pub automatic_disable: bool,
    pub automatic_enable: bool,
    /// Lowercased message fragments
    pub disable_keywords: Vec<String>,
    pub disable_threshold: Option<Duration>,
}

impl HealthPolicy {
    pub fn new(dispatch: &DispatchConfig, health: &ChannelHealthConfig) -> Self {
        Self {
            auto_disable: dispatch.auto_disable_status_codes.clone(),
            auto_retry: dispatch.auto_retry_status_codes.clone(),
            automatic_disable: dispatch.automatic_disable,
            automatic_enable: dispatch.automatic_enable,
            disable_keywords: dispatch
                .disable_keywords
                .iter()
                .map(|k| k.trim().to_lowercase())
                .filter(|k| !k.is_empty())
                .collect(),
            disable_threshold: health.channel_disable_threshold,
        }
    }

    pub fn should_disable_by_status_code(&self, code: u16) -> bool {
        self.auto_disable.contains(code)
    }

    /// Codes outside 100-599 are always worth another channel
    pub fn should_retry_by_status_code(&self, code: u16) -> bool {
        if !(MIN_CODE..=MAX_CODE).contains(&code) {
            return true;
        }

        self.auto_retry.contains(code)
    }

    /// Whether a failure should take the channel (or its failing key) out of rotation
    pub fn should_disable(&self, error: &RelayError) -> bool {
        if !self.automatic_disable {
            return false;
        }

        if error.is_channel_error() {
            return true;
        }

        if error.is_skip_retry() {
            return false;
        }

        if self.should_disable_by_status_code(error.status()) {
            return true;
        }

        let message = error.to_string().to_lowercase();
        self.disable_keywords.iter().any(|keyword| message.contains(keyword))
    }

    /// Whether a failure may be retried on another channel, ignoring the retry budget
    pub fn should_retry(&self, error: &RelayError) -> bool {
        if error.is_channel_error() {
            return true;
        }

        if error.is_skip_retry() {
            return false;
        }

        self.should_retry_by_status_code(error.status())
    }

    /// Whether a successful probe should bring the channel back
    pub fn should_enable(&self, probe_succeeded: bool, status: ChannelStatus) -> bool {
        self.automatic_enable && probe_succeeded && status == ChannelStatus::AutoDisabled
    }

    /// Whether a probe took longer than the configured threshold
    pub fn exceeds_threshold(&self, elapsed: Duration) -> bool {
        self.disable_threshold.is_some_and(|threshold| elapsed > threshold)
    }
}
