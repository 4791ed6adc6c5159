use std::sync::{Arc, RwLock, RwLockReadGuard};
use std::time::Duration;

use conduit_channels::{ChannelEntry, ChannelStore, ChannelStoreError};
use conduit_config::{ChannelHealthConfig, DispatchConfig, StatusCodeRangeError, StatusCodeRanges};
use conduit_core::{ChannelError, ChannelId, ChannelStatus, RelayError, fingerprint};
use secrecy::ExposeSecret;
use tokio::task::JoinHandle;

use crate::policy::HealthPolicy;

const MANUAL_DISABLE_REASON: &str = "disabled by operator";

/// Result of probing one channel
#[derive(Debug, Clone)]
pub struct ProbeOutcome {
    pub channel_id: ChannelId,
    /// Slot the probe used
    pub key_index: usize,
    pub elapsed: Duration,
    pub error: Option<RelayError>,
}

impl ProbeOutcome {
    pub const fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// What a probe changed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeAction {
    Disabled,
    Enabled,
    Unchanged,
}

/// Applies failure classification to channel and credential state
///
/// Never retries anything itself. Status-code rules can be replaced at
/// runtime, everything else is fixed at startup.
#[derive(Debug)]
pub struct HealthManager {
    channels: Arc<ChannelStore>,
    policy: RwLock<HealthPolicy>,
}

impl HealthManager {
    pub fn new(channels: Arc<ChannelStore>, dispatch: &DispatchConfig, health: &ChannelHealthConfig) -> Self {
        Self {
            channels,
            policy: RwLock::new(HealthPolicy::new(dispatch, health)),
        }
    }

    pub fn channels(&self) -> &Arc<ChannelStore> {
        &self.channels
    }

    pub fn policy(&self) -> RwLockReadGuard<'_, HealthPolicy> {
        self.policy.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn should_disable(&self, error: &RelayError) -> bool {
        self.policy().should_disable(error)
    }

    pub fn should_retry(&self, error: &RelayError) -> bool {
        self.policy().should_retry(error)
    }

    /// Replace the status-code rules
    ///
    /// Both inputs are validated before either is applied.
    pub fn update_status_codes(
        &self,
        auto_disable: Option<&str>,
        auto_retry: Option<&str>,
    ) -> Result<(String, String), StatusCodeRangeError> {
        let auto_disable = auto_disable.map(StatusCodeRanges::parse);
        let auto_retry = auto_retry.map(StatusCodeRanges::parse);

        let invalid: Vec<String> = [&auto_disable, &auto_retry]
            .into_iter()
            .flatten()
            .filter_map(|parsed| parsed.as_ref().err())
            .flat_map(|e| e.invalid.iter().cloned())
            .collect();

        if !invalid.is_empty() {
            return Err(StatusCodeRangeError { invalid });
        }

        let mut policy = self.policy.write().unwrap_or_else(|e| e.into_inner());

        if let Some(Ok(ranges)) = auto_disable {
            policy.auto_disable = ranges;
        }

        if let Some(Ok(ranges)) = auto_retry {
            policy.auto_retry = ranges;
        }

        tracing::info!(
            auto_disable = %policy.auto_disable,
            auto_retry = %policy.auto_retry,
            "status code rules updated"
        );

        Ok((policy.auto_disable.to_string(), policy.auto_retry.to_string()))
    }

    /// Process a failed attempt on a background task so the response is never blocked
    pub fn report(self: &Arc<Self>, channel_error: ChannelError, error: RelayError) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            manager.process_channel_error(&channel_error, &error);
        })
    }

    /// Log a failed attempt and disable the channel or its failing key when policy allows
    ///
    /// Returns whether anything was disabled.
    pub fn process_channel_error(&self, channel_error: &ChannelError, error: &RelayError) -> bool {
        tracing::warn!(
            channel_id = channel_error.channel_id,
            channel_name = %channel_error.channel_name,
            channel_kind = %channel_error.channel_kind,
            key_index = channel_error.key_index,
            key_fingerprint = %channel_error.key_fingerprint,
            status = error.status(),
            error = %error,
            "channel request failed"
        );

        if !channel_error.auto_ban || !self.should_disable(error) {
            return false;
        }

        let reason = error.to_string();

        if channel_error.is_multi_key {
            self.auto_disable_key(channel_error, &reason)
        } else {
            self.auto_disable_channel(channel_error.channel_id, &reason)
        }
    }

    fn auto_disable_key(&self, channel_error: &ChannelError, reason: &str) -> bool {
        let Ok(entry) = self.channels.get(channel_error.channel_id) else {
            return false;
        };

        match entry.update_keys(|keys| keys.disable(channel_error.key_index, ChannelStatus::AutoDisabled, reason)) {
            Ok(changed) => {
                if changed {
                    tracing::warn!(
                        channel_id = channel_error.channel_id,
                        key_index = channel_error.key_index,
                        key_fingerprint = %channel_error.key_fingerprint,
                        reason,
                        "key auto-disabled"
                    );
                }
                changed
            }
            Err(e) => {
                tracing::warn!(
                    channel_id = channel_error.channel_id,
                    key_index = channel_error.key_index,
                    error = %e,
                    "failed to disable key"
                );
                false
            }
        }
    }

    /// Auto-disable an enabled channel, returning whether it changed
    pub fn auto_disable_channel(&self, channel_id: ChannelId, reason: &str) -> bool {
        let Ok(entry) = self.channels.get(channel_id) else {
            return false;
        };

        let mut channel = entry.lock();

        if !channel.status.is_enabled() {
            return false;
        }

        channel.set_status(ChannelStatus::AutoDisabled, Some(reason));
        tracing::warn!(channel_id, channel_name = %channel.name, reason, "channel auto-disabled");

        true
    }

    /// Re-enable an auto-disabled channel, returning whether it changed
    pub fn auto_enable_channel(&self, channel_id: ChannelId) -> bool {
        let Ok(entry) = self.channels.get(channel_id) else {
            return false;
        };

        let mut channel = entry.lock();

        if channel.status != ChannelStatus::AutoDisabled {
            return false;
        }

        channel.set_status(ChannelStatus::Enabled, None);
        tracing::info!(channel_id, channel_name = %channel.name, "channel re-enabled after successful probe");

        true
    }

    /// Operator enable
    pub fn enable_channel(&self, channel_id: ChannelId) -> Result<ChannelStatus, ChannelStoreError> {
        let entry = self.channels.get(channel_id)?;
        let previous = entry.lock().set_status(ChannelStatus::Enabled, None);

        tracing::info!(channel_id, previous = %previous, "channel enabled");

        Ok(previous)
    }

    /// Operator disable
    pub fn disable_channel(&self, channel_id: ChannelId) -> Result<ChannelStatus, ChannelStoreError> {
        let entry = self.channels.get(channel_id)?;
        let previous = entry
            .lock()
            .set_status(ChannelStatus::ManuallyDisabled, Some(MANUAL_DISABLE_REASON));

        tracing::info!(channel_id, previous = %previous, "channel disabled");

        Ok(previous)
    }

    /// Enable every channel carrying the tag, returning how many matched
    pub fn enable_tag(&self, tag: &str) -> usize {
        self.set_tag_status(tag, ChannelStatus::Enabled, None)
    }

    /// Disable every channel carrying the tag, returning how many matched
    pub fn disable_tag(&self, tag: &str) -> usize {
        self.set_tag_status(tag, ChannelStatus::ManuallyDisabled, Some(MANUAL_DISABLE_REASON))
    }

    fn set_tag_status(&self, tag: &str, status: ChannelStatus, reason: Option<&str>) -> usize {
        let entries = self.channels.tagged(tag);

        for entry in &entries {
            entry.lock().set_status(status, reason);
        }

        tracing::info!(tag, status = %status, count = entries.len(), "tag status updated");

        entries.len()
    }

    /// Apply a probe result: record latency, then disable or re-enable
    pub fn apply_probe(&self, entry: &ChannelEntry, outcome: &ProbeOutcome) -> ProbeAction {
        let elapsed_ms = u64::try_from(outcome.elapsed.as_millis()).unwrap_or(u64::MAX);
        let channel = {
            let mut channel = entry.lock();
            channel.record_probe(elapsed_ms);
            channel.clone()
        };

        let (should_enable, should_disable, threshold) = {
            let policy = self.policy();
            let over_threshold = policy.automatic_disable && policy.exceeds_threshold(outcome.elapsed);
            let should_disable =
                over_threshold || outcome.error.as_ref().is_some_and(|e| policy.should_disable(e));

            (
                policy.should_enable(outcome.succeeded(), channel.status),
                should_disable,
                policy.disable_threshold,
            )
        };

        if channel.status.is_enabled() && should_disable && channel.auto_ban {
            let error = outcome.error.clone().unwrap_or_else(|| RelayError::Channel {
                status: 0,
                message: format!(
                    "response time {elapsed_ms}ms exceeds threshold {}ms",
                    threshold.map_or(0, |t| t.as_millis())
                ),
            });

            let key_fingerprint = channel
                .keys
                .slot(outcome.key_index)
                .map(|slot| fingerprint(slot.key.expose_secret()))
                .unwrap_or_default();

            let channel_error = ChannelError {
                channel_id: channel.id,
                channel_kind: channel.kind.as_str().to_owned(),
                channel_name: channel.name.clone(),
                is_multi_key: channel.is_multi_key(),
                key_index: outcome.key_index,
                key_fingerprint,
                auto_ban: channel.auto_ban,
            };

            if self.process_channel_error(&channel_error, &error) {
                return ProbeAction::Disabled;
            }

            return ProbeAction::Unchanged;
        }

        let key_enabled =
            should_enable && channel.is_multi_key() && self.auto_enable_key(entry, outcome.key_index);

        if key_enabled || (should_enable && self.auto_enable_channel(channel.id)) {
            return ProbeAction::Enabled;
        }

        ProbeAction::Unchanged
    }

    /// Re-enable one auto-disabled slot; restoring the slot also restores a channel disabled for having no keys
    fn auto_enable_key(&self, entry: &ChannelEntry, key_index: usize) -> bool {
        let result = entry.update_keys(|keys| {
            if keys.slot(key_index).is_none_or(|slot| slot.status != ChannelStatus::AutoDisabled) {
                return Ok(false);
            }
            keys.enable(key_index)
        });

        match result {
            Ok(changed) => {
                if changed {
                    tracing::info!(channel_id = entry.id(), key_index, "key re-enabled after successful probe");
                }
                changed
            }
            Err(e) => {
                tracing::warn!(channel_id = entry.id(), key_index, error = %e, "failed to re-enable key");
                false
            }
        }
    }
}
