use std::sync::{Arc, LazyLock};

use conduit_channels::{Channel, ChannelEntry, ChannelStore};
use conduit_core::{ChannelId, RelayError};
use rand::Rng;
use regex::Regex;
use thiserror::Error;

use crate::affinity::{AffinityCache, AffinityMatch};

/// Group that walks the configured fallback groups in order
pub const AUTO_GROUP: &str = "auto";

const WEIGHT_SMOOTHING: u64 = 10;

static DATE_SUFFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"-(\d{4}-\d{2}-\d{2}|\d{8})$").expect("must be valid regex"));

/// Channel selection errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SelectError {
    /// Nothing serves the group and model, whatever its status
    #[error("no channel configured for model '{model}' in group '{group}'")]
    NoChannelConfigured { group: String, model: String },

    /// Channels exist but none is currently usable
    #[error("no available channel for model '{model}' in group '{group}'")]
    NoHealthyChannel { group: String, model: String },

    /// Pinned channel id does not exist
    #[error("channel {0} not found")]
    ChannelNotFound(ChannelId),

    /// Pinned channel cannot serve the request
    #[error("channel {channel_id} cannot serve this request: {reason}")]
    ChannelUnavailable { channel_id: ChannelId, reason: String },
}

impl From<SelectError> for RelayError {
    fn from(e: SelectError) -> Self {
        match e {
            SelectError::ChannelNotFound(_) | SelectError::ChannelUnavailable { .. } => {
                Self::InvalidRequest(e.to_string())
            }
            SelectError::NoChannelConfigured { .. } | SelectError::NoHealthyChannel { .. } => {
                Self::NoChannel(e.to_string())
            }
        }
    }
}

/// Outcome of a successful selection
#[derive(Debug, Clone)]
pub struct SelectedChannel {
    pub entry: Arc<ChannelEntry>,
    /// Channel state at selection time
    pub channel: Channel,
    /// Group the channel was selected for, resolved from `auto` when needed
    pub group: String,
    /// Chosen through an affinity hit
    pub pinned: bool,
}

/// Lowercase a model name and strip a trailing release date
///
/// `GPT-4o-2024-08-06` and `gpt-4o-20240806` both become `gpt-4o`.
pub fn normalize_model(model: &str) -> String {
    DATE_SUFFIX.replace(&model.to_lowercase(), "").into_owned()
}

/// Picks one healthy channel for a group and model
#[derive(Debug)]
pub struct ChannelSelector {
    channels: Arc<ChannelStore>,
    affinity: Arc<AffinityCache>,
    auto_groups: Vec<String>,
}

impl ChannelSelector {
    pub const fn new(channels: Arc<ChannelStore>, affinity: Arc<AffinityCache>, auto_groups: Vec<String>) -> Self {
        Self {
            channels,
            affinity,
            auto_groups,
        }
    }

    pub const fn affinity(&self) -> &Arc<AffinityCache> {
        &self.affinity
    }

    /// Select a channel, honouring a live affinity pin first
    pub fn select(
        &self,
        group: &str,
        model: &str,
        exclude: &[ChannelId],
        affinity: Option<&AffinityMatch>,
    ) -> Result<SelectedChannel, SelectError> {
        if let Some(selected) = affinity.and_then(|m| self.select_affinity(group, model, exclude, m)) {
            return Ok(selected);
        }

        if group != AUTO_GROUP {
            return self.select_in_group(group, model, exclude);
        }

        let mut configured = false;

        for candidate_group in &self.auto_groups {
            match self.select_in_group(candidate_group, model, exclude) {
                Ok(selected) => return Ok(selected),
                Err(SelectError::NoHealthyChannel { .. }) => configured = true,
                Err(_) => {}
            }
        }

        let (group, model) = (group.to_owned(), model.to_owned());
        Err(if configured {
            SelectError::NoHealthyChannel { group, model }
        } else {
            SelectError::NoChannelConfigured { group, model }
        })
    }

    /// Use a caller-pinned channel, bypassing group membership
    pub fn select_pinned(&self, channel_id: ChannelId, model: &str) -> Result<SelectedChannel, SelectError> {
        let entry = self
            .channels
            .get(channel_id)
            .map_err(|_| SelectError::ChannelNotFound(channel_id))?;
        let channel = entry.snapshot();

        let unavailable = |reason: &str| SelectError::ChannelUnavailable {
            channel_id,
            reason: reason.to_owned(),
        };

        if !channel.status.is_enabled() {
            return Err(unavailable("channel is disabled"));
        }

        if !channel.keys.has_usable_key() {
            return Err(unavailable("channel has no enabled key"));
        }

        if !channel.supports_model(model) && !channel.supports_model(&normalize_model(model)) {
            return Err(unavailable("model is not supported"));
        }

        let group = channel.groups.first().cloned().unwrap_or_default();

        Ok(SelectedChannel {
            entry,
            channel,
            group,
            pinned: false,
        })
    }

    fn select_affinity(
        &self,
        group: &str,
        model: &str,
        exclude: &[ChannelId],
        affinity: &AffinityMatch,
    ) -> Option<SelectedChannel> {
        let channel_id = self.affinity.lookup(affinity)?;

        if exclude.contains(&channel_id) {
            return None;
        }

        let entry = self.channels.get(channel_id).ok()?;
        let channel = entry.snapshot();

        if !channel.is_selectable() {
            return None;
        }

        let normalized = normalize_model(model);
        let serves = |g: &str| channel.serves(g, model) || channel.serves(g, &normalized);

        let group = if group == AUTO_GROUP {
            self.auto_groups.iter().find(|g| serves(g.as_str()))?.clone()
        } else if serves(group) {
            group.to_owned()
        } else {
            return None;
        };

        tracing::debug!(
            channel_id,
            rule = %affinity.rule_name,
            key_hint = %affinity.key_hint,
            "affinity hit"
        );

        Some(SelectedChannel {
            entry,
            channel,
            group,
            pinned: true,
        })
    }

    fn select_in_group(&self, group: &str, model: &str, exclude: &[ChannelId]) -> Result<SelectedChannel, SelectError> {
        let snapshots: Vec<(Arc<ChannelEntry>, Channel)> = self
            .channels
            .all()
            .into_iter()
            .map(|entry| {
                let channel = entry.snapshot();
                (entry, channel)
            })
            .filter(|(_, channel)| channel.in_group(group))
            .collect();

        let normalized = normalize_model(model);
        let mut configured = false;

        for name in [model, normalized.as_str()] {
            let serving: Vec<_> = snapshots
                .iter()
                .filter(|(_, channel)| channel.supports_model(name))
                .collect();

            configured |= !serving.is_empty();

            let candidates: Vec<_> = serving
                .into_iter()
                .filter(|(entry, channel)| channel.is_selectable() && !exclude.contains(&entry.id()))
                .collect();

            if let Some((entry, channel)) = pick_weighted(&candidates) {
                return Ok(SelectedChannel {
                    entry: Arc::clone(entry),
                    channel: channel.clone(),
                    group: group.to_owned(),
                    pinned: false,
                });
            }

            if name == normalized {
                break;
            }
        }

        let (group, model) = (group.to_owned(), model.to_owned());
        Err(if configured {
            SelectError::NoHealthyChannel { group, model }
        } else {
            SelectError::NoChannelConfigured { group, model }
        })
    }
}

/// Weighted random pick within the highest priority tier
///
/// Every weight is smoothed by a constant so zero-weight channels still
/// get traffic and equal weights are uniform.
fn pick_weighted<'a>(
    candidates: &[&'a (Arc<ChannelEntry>, Channel)],
) -> Option<&'a (Arc<ChannelEntry>, Channel)> {
    let top = candidates.iter().map(|(_, channel)| channel.priority).max()?;

    let tier: Vec<_> = candidates
        .iter()
        .copied()
        .filter(|(_, channel)| channel.priority == top)
        .collect();

    let total: u64 = tier
        .iter()
        .map(|(_, channel)| u64::from(channel.weight) + WEIGHT_SMOOTHING)
        .sum();

    let mut roll = rand::rng().random_range(0..total);

    for &candidate in &tier {
        let weight = u64::from(candidate.1.weight) + WEIGHT_SMOOTHING;
        if roll < weight {
            return Some(candidate);
        }
        roll -= weight;
    }

    tier.last().copied()
}
