use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Numeric channel identifier
pub type ChannelId = i64;

/// Lifecycle state shared by channels and credential slots
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelStatus {
    /// Eligible for selection
    #[default]
    Enabled,
    /// Disabled by an operator, never re-enabled automatically
    ManuallyDisabled,
    /// Disabled by the health manager, may be re-enabled by a successful probe
    AutoDisabled,
}

impl ChannelStatus {
    pub const fn is_enabled(self) -> bool {
        matches!(self, Self::Enabled)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Enabled => "enabled",
            Self::ManuallyDisabled => "manually_disabled",
            Self::AutoDisabled => "auto_disabled",
        }
    }
}

impl fmt::Display for ChannelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Description of one failed attempt, handed to the health manager
///
/// Captured at failure time so that asynchronous processing never reads
/// channel state that a concurrent request has already changed.
#[derive(Debug, Clone)]
pub struct ChannelError {
    pub channel_id: ChannelId,
    /// Provider kind label (e.g. `openai`)
    pub channel_kind: String,
    pub channel_name: String,
    pub is_multi_key: bool,
    /// Credential slot that produced the failure
    pub key_index: usize,
    /// Short digest of the credential, safe to log
    pub key_fingerprint: String,
    /// Whether the channel permits automatic disabling
    pub auto_ban: bool,
}

/// First 8 hex characters of the SHA-256 digest of `value`
///
/// Empty input yields an empty fingerprint.
pub fn fingerprint(value: &str) -> String {
    if value.is_empty() {
        return String::new();
    }

    let digest = Sha256::digest(value.as_bytes());
    digest.iter().take(4).map(|b| format!("{b:02x}")).collect()
}

/// Current unix time in seconds
pub fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}
