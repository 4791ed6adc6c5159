use conduit_core::ChannelId;
use thiserror::Error;

/// Credential pool errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyError {
    /// Every slot of the channel is disabled
    #[error("no enabled key available")]
    NoEnabledKey,

    /// Slot index does not exist
    #[error("key index {index} out of range (channel has {len} keys)")]
    IndexOutOfRange { index: usize, len: usize },

    /// Deleting the only remaining slot
    #[error("cannot delete the last remaining key")]
    LastKey,

    /// Deleting would leave the channel without credentials
    #[error("cannot delete every key of the channel")]
    WouldDeleteAll,

    /// Slot operations on a channel that has a single credential
    #[error("channel is not a multi-key channel")]
    NotMultiKey,
}

/// Channel registry errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelStoreError {
    /// No channel with this id
    #[error("channel {0} not found")]
    NotFound(ChannelId),

    /// Credential pool rejected the operation
    #[error(transparent)]
    Key(#[from] KeyError),
}
