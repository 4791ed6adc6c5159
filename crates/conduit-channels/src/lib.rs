#![allow(clippy::must_use_candidate, clippy::missing_errors_doc)]

mod channel;
mod error;
pub mod multi_key;
mod store;

pub use channel::{ALL_KEYS_DISABLED, Channel};
pub use error::{ChannelStoreError, KeyError};
pub use multi_key::{KeyInfo, KeyPage, KeyPool, KeySlot, SelectedKey};
pub use store::{ChannelEntry, ChannelStore};
