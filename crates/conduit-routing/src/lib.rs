#![allow(clippy::must_use_candidate, clippy::missing_errors_doc)]

pub mod affinity;
pub mod selector;

pub use affinity::{AffinityCache, AffinityError, AffinityMatch, AffinityRequest, AffinityStats, UsageCacheStats};
pub use selector::{AUTO_GROUP, ChannelSelector, SelectError, SelectedChannel, normalize_model};
