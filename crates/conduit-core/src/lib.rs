#![allow(clippy::must_use_candidate, clippy::missing_errors_doc)]

mod channel;
mod context;
mod error;
mod guard;
mod usage;

pub use channel::{ChannelError, ChannelId, ChannelStatus, fingerprint, now_secs};
pub use context::{DispatchContext, Tenant, new_request_id};
pub use error::{HttpError, RelayError};
pub use guard::{RunGuard, RunPermit};
pub use usage::{Quote, Usage};
