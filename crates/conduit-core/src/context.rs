use crate::channel::ChannelId;
use crate::usage::Quote;

/// Tenant resolved from the caller's credentials
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tenant {
    pub id: i64,
    pub name: String,
    /// Pricing and routing group (e.g. "default", "vip", "auto")
    pub group: String,
    /// Whether the tenant may pin a specific channel
    pub admin: bool,
}

/// Fresh request correlation id
pub fn new_request_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Per-request dispatch state
///
/// Created when a request arrives and dropped when it completes. Threaded
/// by reference through selection, billing and the retry loop.
#[derive(Debug, Clone)]
pub struct DispatchContext {
    /// Correlation id surfaced in error messages and logs
    pub request_id: String,
    pub tenant: Tenant,
    /// Group used for selection, may differ from the tenant group for `auto`
    pub group: String,
    /// Model name requested by the caller
    pub model: String,
    /// Model name sent upstream after channel mapping
    pub upstream_model: Option<String>,
    /// Attempts left after the current one
    pub retry_remaining: u32,
    /// Channels already tried, in order
    pub used_channels: Vec<ChannelId>,
    pub quote: Option<Quote>,
    /// Quota units actually reserved from the ledger
    pub reserved: i64,
    /// Channel pinned by the caller, bypassing selection
    pub pinned_channel: Option<ChannelId>,
    /// Request path, used by affinity rules
    pub path: String,
    pub user_agent: Option<String>,
    pub headers: http::HeaderMap,
}

impl DispatchContext {
    /// Create a context with a fresh request id
    pub fn new(tenant: Tenant, model: impl Into<String>) -> Self {
        Self::with_request_id(new_request_id(), tenant, model)
    }

    /// Create a context under an id minted before the request was parsed
    pub fn with_request_id(request_id: String, tenant: Tenant, model: impl Into<String>) -> Self {
        let group = tenant.group.clone();

        Self {
            request_id,
            tenant,
            group,
            model: model.into(),
            upstream_model: None,
            retry_remaining: 0,
            used_channels: Vec::new(),
            quote: None,
            reserved: 0,
            pinned_channel: None,
            path: String::new(),
            user_agent: None,
            headers: http::HeaderMap::new(),
        }
    }

    /// Record that a channel is about to be tried
    pub fn record_attempt(&mut self, channel_id: ChannelId) {
        self.used_channels.push(channel_id);
    }

    /// Tried channels formatted as `a->b->c`
    pub fn attempt_trail(&self) -> String {
        self.used_channels
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("->")
    }
}
