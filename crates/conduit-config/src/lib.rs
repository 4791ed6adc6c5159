#![allow(clippy::must_use_candidate, clippy::missing_errors_doc)]

pub mod affinity;
pub mod billing;
pub mod channels;
pub mod dispatch;
mod duration;
mod env;
pub mod health;
mod loader;
pub mod server;
pub mod status_codes;
pub mod tasks;
pub mod telemetry;
pub mod tenants;

use serde::Deserialize;

pub use affinity::*;
pub use billing::*;
pub use channels::*;
pub use dispatch::*;
pub use env::ExpandError;
pub use health::*;
pub use server::*;
pub use status_codes::{StatusCodeRange, StatusCodeRangeError, StatusCodeRanges};
pub use tasks::*;
pub use telemetry::*;
pub use tenants::*;

/// Top-level Conduit configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// HTTP listener
    #[serde(default)]
    pub server: ServerConfig,
    /// Admin API, disabled when absent
    #[serde(default)]
    pub admin: Option<AdminConfig>,
    /// Retry loop and error classification
    #[serde(default)]
    pub dispatch: DispatchConfig,
    /// Channel probing
    #[serde(default)]
    pub health: ChannelHealthConfig,
    /// Upstream backends
    #[serde(default)]
    pub channels: Vec<ChannelConfig>,
    /// Sticky routing
    #[serde(default)]
    pub affinity: AffinityConfig,
    /// Prices and quota ledger
    #[serde(default)]
    pub billing: BillingConfig,
    /// Tenants and their tokens
    #[serde(default)]
    pub tenants: Vec<TenantConfig>,
    /// Long-running task reconciliation
    #[serde(default)]
    pub tasks: TasksConfig,
    /// Logging
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}
