use std::net::SocketAddr;

use secrecy::SecretString;
use serde::Deserialize;

use crate::health::HealthConfig;

/// HTTP server configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// Address to bind, defaults to `0.0.0.0:3000`
    #[serde(default)]
    pub listen_address: Option<SocketAddr>,
    /// Health endpoint
    #[serde(default)]
    pub health: HealthConfig,
}

/// Administrative API configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AdminConfig {
    /// Expose the `/api` admin routes
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Bearer token required on every admin route
    pub token: SecretString,
}

#[allow(clippy::missing_const_for_fn)]
fn default_enabled() -> bool {
    true
}
