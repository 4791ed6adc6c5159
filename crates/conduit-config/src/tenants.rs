use secrecy::SecretString;
use serde::Deserialize;

/// A tenant allowed to call the gateway
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TenantConfig {
    pub id: i64,
    pub name: String,
    /// Bearer token presented on dispatch routes
    pub token: SecretString,
    /// Routing group, `auto` walks `dispatch.auto_groups`
    #[serde(default = "default_group")]
    pub group: String,
    /// Opening balance in quota units
    #[serde(default)]
    pub quota: i64,
    /// May pin channels with the `x-conduit-channel` header
    #[serde(default)]
    pub admin: bool,
}

fn default_group() -> String {
    "default".to_owned()
}
