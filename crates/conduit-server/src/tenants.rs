use std::collections::HashMap;

use conduit_billing::InMemoryQuotaStore;
use conduit_config::TenantConfig;
use conduit_core::Tenant;
use secrecy::ExposeSecret;

/// Bearer token to tenant lookup built from the static tenant table
#[derive(Clone, Default)]
pub struct TenantDirectory {
    by_token: HashMap<String, Tenant>,
}

impl std::fmt::Debug for TenantDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TenantDirectory")
            .field("tenants", &self.by_token.len())
            .finish()
    }
}

impl TenantDirectory {
    /// Index tenants by token and open their balances
    pub fn from_configs(configs: &[TenantConfig], balances: &InMemoryQuotaStore) -> Self {
        let mut by_token = HashMap::with_capacity(configs.len());

        for config in configs {
            balances.set_balance(config.id, config.quota);

            by_token.insert(
                config.token.expose_secret().to_owned(),
                Tenant {
                    id: config.id,
                    name: config.name.clone(),
                    group: config.group.clone(),
                    admin: config.admin,
                },
            );
        }

        Self { by_token }
    }

    pub fn authenticate(&self, token: &str) -> Option<&Tenant> {
        self.by_token.get(token)
    }

    pub fn len(&self) -> usize {
        self.by_token.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_token.is_empty()
    }
}
