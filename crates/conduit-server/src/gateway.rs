use std::sync::Arc;

use anyhow::Context;
use conduit_billing::{InMemoryQuotaStore, LogUsageSink, Pricing, QuotaLedger, UsageRecorder};
use conduit_channels::ChannelStore;
use conduit_config::Config;
use conduit_health::HealthManager;
use conduit_relay::{AdaptorRegistry, RelayController};
use conduit_routing::{AffinityCache, ChannelSelector};
use conduit_tasks::{HttpTaskFetcher, InMemoryTaskStore, TaskReconciler, TaskStore};
use secrecy::SecretString;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::tenants::TenantDirectory;
use crate::tester::ChannelTester;

/// Every runtime component, wired from configuration
#[derive(Clone)]
pub struct Gateway {
    pub channels: Arc<ChannelStore>,
    pub health: Arc<HealthManager>,
    pub affinity: Arc<AffinityCache>,
    pub relay: Arc<RelayController>,
    pub tasks: Arc<dyn TaskStore>,
    pub tester: Arc<ChannelTester>,
    pub tenants: Arc<TenantDirectory>,
    pub balances: Arc<InMemoryQuotaStore>,
    pub admin_token: Option<SecretString>,
    reconciler: Option<Arc<TaskReconciler>>,
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("channels", &self.channels.len())
            .field("tenants", &self.tenants)
            .field("relay", &self.relay)
            .field("tester", &self.tester)
            .field("reconciler", &self.reconciler)
            .finish_non_exhaustive()
    }
}

impl Gateway {
    /// Build the gateway with the built-in provider adaptors
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        Self::with_adaptors(config, AdaptorRegistry::builtin())
    }

    pub fn with_adaptors(config: &Config, adaptors: AdaptorRegistry) -> anyhow::Result<Self> {
        let channels = Arc::new(ChannelStore::from_configs(&config.channels));
        let health = Arc::new(HealthManager::new(Arc::clone(&channels), &config.dispatch, &config.health));

        let affinity = Arc::new(AffinityCache::new(&config.affinity).context("invalid affinity configuration")?);
        let selector = Arc::new(ChannelSelector::new(
            Arc::clone(&channels),
            Arc::clone(&affinity),
            config.dispatch.auto_groups.clone(),
        ));

        let balances = Arc::new(InMemoryQuotaStore::new());
        let tenants = Arc::new(TenantDirectory::from_configs(&config.tenants, &balances));

        let recorder = UsageRecorder::new(Arc::new(LogUsageSink));
        let ledger = QuotaLedger::new(balances.clone(), recorder, config.billing.trust_quota);
        let pricing = Arc::new(Pricing::new(config.billing.clone()));

        let tasks: Arc<dyn TaskStore> = Arc::new(InMemoryTaskStore::new());

        let relay = Arc::new(RelayController::new(
            selector,
            Arc::clone(&health),
            ledger.clone(),
            Arc::clone(&pricing),
            adaptors.clone(),
            Arc::clone(&tasks),
            config.dispatch.retry_times,
            config.dispatch.request_timeout,
        ));

        let tester = Arc::new(ChannelTester::new(
            Arc::clone(&health),
            adaptors,
            config.dispatch.request_timeout,
            config.health.request_interval,
            config.health.auto_test_interval,
        ));

        let reconciler = if config.tasks.enabled {
            let fetcher = HttpTaskFetcher::new(config.dispatch.request_timeout).context("failed to build task fetcher")?;

            Some(Arc::new(TaskReconciler::new(
                Arc::clone(&tasks),
                Arc::clone(&channels),
                Arc::new(fetcher),
                ledger,
                pricing,
                config.tasks.clone(),
            )))
        } else {
            None
        };

        let admin_token = config
            .admin
            .as_ref()
            .filter(|admin| admin.enabled)
            .map(|admin| admin.token.clone());

        tracing::info!(
            channels = channels.len(),
            tenants = tenants.len(),
            admin = admin_token.is_some(),
            tasks = reconciler.is_some(),
            "gateway assembled"
        );

        Ok(Self {
            channels,
            health,
            affinity,
            relay,
            tasks,
            tester,
            tenants,
            balances,
            admin_token,
            reconciler,
        })
    }

    pub const fn reconciler(&self) -> Option<&Arc<TaskReconciler>> {
        self.reconciler.as_ref()
    }

    /// Start the task reconciler and scheduled channel tests
    pub fn spawn_background(&self, shutdown: &CancellationToken) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        if let Some(reconciler) = &self.reconciler {
            handles.push(Arc::clone(reconciler).spawn(shutdown.clone()));
        }

        if let Some(handle) = Arc::clone(&self.tester).spawn_auto_test(shutdown.clone()) {
            handles.push(handle);
        }

        handles
    }
}
