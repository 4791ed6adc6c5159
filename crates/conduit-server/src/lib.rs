#![allow(clippy::must_use_candidate, clippy::missing_errors_doc)]

mod admin;
mod auth;
mod dispatch;
mod error;
mod gateway;
mod health;
mod tenants;
mod tester;

use std::net::SocketAddr;

use axum::Router;
use conduit_config::Config;
use conduit_relay::AdaptorRegistry;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

pub use dispatch::PIN_HEADER;
pub use error::{AdminResponse, ApiError};
pub use gateway::Gateway;
pub use tenants::TenantDirectory;
pub use tester::{ChannelTester, ProbeReport, SweepSummary};

/// Assembled server with all routes and middleware
pub struct Server {
    router: Router,
    gateway: Gateway,
    listen_address: SocketAddr,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("listen_address", &self.listen_address)
            .field("gateway", &self.gateway)
            .finish_non_exhaustive()
    }
}

impl Server {
    /// Build the server from configuration
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        Self::with_adaptors(config, AdaptorRegistry::builtin())
    }

    /// Build the server with a custom set of provider adaptors
    pub fn with_adaptors(config: &Config, adaptors: AdaptorRegistry) -> anyhow::Result<Self> {
        let listen_address = config
            .server
            .listen_address
            .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 3000)));

        let gateway = Gateway::with_adaptors(config, adaptors)?;

        let mut app = Router::new();

        if config.server.health.enabled {
            app = app.route(&config.server.health.path, axum::routing::get(health::health_handler));
        }

        app = app.merge(dispatch::router(gateway.clone()));

        match &gateway.admin_token {
            Some(token) => app = app.merge(admin::router(gateway.clone(), token.clone())),
            None => tracing::info!("admin api disabled"),
        }

        app = app.layer(TraceLayer::new_for_http());

        Ok(Self {
            router: app,
            gateway,
            listen_address,
        })
    }

    #[must_use]
    pub const fn listen_address(&self) -> SocketAddr {
        self.listen_address
    }

    pub const fn gateway(&self) -> &Gateway {
        &self.gateway
    }

    /// Start the task reconciler and scheduled channel tests
    pub fn spawn_background(&self, shutdown: &CancellationToken) -> Vec<JoinHandle<()>> {
        self.gateway.spawn_background(shutdown)
    }

    /// Consume the server and return the inner router
    ///
    /// Useful for testing when the caller manages the listener
    pub fn into_router(self) -> Router {
        self.router
    }

    /// Bind the configured address and serve until `shutdown` fires
    pub async fn serve(self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.listen_address).await?;
        self.serve_on(listener, shutdown).await
    }

    /// Serve on an already bound listener until `shutdown` fires
    pub async fn serve_on(self, listener: TcpListener, shutdown: CancellationToken) -> anyhow::Result<()> {
        let local_addr = listener.local_addr()?;
        tracing::info!(%local_addr, "server listening");

        axum::serve(listener, self.router)
            .with_graceful_shutdown(async move {
                shutdown.cancelled().await;
                tracing::info!("graceful shutdown initiated");
            })
            .await?;

        Ok(())
    }
}
