//! Test server wrapper that starts Conduit on a random port

use std::net::SocketAddr;

use conduit_billing::QuotaStore;
use conduit_config::Config;
use conduit_server::{Gateway, Server};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::config::{ADMIN_TOKEN, TENANT_TOKEN};

/// A running test server instance
pub struct TestServer {
    addr: SocketAddr,
    gateway: Gateway,
    shutdown: CancellationToken,
    client: reqwest::Client,
}

impl TestServer {
    /// Start a test server with the given configuration
    ///
    /// Binds to port 0 for automatic port assignment. Background loops are
    /// not started; tests drive sweeps directly through the gateway.
    pub async fn start(config: Config) -> anyhow::Result<Self> {
        let server = Server::new(&config)?;
        let gateway = server.gateway().clone();
        let shutdown = CancellationToken::new();

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let serve_shutdown = shutdown.clone();
        tokio::spawn(async move {
            server.serve_on(listener, serve_shutdown).await.ok();
        });

        Ok(Self {
            addr,
            gateway,
            shutdown,
            client: reqwest::Client::new(),
        })
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{path}", self.addr)
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    pub const fn gateway(&self) -> &Gateway {
        &self.gateway
    }

    /// Chat completion as the regular tenant
    pub async fn chat(&self, model: &str) -> reqwest::Response {
        self.chat_with(TENANT_TOKEN, model, &[]).await
    }

    pub async fn chat_with(&self, token: &str, model: &str, headers: &[(&str, &str)]) -> reqwest::Response {
        let mut request = self
            .client
            .post(self.url("/v1/chat/completions"))
            .bearer_auth(token)
            .json(&serde_json::json!({
                "model": model,
                "messages": [{ "role": "user", "content": "Hello" }],
                "max_tokens": 50
            }));

        for (name, value) in headers {
            request = request.header(*name, *value);
        }

        request.send().await.unwrap()
    }

    /// Admin call, returning the JSON envelope
    pub async fn admin(&self, method: reqwest::Method, path: &str, body: Option<Value>) -> Value {
        let mut request = self.client.request(method, self.url(path)).bearer_auth(ADMIN_TOKEN);

        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request.send().await.unwrap();
        assert_eq!(response.status(), 200, "admin call to {path} failed");
        response.json().await.unwrap()
    }

    pub async fn balance(&self, tenant_id: i64) -> i64 {
        self.gateway.balances.balance(tenant_id).await.unwrap()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Poll `condition` until it holds, failing the test after two seconds
///
/// Health processing runs on background tasks, so its effects land shortly
/// after the response.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }

    panic!("condition not met within 2s");
}
