//! Channel probing
//!
//! A probe sends one tiny chat completion through the channel's adaptor and
//! hands the outcome to the health manager, which records the latency and
//! disables or re-enables the channel.

use std::sync::Arc;
use std::time::{Duration, Instant};

use conduit_channels::{ChannelEntry, ChannelStore, ChannelStoreError, SelectedKey};
use conduit_core::{RelayError, RunGuard, RunPermit};
use conduit_health::{HealthManager, ProbeAction, ProbeOutcome};
use conduit_relay::{AdaptorRegistry, UpstreamTarget};
use serde::Serialize;
use serde_json::json;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Result of probing one channel
#[derive(Debug, Clone, Serialize)]
pub struct ProbeReport {
    pub channel_id: i64,
    pub success: bool,
    pub message: String,
    /// Seconds the probe took
    pub time: f64,
    #[serde(skip)]
    pub action: Option<ProbeAction>,
}

/// Totals of one test-all sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepSummary {
    pub tested: usize,
    pub failed: usize,
    pub disabled: usize,
    pub enabled: usize,
}

/// Probes channels on demand and on a schedule
pub struct ChannelTester {
    channels: Arc<ChannelStore>,
    health: Arc<HealthManager>,
    adaptors: AdaptorRegistry,
    timeout: Duration,
    request_interval: Duration,
    auto_test_interval: Option<Duration>,
    guard: RunGuard,
}

impl std::fmt::Debug for ChannelTester {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelTester")
            .field("timeout", &self.timeout)
            .field("request_interval", &self.request_interval)
            .field("auto_test_interval", &self.auto_test_interval)
            .field("running", &self.guard.is_running())
            .finish_non_exhaustive()
    }
}

impl ChannelTester {
    pub fn new(
        health: Arc<HealthManager>,
        adaptors: AdaptorRegistry,
        timeout: Duration,
        request_interval: Duration,
        auto_test_interval: Option<Duration>,
    ) -> Self {
        Self {
            channels: Arc::clone(health.channels()),
            health,
            adaptors,
            timeout,
            request_interval,
            auto_test_interval,
            guard: RunGuard::new(),
        }
    }

    pub fn is_sweeping(&self) -> bool {
        self.guard.is_running()
    }

    /// Probe one channel, using `model` or the channel's test model
    pub async fn test_channel(&self, channel_id: i64, model: Option<&str>) -> Result<ProbeReport, ChannelStoreError> {
        let entry = self.channels.get(channel_id)?;
        Ok(self.probe(&entry, model).await)
    }

    async fn probe(&self, entry: &ChannelEntry, model: Option<&str>) -> ProbeReport {
        let channel = entry.snapshot();

        let Some(model) = model
            .filter(|m| !m.is_empty())
            .or_else(|| channel.probe_model())
            .map(ToOwned::to_owned)
        else {
            return ProbeReport {
                channel_id: channel.id,
                success: false,
                message: "channel has no model to test with".to_owned(),
                time: 0.0,
                action: None,
            };
        };

        // an auto-disabled channel may have no enabled slot left, probe its first key
        let key = entry.next_key().ok().or_else(|| {
            channel.keys.slot(0).map(|slot| SelectedKey {
                index: 0,
                key: slot.key.clone(),
            })
        });

        let Some(key) = key else {
            return ProbeReport {
                channel_id: channel.id,
                success: false,
                message: "channel has no keys".to_owned(),
                time: 0.0,
                action: None,
            };
        };

        let target = UpstreamTarget {
            channel_id: channel.id,
            base_url: channel.base_url.clone(),
            key: key.key,
            model: channel.upstream_model(&model),
        };

        let request = json!({
            "model": model,
            "messages": [{ "role": "user", "content": "hi" }],
            "max_tokens": 1,
        });

        let started = Instant::now();

        let error = match self.adaptors.get(channel.kind) {
            Ok(adaptor) => match tokio::time::timeout(self.timeout, adaptor.chat(&target, &request)).await {
                Ok(Ok(_)) => None,
                Ok(Err(e)) => Some(e),
                Err(_) => Some(RelayError::Channel {
                    status: 0,
                    message: format!("probe timed out after {}s", self.timeout.as_secs()),
                }),
            },
            Err(e) => Some(e),
        };

        let outcome = ProbeOutcome {
            channel_id: channel.id,
            key_index: key.index,
            elapsed: started.elapsed(),
            error,
        };

        let action = self.health.apply_probe(entry, &outcome);

        tracing::info!(
            channel_id = channel.id,
            model = %model,
            elapsed_ms = u64::try_from(outcome.elapsed.as_millis()).unwrap_or(u64::MAX),
            success = outcome.succeeded(),
            action = ?action,
            "channel probed"
        );

        ProbeReport {
            channel_id: channel.id,
            success: outcome.succeeded(),
            message: outcome.error.as_ref().map(ToString::to_string).unwrap_or_default(),
            time: outcome.elapsed.as_secs_f64(),
            action: Some(action),
        }
    }

    /// Probe every channel unless a sweep is already running
    pub async fn test_all(&self) -> Option<SweepSummary> {
        let permit = self.guard.try_acquire()?;
        Some(self.run_sweep(permit).await)
    }

    /// Start a sweep in the background, returning `false` if one is already running
    pub fn start_test_all(self: &Arc<Self>) -> bool {
        let Some(permit) = self.guard.try_acquire() else {
            return false;
        };

        let tester = Arc::clone(self);
        tokio::spawn(async move {
            tester.run_sweep(permit).await;
        });

        true
    }

    async fn run_sweep(&self, _permit: RunPermit) -> SweepSummary {
        let mut summary = SweepSummary::default();
        let entries = self.channels.all();

        tracing::info!(channels = entries.len(), "channel test sweep started");

        for (i, entry) in entries.iter().enumerate() {
            if i > 0 && !self.request_interval.is_zero() {
                tokio::time::sleep(self.request_interval).await;
            }

            let report = self.probe(entry, None).await;

            summary.tested += 1;
            if !report.success {
                summary.failed += 1;
            }

            match report.action {
                Some(ProbeAction::Disabled) => summary.disabled += 1,
                Some(ProbeAction::Enabled) => summary.enabled += 1,
                Some(ProbeAction::Unchanged) | None => {}
            }
        }

        tracing::info!(
            tested = summary.tested,
            failed = summary.failed,
            disabled = summary.disabled,
            enabled = summary.enabled,
            "channel test sweep finished"
        );

        summary
    }

    /// Run a sweep every `auto_test_interval` until `shutdown` fires
    ///
    /// Returns `None` when scheduled testing is not configured.
    pub fn spawn_auto_test(self: Arc<Self>, shutdown: CancellationToken) -> Option<JoinHandle<()>> {
        let interval = self.auto_test_interval?;

        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        if self.test_all().await.is_none() {
                            tracing::debug!("channel test sweep already running, skipping");
                        }
                    }
                }
            }

            tracing::debug!("channel auto test stopped");
        }))
    }
}
