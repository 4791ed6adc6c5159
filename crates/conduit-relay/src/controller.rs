//! Per-request retry loop
//!
//! One request reserves quota once, then walks channels until an attempt
//! succeeds, the error is not retryable, or the retry budget runs out.
//! Every failed attempt is handed to the health manager on a background
//! task. A request that delivers nothing is refunded exactly once.

use std::sync::Arc;
use std::time::Duration;

use conduit_billing::{BillingSession, Pricing, QuotaLedger, estimate_prompt_tokens};
use conduit_channels::{Channel, KeyError, SelectedKey};
use conduit_core::{ChannelError, ChannelId, DispatchContext, Quote, RelayError, Usage, fingerprint};
use conduit_health::HealthManager;
use conduit_routing::{AffinityMatch, AffinityRequest, ChannelSelector, SelectedChannel};
use conduit_tasks::{Task, TaskStore};
use secrecy::ExposeSecret;
use serde_json::Value;

use crate::adaptor::{AdaptorRegistry, UpstreamResponse, UpstreamTarget};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operation {
    Chat,
    SubmitTask,
}

enum Output {
    Chat(UpstreamResponse),
    Task(String),
}

struct Delivered {
    session: BillingSession,
    selected: SelectedChannel,
    key: SelectedKey,
    output: Output,
}

/// Result of a successful chat request
#[derive(Debug, Clone)]
pub struct ChatOutcome {
    pub body: Value,
    pub channel_id: ChannelId,
    pub usage: Usage,
    /// Quota charged
    pub quota: i64,
}

/// Orchestrates selection, provider calls and health reporting
pub struct RelayController {
    selector: Arc<ChannelSelector>,
    health: Arc<HealthManager>,
    ledger: QuotaLedger,
    pricing: Arc<Pricing>,
    adaptors: AdaptorRegistry,
    tasks: Arc<dyn TaskStore>,
    retry_times: u32,
    request_timeout: Duration,
}

impl std::fmt::Debug for RelayController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayController")
            .field("retry_times", &self.retry_times)
            .field("request_timeout", &self.request_timeout)
            .field("adaptors", &self.adaptors)
            .finish_non_exhaustive()
    }
}

impl RelayController {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        selector: Arc<ChannelSelector>,
        health: Arc<HealthManager>,
        ledger: QuotaLedger,
        pricing: Arc<Pricing>,
        adaptors: AdaptorRegistry,
        tasks: Arc<dyn TaskStore>,
        retry_times: u32,
        request_timeout: Duration,
    ) -> Self {
        Self {
            selector,
            health,
            ledger,
            pricing,
            adaptors,
            tasks,
            retry_times,
            request_timeout,
        }
    }

    pub const fn ledger(&self) -> &QuotaLedger {
        &self.ledger
    }

    pub fn tasks(&self) -> &Arc<dyn TaskStore> {
        &self.tasks
    }

    /// Relay a chat completion, charging the actual usage on success
    pub async fn chat(&self, ctx: &mut DispatchContext, request: &Value) -> Result<ChatOutcome, RelayError> {
        let delivered = self.dispatch(ctx, request, Operation::Chat).await?;

        let Output::Chat(response) = delivered.output else {
            return Err(RelayError::internal("adaptor returned a task for a chat request").with_request_id(&ctx.request_id));
        };

        let channel_id = delivered.selected.channel.id;
        let quota = Pricing::actual(delivered.session.quote(), &response.usage);
        delivered.session.finalize(quota, channel_id, response.usage).await;

        tracing::debug!(
            request_id = %ctx.request_id,
            channel_id,
            quota,
            prompt_tokens = response.usage.prompt_tokens,
            completion_tokens = response.usage.completion_tokens,
            "chat request completed"
        );

        Ok(ChatOutcome {
            body: response.body,
            channel_id,
            usage: response.usage,
            quota,
        })
    }

    /// Admit a long-running task
    ///
    /// The quoted amount is charged at admission and trued up later by the
    /// task reconciler.
    pub async fn submit_task(&self, ctx: &mut DispatchContext, request: &Value) -> Result<Task, RelayError> {
        let delivered = self.dispatch(ctx, request, Operation::SubmitTask).await?;

        let Output::Task(upstream_id) = delivered.output else {
            return Err(RelayError::internal("adaptor returned a chat response for a task").with_request_id(&ctx.request_id));
        };

        let channel_id = delivered.selected.channel.id;
        let quote = delivered.session.quote().clone();
        delivered.session.finalize(quote.amount, channel_id, Usage::default()).await;

        let mut task = Task::submitted(
            ctx.tenant.id,
            delivered.selected.group.clone(),
            ctx.model.clone(),
            channel_id,
            upstream_id,
            quote.amount,
        );
        task.private_key = Some(delivered.key.key);
        task.per_call_billing = quote.fixed_price;

        self.tasks
            .insert(task.clone())
            .await
            .map_err(|e| RelayError::internal(e).with_request_id(&ctx.request_id))?;

        tracing::info!(
            request_id = %ctx.request_id,
            task_id = %task.id,
            upstream_id = %task.upstream_id,
            channel_id,
            quota = task.quota,
            "task submitted"
        );

        Ok(task)
    }

    fn quote(&self, ctx: &DispatchContext, request: &Value, operation: Operation) -> Result<Quote, RelayError> {
        let (prompt_tokens, max_tokens) = match operation {
            Operation::Chat => (
                estimate_prompt_tokens(request),
                request
                    .get("max_tokens")
                    .or_else(|| request.get("max_completion_tokens"))
                    .and_then(Value::as_u64)
                    .map(|n| u32::try_from(n).unwrap_or(u32::MAX)),
            ),
            Operation::SubmitTask => (0, None),
        };

        self.pricing
            .quote(&ctx.model, &ctx.group, prompt_tokens, max_tokens)
            .map_err(|e| RelayError::InvalidRequest(e.to_string()))
    }

    async fn dispatch(
        &self,
        ctx: &mut DispatchContext,
        request: &Value,
        operation: Operation,
    ) -> Result<Delivered, RelayError> {
        if request.get("stream").and_then(Value::as_bool) == Some(true) {
            return Err(
                RelayError::InvalidRequest("streaming responses are not supported".to_owned())
                    .with_request_id(&ctx.request_id),
            );
        }

        let quote = self
            .quote(ctx, request, operation)
            .map_err(|e| e.with_request_id(&ctx.request_id))?;

        let session = self
            .ledger
            .pre_consume(ctx, quote)
            .await
            .map_err(|e| e.with_request_id(&ctx.request_id))?;

        let affinity = self
            .selector
            .affinity()
            .match_request(&AffinityRequest::from_context(ctx, Some(request)));

        let mut last_error = None;

        for attempt in 0..=self.retry_times {
            ctx.retry_remaining = self.retry_times - attempt;

            let pinned_id = if attempt == 0 { ctx.pinned_channel } else { None };

            let selected = match pinned_id {
                Some(channel_id) => self.selector.select_pinned(channel_id, &ctx.model),
                None => self
                    .selector
                    .select(&ctx.group, &ctx.model, &ctx.used_channels, affinity.as_ref()),
            };

            let selected = match selected {
                Ok(selected) => selected,
                Err(e) => {
                    tracing::debug!(request_id = %ctx.request_id, attempt, error = %e, "channel selection failed");
                    // running out of channels mid-retry surfaces the last upstream failure
                    if last_error.is_none() {
                        last_error = Some(e.into());
                    }
                    break;
                }
            };

            let channel_id = selected.channel.id;
            ctx.record_attempt(channel_id);

            if let Some(m) = &affinity
                && !self.selector.affinity().switch_on_success()
            {
                self.selector.affinity().record(m, channel_id);
            }

            let key = match selected.entry.next_key() {
                Ok(key) => key,
                Err(e) => {
                    tracing::debug!(request_id = %ctx.request_id, channel_id, error = %e, "channel lost its keys");
                    let error = key_loss(&e);
                    let retry = self.should_retry(ctx, &selected, affinity.as_ref(), pinned_id, &error);
                    last_error = Some(error);

                    if !retry {
                        break;
                    }
                    continue;
                }
            };

            let upstream_model = selected.channel.upstream_model(&ctx.model);
            ctx.upstream_model = Some(upstream_model.clone());

            let target = UpstreamTarget {
                channel_id,
                base_url: selected.channel.base_url.clone(),
                key: key.key.clone(),
                model: upstream_model,
            };

            tracing::debug!(
                request_id = %ctx.request_id,
                attempt,
                channel_id,
                key_index = key.index,
                model = %target.model,
                "dispatching attempt"
            );

            match self.invoke(&selected.channel, operation, &target, request).await {
                Ok(output) => {
                    if let Some(m) = &affinity {
                        if self.selector.affinity().switch_on_success() {
                            self.selector.affinity().record(m, channel_id);
                        }
                        if let Output::Chat(response) = &output {
                            self.selector.affinity().observe_usage(m, &response.usage);
                        }
                    }

                    return Ok(Delivered {
                        session,
                        selected,
                        key,
                        output,
                    });
                }
                Err(error) => {
                    self.health
                        .report(channel_error(&selected.channel, &key), error.clone());

                    if let Some(m) = &affinity
                        && m.forget_on_failure
                    {
                        self.selector.affinity().forget(m, channel_id);
                    }

                    let retry = self.should_retry(ctx, &selected, affinity.as_ref(), pinned_id, &error);

                    tracing::debug!(
                        request_id = %ctx.request_id,
                        attempt,
                        channel_id,
                        status = error.status(),
                        retry,
                        error = %error,
                        "attempt failed"
                    );

                    last_error = Some(error);

                    if !retry {
                        break;
                    }
                }
            }
        }

        if ctx.used_channels.len() > 1 {
            tracing::warn!(
                request_id = %ctx.request_id,
                channels = %ctx.attempt_trail(),
                "all attempts failed"
            );
        }

        let error = last_error.unwrap_or_else(|| RelayError::internal("no attempt was made"));

        session.refund(&error.to_string()).await;

        Err(error.with_request_id(&ctx.request_id))
    }

    async fn invoke(
        &self,
        channel: &Channel,
        operation: Operation,
        target: &UpstreamTarget,
        request: &Value,
    ) -> Result<Output, RelayError> {
        let adaptor = self.adaptors.get(channel.kind)?;

        let call = async {
            match operation {
                Operation::Chat => adaptor.chat(target, request).await.map(Output::Chat),
                Operation::SubmitTask => adaptor.submit_task(target, request).await.map(Output::Task),
            }
        };

        tokio::time::timeout(self.request_timeout, call)
            .await
            .unwrap_or_else(|_| {
                Err(RelayError::Channel {
                    status: 0,
                    message: format!("upstream request timed out after {}s", self.request_timeout.as_secs()),
                })
            })
    }

    fn should_retry(
        &self,
        ctx: &DispatchContext,
        selected: &SelectedChannel,
        affinity: Option<&AffinityMatch>,
        pinned_id: Option<ChannelId>,
        error: &RelayError,
    ) -> bool {
        if selected.pinned && affinity.is_some_and(|m| m.skip_retry_on_failure) {
            return false;
        }

        if pinned_id.is_some() || ctx.retry_remaining == 0 {
            return false;
        }

        self.health.should_retry(error)
    }
}

fn key_loss(error: &KeyError) -> RelayError {
    RelayError::Channel {
        status: 0,
        message: error.to_string(),
    }
}

fn channel_error(channel: &Channel, key: &SelectedKey) -> ChannelError {
    ChannelError {
        channel_id: channel.id,
        channel_kind: channel.kind.as_str().to_owned(),
        channel_name: channel.name.clone(),
        is_multi_key: channel.is_multi_key(),
        key_index: key.index,
        key_fingerprint: fingerprint(key.key.expose_secret()),
        auto_ban: channel.auto_ban,
    }
}
