//! Background reconciliation of long-running tasks
//!
//! Each sweep fails tasks that outlived the configured timeout, then polls
//! the remaining unfinished tasks channel by channel. Every terminal
//! transition is written with a compare-and-set on the previous status
//! before any quota moves, so a task is settled or refunded at most once
//! even when sweeps overlap with other writers.

use std::sync::Arc;

use conduit_billing::{Pricing, QuotaLedger};
use conduit_channels::ChannelStore;
use conduit_config::TasksConfig;
use conduit_core::{ChannelId, RunGuard, now_secs};
use itertools::Itertools;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::error::TaskError;
use crate::fetcher::{FetchedTask, TaskFetcher};
use crate::store::TaskStore;
use crate::task::{Task, TaskStatus};

/// Counters of one sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub timed_out: usize,
    /// Failed for a missing upstream id or channel
    pub failed: usize,
    /// Written with a new status or progress
    pub updated: usize,
    pub settled: usize,
    pub refunded: usize,
}

/// Polls upstream task status and runs the finalize/refund protocol
pub struct TaskReconciler {
    store: Arc<dyn TaskStore>,
    channels: Arc<ChannelStore>,
    fetcher: Arc<dyn TaskFetcher>,
    ledger: QuotaLedger,
    pricing: Arc<Pricing>,
    config: TasksConfig,
    guard: RunGuard,
}

impl std::fmt::Debug for TaskReconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskReconciler")
            .field("config", &self.config)
            .field("running", &self.guard.is_running())
            .finish_non_exhaustive()
    }
}

impl TaskReconciler {
    pub fn new(
        store: Arc<dyn TaskStore>,
        channels: Arc<ChannelStore>,
        fetcher: Arc<dyn TaskFetcher>,
        ledger: QuotaLedger,
        pricing: Arc<Pricing>,
        config: TasksConfig,
    ) -> Self {
        Self {
            store,
            channels,
            fetcher,
            ledger,
            pricing,
            config,
            guard: RunGuard::new(),
        }
    }

    /// Run a sweep every poll interval until `shutdown` fires
    pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            // first tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        self.sweep().await;
                    }
                }
            }

            tracing::debug!("task reconciler stopped");
        })
    }

    /// Run one sweep, returning `None` if another sweep is still running
    pub async fn sweep(&self) -> Option<SweepReport> {
        let Some(_permit) = self.guard.try_acquire() else {
            tracing::debug!("task sweep already running, skipping");
            return None;
        };

        let mut report = SweepReport::default();

        self.sweep_timed_out(&mut report).await;

        let tasks = match self.store.unfinished(self.config.batch_limit).await {
            Ok(tasks) => tasks,
            Err(e) => {
                tracing::warn!(error = %e, "failed to load unfinished tasks");
                return Some(report);
            }
        };

        let (orphaned, pending): (Vec<_>, Vec<_>) = tasks.into_iter().partition(|task| task.upstream_id.is_empty());

        for task in orphaned {
            self.fail_task(task, "upstream task id is empty", &mut report.failed, &mut report.refunded).await;
        }

        for (channel_id, tasks) in pending
            .into_iter()
            .into_group_map_by(|task| task.channel_id)
            .into_iter()
            .sorted_by_key(|(channel_id, _)| *channel_id)
        {
            self.poll_channel(channel_id, tasks, &mut report).await;
        }

        if report != SweepReport::default() {
            tracing::info!(
                timed_out = report.timed_out,
                failed = report.failed,
                updated = report.updated,
                settled = report.settled,
                refunded = report.refunded,
                "task sweep finished"
            );
        }

        Some(report)
    }

    async fn sweep_timed_out(&self, report: &mut SweepReport) {
        let Some(timeout) = self.config.timeout else {
            return;
        };

        let timeout_secs = i64::try_from(timeout.as_secs()).unwrap_or(i64::MAX);
        let cutoff = now_secs().saturating_sub(timeout_secs);

        let tasks = match self.store.timed_out(cutoff, self.config.batch_limit).await {
            Ok(tasks) => tasks,
            Err(e) => {
                tracing::warn!(error = %e, "failed to load timed out tasks");
                return;
            }
        };

        let reason = format!("task timed out ({} minutes)", timeout.as_secs() / 60);

        for task in tasks {
            self.fail_task(task, &reason, &mut report.timed_out, &mut report.refunded).await;
        }
    }

    /// Fail a task under compare-and-set and refund it when the write wins
    async fn fail_task(&self, mut task: Task, reason: &str, failed: &mut usize, refunded: &mut usize) {
        let previous = task.status;
        task.fail(reason, now_secs());

        match self.store.update_with_status(&task, previous).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::info!(task_id = %task.id, "task already transitioned, skipping");
                return;
            }
            Err(e) => {
                tracing::warn!(task_id = %task.id, error = %e, "failed to fail task");
                return;
            }
        }

        tracing::info!(task_id = %task.id, reason, "task failed");
        *failed += 1;

        if task.quota != 0 && self.ledger.refund_task(&task, reason).await {
            *refunded += 1;
        }
    }

    async fn poll_channel(&self, channel_id: ChannelId, tasks: Vec<Task>, report: &mut SweepReport) {
        tracing::debug!(channel_id, count = tasks.len(), "polling channel tasks");

        let entry = match self.channels.get(channel_id) {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!(channel_id, error = %e, "failed to get channel for tasks");
                let reason = format!("failed to get channel info, channel id: {channel_id}");
                for task in tasks {
                    self.fail_task(task, &reason, &mut report.failed, &mut report.refunded).await;
                }
                return;
            }
        };

        let base_url = entry.lock().base_url.clone();

        for task in tasks {
            let key = match &task.private_key {
                Some(key) => key.clone(),
                None => match entry.next_key() {
                    Ok(selected) => selected.key,
                    Err(e) => {
                        tracing::warn!(channel_id, task_id = %task.id, error = %e, "no key to poll task");
                        continue;
                    }
                },
            };

            let fetched = match self.fetcher.fetch(&base_url, &key, &task.upstream_id).await {
                Ok(fetched) => fetched,
                Err(e) => {
                    tracing::warn!(channel_id, task_id = %task.id, error = %e, "failed to fetch task");
                    continue;
                }
            };

            let task_id = task.id.clone();
            if let Err(e) = self.apply(task, fetched, report).await {
                tracing::warn!(channel_id, task_id = %task_id, error = %e, "failed to update task");
            }
        }
    }

    /// Apply an upstream result to a task, billing terminal transitions
    pub async fn apply(&self, mut task: Task, fetched: FetchedTask, report: &mut SweepReport) -> Result<(), TaskError> {
        let fetched = if fetched.status.is_empty() {
            FetchedTask::failed("upstream returned empty status")
        } else {
            fetched
        };

        let status = TaskStatus::parse(&fetched.status).ok_or_else(|| TaskError::UnknownStatus {
            task_id: task.id.clone(),
            status: fetched.status.clone(),
        })?;

        let before = task.snapshot();
        let previous = task.status;
        let now = now_secs();

        task.status = status;
        task.progress = status.default_progress().to_owned();

        let mut settle = false;
        let mut refund = false;

        match status {
            TaskStatus::Submitted | TaskStatus::Queued => {}
            TaskStatus::InProgress => {
                task.start_time.get_or_insert(now);
            }
            TaskStatus::Success => {
                task.finish_time.get_or_insert(now);
                if let Some(url) = fetched.result_url.as_ref().filter(|url| !url.starts_with("data:")) {
                    task.result_url = Some(url.clone());
                }
                settle = true;
            }
            TaskStatus::Failure => {
                task.finish_time.get_or_insert(now);
                task.fail_reason = Some(fetched.reason.clone().unwrap_or_else(|| "task failed".to_owned()));
                refund = task.quota != 0;
            }
        }

        if status != TaskStatus::Failure
            && let Some(progress) = fetched.progress.as_ref().filter(|p| !p.is_empty())
        {
            task.progress.clone_from(progress);
        }

        if status.is_finished() && previous != status {
            if !self.store.update_with_status(&task, previous).await? {
                tracing::warn!(task_id = %task.id, "task already transitioned by another worker, skipping billing");
                return Ok(());
            }
        } else if before != task.snapshot() {
            self.store.update_with_status(&task, previous).await?;
            report.updated += 1;
            return Ok(());
        } else {
            tracing::debug!(task_id = %task.id, "task unchanged");
            return Ok(());
        }

        report.updated += 1;
        tracing::info!(task_id = %task.id, status = %task.status, "task finished");

        if settle && self.settle(&mut task, &fetched).await {
            report.settled += 1;
            self.store.update_with_status(&task, task.status).await?;
        }

        if refund {
            let reason = task.fail_reason.clone().unwrap_or_default();
            if self.ledger.refund_task(&task, &reason).await {
                report.refunded += 1;
            }
        }

        Ok(())
    }

    /// Settle a completed task, returning whether its quota changed
    ///
    /// The upstream-reported cost wins over a token recount. Without
    /// either the pre-consumed amount stands.
    async fn settle(&self, task: &mut Task, fetched: &FetchedTask) -> bool {
        if task.per_call_billing {
            tracing::info!(task_id = %task.id, "task billed per call, skipping settlement");
            return false;
        }

        if let Some(quota) = self.fetcher.completion_quota(task, fetched).filter(|q| *q > 0) {
            return self.ledger.true_up(task, quota, "upstream reported cost").await != 0;
        }

        if fetched.total_tokens > 0 {
            let model_ratio = match self.pricing.model_ratio(&task.model) {
                Ok(ratio) => ratio,
                Err(e) => {
                    tracing::warn!(task_id = %task.id, error = %e, "cannot recount task quota");
                    return false;
                }
            };
            let group_ratio = self.pricing.group_ratio(&task.group);

            return self
                .ledger
                .true_up_by_tokens(
                    task,
                    fetched.total_tokens,
                    model_ratio,
                    group_ratio,
                    "recounted from token usage",
                )
                .await
                != 0;
        }

        false
    }
}
