use std::fmt;

use conduit_billing::ChargedTask;
use conduit_core::{ChannelId, now_secs};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};

pub const PROGRESS_SUBMITTED: &str = "10%";
pub const PROGRESS_QUEUED: &str = "20%";
pub const PROGRESS_IN_PROGRESS: &str = "30%";
pub const PROGRESS_COMPLETE: &str = "100%";

/// Lifecycle of a long-running task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Submitted,
    Queued,
    InProgress,
    Success,
    Failure,
}

impl TaskStatus {
    /// Parse a wire status name (`SUBMITTED`, `IN_PROGRESS`, ...)
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "SUBMITTED" => Some(Self::Submitted),
            "QUEUED" => Some(Self::Queued),
            "IN_PROGRESS" => Some(Self::InProgress),
            "SUCCESS" => Some(Self::Success),
            "FAILURE" => Some(Self::Failure),
            _ => None,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Submitted => "SUBMITTED",
            Self::Queued => "QUEUED",
            Self::InProgress => "IN_PROGRESS",
            Self::Success => "SUCCESS",
            Self::Failure => "FAILURE",
        }
    }

    pub const fn is_finished(self) -> bool {
        matches!(self, Self::Success | Self::Failure)
    }

    /// Default progress shown for the status
    pub const fn default_progress(self) -> &'static str {
        match self {
            Self::Submitted => PROGRESS_SUBMITTED,
            Self::Queued => PROGRESS_QUEUED,
            Self::InProgress => PROGRESS_IN_PROGRESS,
            Self::Success | Self::Failure => PROGRESS_COMPLETE,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A long-running generation job admitted by the gateway
#[derive(Debug, Clone)]
pub struct Task {
    /// Public id handed to the caller
    pub id: String,
    /// Id assigned by the upstream, empty if submission never returned one
    pub upstream_id: String,
    pub channel_id: ChannelId,
    pub tenant_id: i64,
    pub group: String,
    pub model: String,
    pub status: TaskStatus,
    pub progress: String,
    /// Quota currently held for the task
    pub quota: i64,
    /// Credential used at submission, reused when polling
    pub private_key: Option<SecretString>,
    pub result_url: Option<String>,
    pub fail_reason: Option<String>,
    pub submit_time: i64,
    pub start_time: Option<i64>,
    pub finish_time: Option<i64>,
    /// Billed per call, so completion never adjusts the quota
    pub per_call_billing: bool,
}

/// Fields the reconciler compares to decide whether anything changed
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct TaskSnapshot {
    status: TaskStatus,
    progress: String,
    quota: i64,
    result_url: Option<String>,
    fail_reason: Option<String>,
    start_time: Option<i64>,
    finish_time: Option<i64>,
}

impl Task {
    /// Create a freshly submitted task
    pub fn submitted(
        tenant_id: i64,
        group: impl Into<String>,
        model: impl Into<String>,
        channel_id: ChannelId,
        upstream_id: impl Into<String>,
        quota: i64,
    ) -> Self {
        Self {
            id: format!("task_{}", uuid::Uuid::new_v4().simple()),
            upstream_id: upstream_id.into(),
            channel_id,
            tenant_id,
            group: group.into(),
            model: model.into(),
            status: TaskStatus::Submitted,
            progress: PROGRESS_SUBMITTED.to_owned(),
            quota,
            private_key: None,
            result_url: None,
            fail_reason: None,
            submit_time: now_secs(),
            start_time: None,
            finish_time: None,
            per_call_billing: false,
        }
    }

    pub(crate) fn snapshot(&self) -> TaskSnapshot {
        TaskSnapshot {
            status: self.status,
            progress: self.progress.clone(),
            quota: self.quota,
            result_url: self.result_url.clone(),
            fail_reason: self.fail_reason.clone(),
            start_time: self.start_time,
            finish_time: self.finish_time,
        }
    }

    /// Move to failure with a reason, stamping the finish time
    pub fn fail(&mut self, reason: impl Into<String>, now: i64) {
        self.status = TaskStatus::Failure;
        self.progress = PROGRESS_COMPLETE.to_owned();
        self.fail_reason = Some(reason.into());
        self.finish_time.get_or_insert(now);
    }
}

impl ChargedTask for Task {
    fn task_id(&self) -> &str {
        &self.id
    }

    fn tenant_id(&self) -> i64 {
        self.tenant_id
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn channel_id(&self) -> ChannelId {
        self.channel_id
    }

    fn quota(&self) -> i64 {
        self.quota
    }

    fn set_quota(&mut self, quota: i64) {
        self.quota = quota;
    }
}
