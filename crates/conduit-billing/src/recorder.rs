use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use conduit_core::{ChannelId, now_secs};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};

/// Direction of a ledger movement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageKind {
    Consume,
    Refund,
}

/// One journal entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UsageLog {
    pub kind: UsageKind,
    pub tenant_id: i64,
    pub model: String,
    pub channel_id: Option<ChannelId>,
    /// Quota units moved
    pub quota: i64,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub elapsed_ms: u64,
    pub reason: String,
    /// Request or task the entry belongs to
    pub reference: Option<String>,
    pub created_at: i64,
}

impl UsageLog {
    pub fn new(kind: UsageKind, tenant_id: i64, model: impl Into<String>, quota: i64) -> Self {
        Self {
            kind,
            tenant_id,
            model: model.into(),
            channel_id: None,
            quota,
            prompt_tokens: 0,
            completion_tokens: 0,
            elapsed_ms: 0,
            reason: String::new(),
            reference: None,
            created_at: now_secs(),
        }
    }
}

/// Destination of journal entries
#[async_trait]
pub trait UsageSink: Send + Sync {
    async fn write(&self, log: UsageLog);
}

/// Sink that keeps every entry in memory
#[derive(Debug, Default)]
pub struct MemoryUsageSink {
    logs: Mutex<Vec<UsageLog>>,
}

impl MemoryUsageSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn logs(&self) -> Vec<UsageLog> {
        self.logs.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Entries of one kind
    pub fn of_kind(&self, kind: UsageKind) -> Vec<UsageLog> {
        self.logs().into_iter().filter(|log| log.kind == kind).collect()
    }
}

#[async_trait]
impl UsageSink for MemoryUsageSink {
    async fn write(&self, log: UsageLog) {
        tracing::debug!(
            kind = ?log.kind,
            tenant_id = log.tenant_id,
            model = %log.model,
            quota = log.quota,
            "usage recorded"
        );

        self.logs.lock().unwrap_or_else(|e| e.into_inner()).push(log);
    }
}

/// Sink that writes each entry to the `conduit::usage` log target
#[derive(Debug, Default)]
pub struct LogUsageSink;

#[async_trait]
impl UsageSink for LogUsageSink {
    async fn write(&self, log: UsageLog) {
        tracing::info!(
            target: "conduit::usage",
            kind = ?log.kind,
            tenant_id = log.tenant_id,
            model = %log.model,
            channel_id = ?log.channel_id,
            quota = log.quota,
            prompt_tokens = log.prompt_tokens,
            completion_tokens = log.completion_tokens,
            elapsed_ms = log.elapsed_ms,
            reason = %log.reason,
            reference = ?log.reference,
            "usage"
        );
    }
}

enum Message {
    Log(UsageLog),
    Flush(oneshot::Sender<()>),
}

/// Async journal writer that dispatches entries to a background task
///
/// Recording never blocks the response path.
#[derive(Clone)]
pub struct UsageRecorder {
    tx: mpsc::UnboundedSender<Message>,
}

impl UsageRecorder {
    /// Create a recorder and spawn its background task
    ///
    /// The task runs until every clone of the recorder is dropped.
    pub fn new(sink: Arc<dyn UsageSink>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(process_logs(rx, sink));

        Self { tx }
    }

    /// Enqueue a journal entry
    pub fn record(&self, log: UsageLog) {
        if let Err(e) = self.tx.send(Message::Log(log)) {
            tracing::warn!(error = %e, "failed to enqueue usage log, channel closed");
        }
    }

    /// Wait until every entry enqueued before this call has been written
    pub async fn flush(&self) {
        let (done, wait) = oneshot::channel();

        if self.tx.send(Message::Flush(done)).is_err() {
            return;
        }

        let _ = wait.await;
    }
}

impl std::fmt::Debug for UsageRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UsageRecorder").finish_non_exhaustive()
    }
}

async fn process_logs(mut rx: mpsc::UnboundedReceiver<Message>, sink: Arc<dyn UsageSink>) {
    while let Some(message) = rx.recv().await {
        match message {
            Message::Log(log) => sink.write(log).await,
            Message::Flush(done) => {
                let _ = done.send(());
            }
        }
    }

    tracing::debug!("usage recorder shutting down");
}
