use thiserror::Error;

/// Task storage and reconciliation errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    /// No task with this id
    #[error("task {0} not found")]
    NotFound(String),

    /// A task with this id already exists
    #[error("task {0} already exists")]
    Duplicate(String),

    /// Request to the upstream could not be completed
    #[error("upstream request failed: {0}")]
    Transport(String),

    /// Upstream answered with a non-success status
    #[error("upstream returned status {status}: {message}")]
    Upstream { status: u16, message: String },

    /// Upstream body could not be understood
    #[error("invalid upstream response: {0}")]
    InvalidResponse(String),

    /// Upstream reported a status outside the task lifecycle
    #[error("unknown task status '{status}' for task {task_id}")]
    UnknownStatus { task_id: String, status: String },
}
