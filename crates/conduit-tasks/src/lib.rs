#![allow(clippy::must_use_candidate, clippy::missing_errors_doc)]

pub mod error;
pub mod fetcher;
pub mod reconciler;
pub mod store;
pub mod task;

pub use error::TaskError;
pub use fetcher::{FetchedTask, HttpTaskFetcher, TaskFetcher};
pub use reconciler::{SweepReport, TaskReconciler};
pub use store::{InMemoryTaskStore, TaskStore};
pub use task::{Task, TaskStatus};
