use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::error::TaskError;
use crate::task::{Task, TaskStatus};

/// Task persistence
///
/// Every status transition goes through [`TaskStore::update_with_status`],
/// a compare-and-set on the status the caller last observed.
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn insert(&self, task: Task) -> Result<(), TaskError>;

    async fn get(&self, task_id: &str) -> Result<Task, TaskError>;

    /// Unfinished tasks, oldest first
    async fn unfinished(&self, limit: usize) -> Result<Vec<Task>, TaskError>;

    /// Unfinished tasks submitted before `cutoff`, oldest first
    async fn timed_out(&self, cutoff: i64, limit: usize) -> Result<Vec<Task>, TaskError>;

    /// Replace the stored task only if its status still equals `expected`
    ///
    /// Returns whether the write won.
    async fn update_with_status(&self, task: &Task, expected: TaskStatus) -> Result<bool, TaskError>;
}

/// Tasks held in process memory
#[derive(Debug, Default)]
pub struct InMemoryTaskStore {
    tasks: DashMap<String, Task>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn collect_unfinished(&self, limit: usize, filter: impl Fn(&Task) -> bool) -> Vec<Task> {
        let mut tasks: Vec<Task> = self
            .tasks
            .iter()
            .filter(|entry| !entry.status.is_finished() && filter(entry.value()))
            .map(|entry| entry.value().clone())
            .collect();

        tasks.sort_by(|a, b| a.submit_time.cmp(&b.submit_time).then_with(|| a.id.cmp(&b.id)));
        tasks.truncate(limit);
        tasks
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn insert(&self, task: Task) -> Result<(), TaskError> {
        match self.tasks.entry(task.id.clone()) {
            Entry::Occupied(_) => Err(TaskError::Duplicate(task.id)),
            Entry::Vacant(slot) => {
                slot.insert(task);
                Ok(())
            }
        }
    }

    async fn get(&self, task_id: &str) -> Result<Task, TaskError> {
        self.tasks
            .get(task_id)
            .map(|task| task.clone())
            .ok_or_else(|| TaskError::NotFound(task_id.to_owned()))
    }

    async fn unfinished(&self, limit: usize) -> Result<Vec<Task>, TaskError> {
        Ok(self.collect_unfinished(limit, |_| true))
    }

    async fn timed_out(&self, cutoff: i64, limit: usize) -> Result<Vec<Task>, TaskError> {
        Ok(self.collect_unfinished(limit, |task| task.submit_time < cutoff))
    }

    async fn update_with_status(&self, task: &Task, expected: TaskStatus) -> Result<bool, TaskError> {
        let mut stored = self
            .tasks
            .get_mut(&task.id)
            .ok_or_else(|| TaskError::NotFound(task.id.clone()))?;

        if stored.status != expected {
            return Ok(false);
        }

        *stored = task.clone();
        Ok(true)
    }
}
