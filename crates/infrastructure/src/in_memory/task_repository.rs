use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use taskpilot_core::{
    models::{Task, TaskFilter, TaskId, TaskStatus},
    traits::{TaskRepository, TaskTransition},
    SchedulerError, SchedulerResult,
};
use tokio::sync::RwLock;
use tracing::debug;

struct Entry {
    seq: u64,
    task: Task,
}

#[derive(Default)]
struct State {
    tasks: HashMap<TaskId, Entry>,
    next_seq: u64,
}

/// 内存任务存储，所有转换在写锁内完成
#[derive(Clone, Default)]
pub struct InMemoryTaskRepository {
    state: Arc<RwLock<State>>,
}

impl InMemoryTaskRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.tasks.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl TaskRepository for InMemoryTaskRepository {
    async fn create(&self, task: &Task) -> SchedulerResult<Task> {
        let mut state = self.state.write().await;
        if state.tasks.contains_key(&task.id) {
            return Err(SchedulerError::DatabaseOperation(format!(
                "任务ID已存在: {}",
                task.id
            )));
        }
        let seq = state.next_seq;
        state.next_seq += 1;
        state.tasks.insert(
            task.id.clone(),
            Entry {
                seq,
                task: task.clone(),
            },
        );
        debug!("任务已保存: {} ({})", task.id, task.name);
        Ok(task.clone())
    }

    async fn get(&self, id: &str) -> SchedulerResult<Option<Task>> {
        let state = self.state.read().await;
        Ok(state.tasks.get(id).map(|entry| entry.task.clone()))
    }

    async fn list(&self, filter: &TaskFilter) -> SchedulerResult<Vec<Task>> {
        let state = self.state.read().await;
        let mut matched: Vec<&Entry> = state
            .tasks
            .values()
            .filter(|entry| filter.matches(&entry.task))
            .collect();
        matched.sort_by_key(|entry| (Reverse(entry.task.priority), entry.seq));

        let limit = filter.limit.unwrap_or(usize::MAX);
        Ok(matched
            .into_iter()
            .take(limit)
            .map(|entry| entry.task.clone())
            .collect())
    }

    async fn statuses(&self, ids: &[TaskId]) -> SchedulerResult<HashMap<TaskId, TaskStatus>> {
        let state = self.state.read().await;
        Ok(ids
            .iter()
            .filter_map(|id| state.tasks.get(id).map(|e| (id.clone(), e.task.status)))
            .collect())
    }

    async fn update_with(
        &self,
        id: &str,
        transition: TaskTransition<'_>,
    ) -> SchedulerResult<Task> {
        let mut state = self.state.write().await;
        let entry = state
            .tasks
            .get_mut(id)
            .ok_or_else(|| SchedulerError::TaskNotFound { id: id.to_string() })?;

        // 在副本上执行，失败时原记录保持不变
        let mut updated = entry.task.clone();
        transition(&mut updated)?;
        entry.task = updated.clone();
        Ok(updated)
    }

    async fn purge_terminal(&self, completed_before: DateTime<Utc>) -> SchedulerResult<u64> {
        let mut state = self.state.write().await;
        let before = state.tasks.len();
        state.tasks.retain(|_, entry| {
            let task = &entry.task;
            let purgeable = task.status.is_terminal()
                && task.callback_status != taskpilot_core::CallbackStatus::Pending
                && task.completed_at.is_some_and(|at| at < completed_before);
            !purgeable
        });
        Ok((before - state.tasks.len()) as u64)
    }
}
