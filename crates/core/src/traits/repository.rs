//! 存储层接口定义
//!
//! 任务存储（Task Store）与通用状态存储（State Store）是系统中唯一的可变共享状态。
//! 所有状态变更都必须经过这里定义的原子操作完成，其他组件不允许直接修改记录。
//!
//! ## 原子性
//!
//! [`TaskRepository::update_with`] 是唯一的变更原语：实现方必须保证
//! "读取 → 应用转换 → 写回" 对同一任务是原子的。状态机规则由
//! [`Task`] 自身的方法（`start`、`complete` 等）执行，因此两个并发调用方
//! 对同一任务执行同一转换时，只有一个会成功，另一个得到
//! [`SchedulerError::InvalidTransition`](crate::SchedulerError::InvalidTransition)。
//!
//! ## 使用示例
//!
//! ```rust,ignore
//! let ready = repo.list_ready(4, Utc::now()).await?;
//! for task in ready {
//!     // 认领失败说明已被其他轮询者拿走
//!     if repo.acknowledge(&task.id, Utc::now()).await.is_ok() {
//!         spawn_worker(task);
//!     }
//! }
//! ```

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::{
    models::{CallbackStatus, Task, TaskFailure, TaskFilter, TaskId, TaskStats, TaskStatus},
    SchedulerResult,
};

/// 对单个任务执行的状态转换
pub type TaskTransition<'a> = &'a (dyn Fn(&mut Task) -> SchedulerResult<()> + Send + Sync);

/// 任务存储接口
#[async_trait]
pub trait TaskRepository: Send + Sync {
    /// 保存新任务
    async fn create(&self, task: &Task) -> SchedulerResult<Task>;

    async fn get(&self, id: &str) -> SchedulerResult<Option<Task>>;

    /// 按过滤条件列出任务，顺序为优先级降序、创建顺序升序
    async fn list(&self, filter: &TaskFilter) -> SchedulerResult<Vec<Task>>;

    /// 批量查询任务状态，不存在的ID不出现在结果中
    async fn statuses(&self, ids: &[TaskId]) -> SchedulerResult<HashMap<TaskId, TaskStatus>>;

    /// 原子地对任务应用一次状态转换，返回转换后的任务
    async fn update_with(&self, id: &str, transition: TaskTransition<'_>)
        -> SchedulerResult<Task>;

    /// 删除早于截止时间的终态任务，返回删除数量
    async fn purge_terminal(&self, completed_before: DateTime<Utc>) -> SchedulerResult<u64>;

    async fn find_missing(&self, ids: &[TaskId]) -> SchedulerResult<Vec<TaskId>> {
        let known = self.statuses(ids).await?;
        Ok(ids
            .iter()
            .filter(|id| !known.contains_key(*id))
            .cloned()
            .collect())
    }

    /// 过期扫描：将已过期的 Pending 任务转为 Expired
    async fn expire_overdue(&self, now: DateTime<Utc>) -> SchedulerResult<Vec<Task>> {
        let filter = TaskFilter {
            status: Some(TaskStatus::Pending),
            expires_before: Some(now),
            ..Default::default()
        };
        let mut expired = Vec::new();
        for task in self.list(&filter).await? {
            match self.update_with(&task.id, &|t| t.expire(now)).await {
                Ok(task) => expired.push(task),
                // 并发扫描或状态已变化
                Err(crate::SchedulerError::InvalidTransition { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(expired)
    }

    /// 返回最多 `limit` 个可运行任务：Pending、未过期、已到执行时间且依赖全部完成
    async fn list_ready(&self, limit: usize, now: DateTime<Utc>) -> SchedulerResult<Vec<Task>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        self.expire_overdue(now).await?;

        let pending = self
            .list(&TaskFilter::with_status(TaskStatus::Pending))
            .await?;
        let dependency_ids: Vec<TaskId> = pending
            .iter()
            .flat_map(|t| t.depends_on.iter().cloned())
            .collect();
        let dependency_statuses = self.statuses(&dependency_ids).await?;

        Ok(pending
            .into_iter()
            .filter(|t| t.is_schedulable(now))
            .filter(|t| {
                t.depends_on
                    .iter()
                    .all(|dep| dependency_statuses.get(dep) == Some(&TaskStatus::Completed))
            })
            .take(limit)
            .collect())
    }

    async fn acknowledge(&self, id: &str, now: DateTime<Utc>) -> SchedulerResult<Task> {
        self.update_with(id, &|t| t.acknowledge(now)).await
    }

    async fn mark_running(&self, id: &str, now: DateTime<Utc>) -> SchedulerResult<Task> {
        self.update_with(id, &|t| t.start(now)).await
    }

    async fn mark_completed(
        &self,
        id: &str,
        result: Value,
        now: DateTime<Utc>,
    ) -> SchedulerResult<Task> {
        self.update_with(id, &|t| t.complete(result.clone(), now))
            .await
    }

    async fn mark_failed(
        &self,
        id: &str,
        failure: TaskFailure,
        now: DateTime<Utc>,
    ) -> SchedulerResult<Task> {
        self.update_with(id, &|t| t.fail(failure.clone(), now)).await
    }

    async fn requeue(
        &self,
        id: &str,
        failure: TaskFailure,
        not_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> SchedulerResult<Task> {
        self.update_with(id, &|t| t.requeue(failure.clone(), not_before, now))
            .await
    }

    async fn retry(&self, id: &str, now: DateTime<Utc>) -> SchedulerResult<Task> {
        self.update_with(id, &|t| t.retry(now)).await
    }

    async fn cancel(&self, id: &str, now: DateTime<Utc>) -> SchedulerResult<Task> {
        self.update_with(id, &|t| t.cancel(now)).await
    }

    async fn record_callback(
        &self,
        id: &str,
        status: CallbackStatus,
        attempts: u32,
        error: Option<String>,
        now: DateTime<Utc>,
    ) -> SchedulerResult<Task> {
        self.update_with(id, &|t| {
            t.record_callback(status, attempts, error.clone(), now);
            Ok(())
        })
        .await
    }

    async fn pending_callbacks(&self, limit: usize) -> SchedulerResult<Vec<Task>> {
        let filter = TaskFilter {
            callback_status: Some(CallbackStatus::Pending),
            limit: Some(limit),
            ..Default::default()
        };
        self.list(&filter).await
    }

    /// 上一个进程遗留的已认领或运行中任务
    async fn list_in_flight(&self) -> SchedulerResult<Vec<Task>> {
        let mut tasks = self
            .list(&TaskFilter::with_status(TaskStatus::Acknowledged))
            .await?;
        tasks.extend(
            self.list(&TaskFilter::with_status(TaskStatus::Running))
                .await?,
        );
        Ok(tasks)
    }

    async fn stats(&self) -> SchedulerResult<TaskStats> {
        let tasks = self.list(&TaskFilter::default()).await?;
        Ok(TaskStats::from_tasks(&tasks))
    }
}

/// 持久化键值状态接口
///
/// 端点统计、风险预算、熔断器状态都以 `namespace/key → JSON` 的形式保存，
/// 进程重启后在启动阶段重新加载。
#[async_trait]
pub trait StateRepository: Send + Sync {
    async fn put(&self, namespace: &str, key: &str, value: &Value) -> SchedulerResult<()>;

    async fn get(&self, namespace: &str, key: &str) -> SchedulerResult<Option<Value>>;

    async fn load_namespace(&self, namespace: &str) -> SchedulerResult<Vec<(String, Value)>>;

    async fn delete(&self, namespace: &str, key: &str) -> SchedulerResult<bool>;
}
