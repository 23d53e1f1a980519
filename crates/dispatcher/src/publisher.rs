use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use metrics::counter;
use serde_json::{Map, Value};
use taskpilot_core::{
    config::ExecutorConfig,
    models::{
        CallbackStatus, SubmissionReceipt, Task, TaskFilter, TaskStats, TaskStatusResponse,
        TaskSubmission, TaskView,
    },
    traits::TaskRepository,
    HandlerRegistry, SchedulerError, SchedulerResult,
};
use tokio::sync::Notify;
use tracing::{debug, info};
use url::Url;

use crate::tracker::RunningTaskTracker;

/// 任务发布与管理入口
///
/// 提交的任务在写入存储之前完成全部校验，校验失败时不会持久化任何数据。
/// 依赖采用严格策略：引用不存在的任务ID会直接拒绝提交。
pub struct TaskPublisher {
    repository: Arc<dyn TaskRepository>,
    handlers: Arc<HandlerRegistry>,
    config: ExecutorConfig,
    tracker: Arc<RunningTaskTracker>,
    callback_signal: Arc<Notify>,
}

fn validation(message: impl Into<String>) -> SchedulerError {
    SchedulerError::Validation(message.into())
}

/// `now + seconds`，超出时间范围时视为无效提交
fn offset_from(now: DateTime<Utc>, seconds: u64, field: &str) -> SchedulerResult<DateTime<Utc>> {
    i64::try_from(seconds)
        .ok()
        .and_then(chrono::Duration::try_seconds)
        .and_then(|offset| now.checked_add_signed(offset))
        .ok_or_else(|| validation(format!("{field} 超出允许范围: {seconds}")))
}

impl TaskPublisher {
    pub fn new(
        repository: Arc<dyn TaskRepository>,
        handlers: Arc<HandlerRegistry>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            repository,
            handlers,
            config,
            tracker: Arc::new(RunningTaskTracker::new()),
            callback_signal: Arc::new(Notify::new()),
        }
    }

    /// 与执行器共享运行中任务表，取消时向处理器发送中断信号
    pub fn with_tracker(mut self, tracker: Arc<RunningTaskTracker>) -> Self {
        self.tracker = tracker;
        self
    }

    pub fn with_callback_signal(mut self, signal: Arc<Notify>) -> Self {
        self.callback_signal = signal;
        self
    }

    pub async fn submit(&self, submission: TaskSubmission) -> SchedulerResult<SubmissionReceipt> {
        let task = self.build_task(submission).await?;
        let task = self.repository.create(&task).await?;
        counter!("taskpilot_tasks_submitted_total", "type" => task.task_type.clone())
            .increment(1);
        info!(
            "任务已提交: {} ({}/{}, priority={})",
            task.id, task.task_type, task.action, task.priority
        );
        Ok(SubmissionReceipt {
            success: true,
            task_id: task.id,
            status: task.status,
            priority: task.priority,
        })
    }

    async fn build_task(&self, submission: TaskSubmission) -> SchedulerResult<Task> {
        let task_type = submission.task_type.trim();
        let action = submission.action.trim();
        if task_type.is_empty() || action.is_empty() {
            return Err(validation("type 和 action 不能为空"));
        }
        if !self.handlers.supports(task_type, action).await {
            return Err(validation(format!(
                "没有处理 {task_type}/{action} 的处理器"
            )));
        }

        let payload = match submission.payload.clone() {
            Value::Null => Value::Object(Map::new()),
            payload @ Value::Object(_) => payload,
            _ => return Err(validation("payload 必须是 JSON 对象")),
        };

        let timeout_seconds = submission
            .timeout_seconds
            .unwrap_or(self.config.default_timeout_seconds);
        if timeout_seconds == 0 || timeout_seconds > self.config.max_timeout_seconds {
            return Err(validation(format!(
                "timeout_seconds 必须在 1..={} 之间",
                self.config.max_timeout_seconds
            )));
        }

        let max_retries = submission
            .max_retries
            .unwrap_or(self.config.default_max_retries);
        if max_retries > self.config.max_allowed_retries {
            return Err(validation(format!(
                "max_retries 不能超过 {}",
                self.config.max_allowed_retries
            )));
        }

        let callback_url = match submission.callback_url.as_deref().map(str::trim) {
            Some(raw) if !raw.is_empty() => {
                let url = Url::parse(raw)
                    .map_err(|e| validation(format!("无效的 callback_url {raw}: {e}")))?;
                if !matches!(url.scheme(), "http" | "https") {
                    return Err(validation("callback_url 必须是 http(s) 地址"));
                }
                Some(url.to_string())
            }
            _ => None,
        };
        if submission.notify_on_complete && callback_url.is_none() {
            return Err(validation("notify_on_complete 需要提供 callback_url"));
        }

        let now = Utc::now();
        let not_before = match submission.schedule_seconds.filter(|s| *s > 0) {
            Some(s) => Some(offset_from(now, s, "schedule_seconds")?),
            None => None,
        };
        let expires_at = match submission.expires_in_seconds {
            Some(0) => return Err(validation("expires_in_seconds 必须大于0")),
            Some(s) => Some(offset_from(now, s, "expires_in_seconds")?),
            None => None,
        };
        if let (Some(start), Some(expiry)) = (not_before, expires_at) {
            if expiry <= start {
                return Err(validation("过期时间必须晚于计划执行时间"));
            }
        }

        let depends_on = submission.dependency_ids();
        if !depends_on.is_empty() {
            let missing = self.repository.find_missing(&depends_on).await?;
            if !missing.is_empty() {
                return Err(validation(format!(
                    "依赖的任务不存在: {}",
                    missing.join(",")
                )));
            }
        }

        let mut tags: Vec<String> = Vec::new();
        for tag in submission.tags.iter().map(|t| t.trim()).filter(|t| !t.is_empty()) {
            if !tags.iter().any(|existing| existing == tag) {
                tags.push(tag.to_string());
            }
        }

        let mut task = Task::new(submission.resolved_name(), task_type, action, payload, now);
        task.priority = submission.priority.unwrap_or_default();
        task.timeout_seconds = timeout_seconds;
        task.max_retries = max_retries;
        task.depends_on = depends_on;
        task.tags = tags;
        task.not_before = not_before;
        task.expires_at = expires_at;
        task.notify_on_complete = submission.notify_on_complete;
        task.callback_url = callback_url;
        Ok(task)
    }

    pub async fn get(&self, id: &str) -> SchedulerResult<Task> {
        self.repository
            .get(id)
            .await?
            .ok_or_else(|| SchedulerError::TaskNotFound { id: id.to_string() })
    }

    pub async fn status(&self, id: &str) -> SchedulerResult<TaskStatusResponse> {
        let task = self.get(id).await?;
        Ok(TaskStatusResponse {
            success: true,
            task: TaskView::from(&task),
        })
    }

    /// 取消任务；运行中的任务会收到中断信号
    pub async fn cancel(&self, id: &str) -> SchedulerResult<Task> {
        let task = self.repository.cancel(id, Utc::now()).await?;
        if self.tracker.interrupt(id) {
            info!("已向运行中的任务 {} 发送中断信号", id);
        }
        if task.callback_status == CallbackStatus::Pending {
            self.callback_signal.notify_one();
        }
        info!("任务已取消: {}", id);
        Ok(task)
    }

    /// 运维手动重试失败的任务
    pub async fn retry(&self, id: &str) -> SchedulerResult<Task> {
        let task = self.repository.retry(id, Utc::now()).await?;
        info!(
            "任务 {} 已重新排队 ({}/{})",
            id, task.retry_count, task.max_retries
        );
        Ok(task)
    }

    pub async fn list(&self, filter: &TaskFilter) -> SchedulerResult<Vec<TaskView>> {
        let tasks = self.repository.list(filter).await?;
        Ok(tasks.iter().map(TaskView::from).collect())
    }

    pub async fn stats(&self) -> SchedulerResult<TaskStats> {
        self.repository.stats().await
    }

    /// 等待任务进入终态，超时后返回当前状态
    pub async fn wait_for(&self, id: &str, timeout: Duration) -> SchedulerResult<Task> {
        let started = Instant::now();
        loop {
            let task = self.get(id).await?;
            if task.status.is_terminal() || started.elapsed() >= timeout {
                debug!("等待任务 {} 结束: {}", id, task.status);
                return Ok(task);
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}
