use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{SchedulerError, SchedulerResult};

pub type TaskId = String;

/// 生成按时间排序的任务ID
pub fn new_task_id() -> TaskId {
    uuid::Uuid::now_v7().to_string()
}

/// 任务优先级，数值越大越先调度
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase", try_from = "PriorityRepr")]
pub enum TaskPriority {
    Low = 1,
    #[default]
    Normal = 2,
    High = 3,
    Urgent = 4,
}

impl TaskPriority {
    pub fn level(self) -> i64 {
        self as i64
    }

    pub fn from_level(level: i64) -> Option<Self> {
        match level {
            1 => Some(TaskPriority::Low),
            2 => Some(TaskPriority::Normal),
            3 => Some(TaskPriority::High),
            4 => Some(TaskPriority::Urgent),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskPriority::Low => "low",
            TaskPriority::Normal => "normal",
            TaskPriority::High => "high",
            TaskPriority::Urgent => "urgent",
        }
    }
}

impl fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskPriority {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if let Ok(level) = trimmed.parse::<i64>() {
            return TaskPriority::from_level(level)
                .ok_or_else(|| SchedulerError::Validation(format!("无效的优先级: {s}")));
        }
        match trimmed.to_ascii_lowercase().as_str() {
            "low" => Ok(TaskPriority::Low),
            "normal" => Ok(TaskPriority::Normal),
            "high" => Ok(TaskPriority::High),
            "urgent" => Ok(TaskPriority::Urgent),
            _ => Err(SchedulerError::Validation(format!("无效的优先级: {s}"))),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum PriorityRepr {
    Level(i64),
    Name(String),
}

impl TryFrom<PriorityRepr> for TaskPriority {
    type Error = String;

    fn try_from(value: PriorityRepr) -> Result<Self, Self::Error> {
        match value {
            PriorityRepr::Level(level) => {
                TaskPriority::from_level(level).ok_or_else(|| format!("无效的优先级: {level}"))
            }
            PriorityRepr::Name(name) => name.parse().map_err(|e: SchedulerError| e.to_string()),
        }
    }
}

/// 任务生命周期状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Acknowledged,
    Running,
    Completed,
    Failed,
    Cancelled,
    Expired,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 7] = [
        TaskStatus::Pending,
        TaskStatus::Acknowledged,
        TaskStatus::Running,
        TaskStatus::Completed,
        TaskStatus::Failed,
        TaskStatus::Cancelled,
        TaskStatus::Expired,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Acknowledged => "acknowledged",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
            TaskStatus::Expired => "expired",
        }
    }

    /// 终态会触发回调通知
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled | TaskStatus::Expired
        )
    }

    /// 最终态不再接受任何状态转换；Failed 仍可被重新排队
    pub fn is_final(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Cancelled | TaskStatus::Expired
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskStatus::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| SchedulerError::Validation(format!("无效的任务状态: {s}")))
    }
}

/// 失败类别，供调用方以程序方式判断
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Validation,
    HandlerFailure,
    TimeoutExceeded,
    NoEndpointAvailable,
    AllAttemptsExhausted,
    BudgetFrozen,
    CircuitOpen,
    HandlerNotRegistered,
    Interrupted,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::Validation => "validation",
            FailureKind::HandlerFailure => "handler_failure",
            FailureKind::TimeoutExceeded => "timeout_exceeded",
            FailureKind::NoEndpointAvailable => "no_endpoint_available",
            FailureKind::AllAttemptsExhausted => "all_attempts_exhausted",
            FailureKind::BudgetFrozen => "budget_frozen",
            FailureKind::CircuitOpen => "circuit_open",
            FailureKind::HandlerNotRegistered => "handler_not_registered",
            FailureKind::Interrupted => "interrupted",
        }
    }

    pub fn is_safety_refusal(self) -> bool {
        matches!(self, FailureKind::BudgetFrozen | FailureKind::CircuitOpen)
    }

    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            FailureKind::HandlerFailure
                | FailureKind::TimeoutExceeded
                | FailureKind::NoEndpointAvailable
                | FailureKind::AllAttemptsExhausted
                | FailureKind::Interrupted
        )
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 终态失败原因：类别 + 可读信息
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl TaskFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.kind, self.message)
    }
}

/// 回调投递状态
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallbackStatus {
    #[default]
    NotRequested,
    Pending,
    Delivered,
    Dropped,
}

impl CallbackStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CallbackStatus::NotRequested => "not_requested",
            CallbackStatus::Pending => "pending",
            CallbackStatus::Delivered => "delivered",
            CallbackStatus::Dropped => "dropped",
        }
    }
}

impl FromStr for CallbackStatus {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "not_requested" => Ok(CallbackStatus::NotRequested),
            "pending" => Ok(CallbackStatus::Pending),
            "delivered" => Ok(CallbackStatus::Delivered),
            "dropped" => Ok(CallbackStatus::Dropped),
            other => Err(SchedulerError::Validation(format!("无效的回调状态: {other}"))),
        }
    }
}

/// 任务实体
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub name: String,
    pub task_type: String,
    pub action: String,
    pub payload: Value,
    pub priority: TaskPriority,
    pub status: TaskStatus,
    pub depends_on: Vec<TaskId>,
    pub tags: Vec<String>,
    pub timeout_seconds: u64,
    pub not_before: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub max_retries: u32,
    pub retry_count: u32,
    pub callback_url: Option<String>,
    pub notify_on_complete: bool,
    pub callback_status: CallbackStatus,
    pub callback_attempts: u32,
    pub callback_error: Option<String>,
    pub result: Option<Value>,
    pub error: Option<TaskFailure>,
    pub last_attempt_error: Option<TaskFailure>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(
        name: impl Into<String>,
        task_type: impl Into<String>,
        action: impl Into<String>,
        payload: Value,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: new_task_id(),
            name: name.into(),
            task_type: task_type.into(),
            action: action.into(),
            payload,
            priority: TaskPriority::Normal,
            status: TaskStatus::Pending,
            depends_on: Vec::new(),
            tags: Vec::new(),
            timeout_seconds: 300,
            not_before: None,
            expires_at: None,
            max_retries: 3,
            retry_count: 0,
            callback_url: None,
            notify_on_complete: false,
            callback_status: CallbackStatus::NotRequested,
            callback_attempts: 0,
            callback_error: None,
            result: None,
            error: None,
            last_attempt_error: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.not_before.map_or(true, |at| at <= now)
    }

    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// 待调度且未过期、已到可执行时间（不含依赖检查）
    pub fn is_schedulable(&self, now: DateTime<Utc>) -> bool {
        self.status == TaskStatus::Pending && !self.is_expired(now) && self.is_due(now)
    }

    fn ensure_from(&self, allowed: &[TaskStatus], to: TaskStatus) -> SchedulerResult<()> {
        if allowed.contains(&self.status) {
            Ok(())
        } else {
            Err(SchedulerError::InvalidTransition {
                id: self.id.clone(),
                from: self.status,
                to,
            })
        }
    }

    fn finish(&mut self, status: TaskStatus, now: DateTime<Utc>) {
        self.status = status;
        self.updated_at = now;
        self.completed_at = Some(now);
        self.callback_status = if self.notify_on_complete && self.callback_url.is_some() {
            CallbackStatus::Pending
        } else {
            CallbackStatus::NotRequested
        };
    }

    /// Pending → Acknowledged，执行器的原子认领
    pub fn acknowledge(&mut self, now: DateTime<Utc>) -> SchedulerResult<()> {
        self.ensure_from(&[TaskStatus::Pending], TaskStatus::Acknowledged)?;
        self.status = TaskStatus::Acknowledged;
        self.updated_at = now;
        Ok(())
    }

    pub fn start(&mut self, now: DateTime<Utc>) -> SchedulerResult<()> {
        self.ensure_from(
            &[TaskStatus::Pending, TaskStatus::Acknowledged],
            TaskStatus::Running,
        )?;
        self.status = TaskStatus::Running;
        self.started_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    pub fn complete(&mut self, result: Value, now: DateTime<Utc>) -> SchedulerResult<()> {
        self.ensure_from(&[TaskStatus::Running], TaskStatus::Completed)?;
        self.result = Some(result);
        self.error = None;
        self.finish(TaskStatus::Completed, now);
        Ok(())
    }

    pub fn fail(&mut self, failure: TaskFailure, now: DateTime<Utc>) -> SchedulerResult<()> {
        self.ensure_from(
            &[TaskStatus::Acknowledged, TaskStatus::Running],
            TaskStatus::Failed,
        )?;
        self.result = None;
        self.last_attempt_error = Some(failure.clone());
        self.error = Some(failure);
        self.finish(TaskStatus::Failed, now);
        Ok(())
    }

    /// 失败的执行尝试重新排队，消耗一次重试预算
    pub fn requeue(
        &mut self,
        failure: TaskFailure,
        not_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> SchedulerResult<()> {
        self.ensure_from(
            &[TaskStatus::Acknowledged, TaskStatus::Running],
            TaskStatus::Pending,
        )?;
        if !self.can_retry() {
            return Err(SchedulerError::RetryBudgetExhausted {
                id: self.id.clone(),
                max_retries: self.max_retries,
            });
        }
        self.retry_count += 1;
        self.status = TaskStatus::Pending;
        self.last_attempt_error = Some(failure);
        self.not_before = Some(not_before);
        self.started_at = None;
        self.updated_at = now;
        Ok(())
    }

    /// 运维手动重试：Failed → Pending
    pub fn retry(&mut self, now: DateTime<Utc>) -> SchedulerResult<()> {
        self.ensure_from(&[TaskStatus::Failed], TaskStatus::Pending)?;
        if !self.can_retry() {
            return Err(SchedulerError::RetryBudgetExhausted {
                id: self.id.clone(),
                max_retries: self.max_retries,
            });
        }
        self.retry_count += 1;
        self.status = TaskStatus::Pending;
        self.last_attempt_error = self.error.take();
        self.not_before = None;
        self.started_at = None;
        self.completed_at = None;
        self.callback_status = CallbackStatus::NotRequested;
        self.callback_attempts = 0;
        self.callback_error = None;
        self.updated_at = now;
        Ok(())
    }

    pub fn cancel(&mut self, now: DateTime<Utc>) -> SchedulerResult<()> {
        self.ensure_from(
            &[
                TaskStatus::Pending,
                TaskStatus::Acknowledged,
                TaskStatus::Running,
            ],
            TaskStatus::Cancelled,
        )?;
        self.finish(TaskStatus::Cancelled, now);
        Ok(())
    }

    pub fn expire(&mut self, now: DateTime<Utc>) -> SchedulerResult<()> {
        self.ensure_from(&[TaskStatus::Pending], TaskStatus::Expired)?;
        if !self.is_expired(now) {
            return Err(SchedulerError::Validation(format!(
                "任务 {} 尚未到达过期时间",
                self.id
            )));
        }
        self.finish(TaskStatus::Expired, now);
        Ok(())
    }

    pub fn record_callback(
        &mut self,
        status: CallbackStatus,
        attempts: u32,
        error: Option<String>,
        now: DateTime<Utc>,
    ) {
        self.callback_status = status;
        self.callback_attempts = attempts;
        self.callback_error = error;
        self.updated_at = now;
    }
}

/// 任务查询过滤条件
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub task_type: Option<String>,
    pub tag: Option<String>,
    pub callback_status: Option<CallbackStatus>,
    pub expires_before: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl TaskFilter {
    pub fn with_status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn matches(&self, task: &Task) -> bool {
        self.status.map_or(true, |s| task.status == s)
            && self
                .task_type
                .as_ref()
                .map_or(true, |t| &task.task_type == t)
            && self.tag.as_ref().map_or(true, |tag| task.tags.contains(tag))
            && self
                .callback_status
                .map_or(true, |s| task.callback_status == s)
            && self
                .expires_before
                .map_or(true, |cutoff| task.expires_at.is_some_and(|at| at <= cutoff))
    }
}

/// 任务统计
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskStats {
    pub total: u64,
    pub by_status: BTreeMap<String, u64>,
    pub by_priority: BTreeMap<String, u64>,
    pub avg_completion_seconds: Option<f64>,
}

impl TaskStats {
    pub fn from_tasks<'a>(tasks: impl IntoIterator<Item = &'a Task>) -> Self {
        let mut stats = TaskStats::default();
        let mut completion_total = 0.0;
        let mut completion_count = 0u64;

        for task in tasks {
            stats.total += 1;
            *stats
                .by_status
                .entry(task.status.as_str().to_string())
                .or_default() += 1;
            *stats
                .by_priority
                .entry(task.priority.as_str().to_string())
                .or_default() += 1;

            if task.status == TaskStatus::Completed {
                if let (Some(started), Some(completed)) = (task.started_at, task.completed_at) {
                    completion_total += (completed - started).num_milliseconds() as f64 / 1000.0;
                    completion_count += 1;
                }
            }
        }

        if completion_count > 0 {
            stats.avg_completion_seconds = Some(completion_total / completion_count as f64);
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use serde_json::json;

    fn running_task(now: DateTime<Utc>) -> Task {
        let mut task = Task::new("t", "ai_call", "chat", json!({}), now);
        task.acknowledge(now).unwrap();
        task.start(now).unwrap();
        task
    }

    #[test]
    fn test_priority_parsing_accepts_names_and_levels() {
        assert_eq!("URGENT".parse::<TaskPriority>().unwrap(), TaskPriority::Urgent);
        assert_eq!("1".parse::<TaskPriority>().unwrap(), TaskPriority::Low);
        assert!("9".parse::<TaskPriority>().is_err());

        let from_level: TaskPriority = serde_json::from_value(json!(3)).unwrap();
        let from_name: TaskPriority = serde_json::from_value(json!("high")).unwrap();
        assert_eq!(from_level, from_name);
        assert!(TaskPriority::Urgent > TaskPriority::Normal);
    }

    #[test]
    fn test_completing_twice_is_rejected() {
        let now = Utc::now();
        let mut task = running_task(now);
        task.complete(json!({"ok": true}), now).unwrap();

        let err = task.complete(json!({"ok": false}), now).unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidTransition { .. }));
        assert_eq!(task.result, Some(json!({"ok": true})));
        assert!(task.error.is_none());
    }

    #[test]
    fn test_requeue_is_bounded_by_max_retries() {
        let now = Utc::now();
        let mut task = running_task(now);
        task.max_retries = 1;

        let failure = TaskFailure::new(FailureKind::HandlerFailure, "boom");
        task.requeue(failure.clone(), now + ChronoDuration::seconds(2), now)
            .unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.retry_count, 1);
        assert!(!task.is_due(now));

        task.acknowledge(now).unwrap();
        task.start(now).unwrap();
        let err = task.requeue(failure, now, now).unwrap_err();
        assert!(matches!(err, SchedulerError::RetryBudgetExhausted { .. }));
        assert_eq!(task.retry_count, 1);
    }

    #[test]
    fn test_final_states_reject_every_transition() {
        let now = Utc::now();
        let mut task = Task::new("t", "storage_save", "note", json!({}), now);
        task.cancel(now).unwrap();

        assert!(task.start(now).is_err());
        assert!(task.cancel(now).is_err());
        assert!(task.retry(now).is_err());
        assert_eq!(task.status, TaskStatus::Cancelled);
    }

    #[test]
    fn test_terminal_transition_queues_callback_when_requested() {
        let now = Utc::now();
        let mut task = running_task(now);
        task.notify_on_complete = true;
        task.callback_url = Some("http://localhost/hook".to_string());

        task.fail(TaskFailure::new(FailureKind::TimeoutExceeded, "1s"), now)
            .unwrap();
        assert_eq!(task.callback_status, CallbackStatus::Pending);
        assert_eq!(task.error.as_ref().unwrap().kind, FailureKind::TimeoutExceeded);
    }

    #[test]
    fn test_expire_requires_deadline_passed() {
        let now = Utc::now();
        let mut task = Task::new("t", "ai_call", "chat", json!({}), now);
        task.expires_at = Some(now + ChronoDuration::seconds(10));
        assert!(task.expire(now).is_err());
        task.expire(now + ChronoDuration::seconds(10)).unwrap();
        assert_eq!(task.status, TaskStatus::Expired);
    }
}
