use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::{CallbackStatus, Task, TaskFailure, TaskId, TaskPriority, TaskStatus};

/// 控制面提交的任务请求
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskSubmission {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub task_type: String,
    pub action: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub priority: Option<TaskPriority>,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    /// 逗号分隔的依赖任务ID
    #[serde(default)]
    pub depends_on: Option<String>,
    #[serde(default)]
    pub callback_url: Option<String>,
    #[serde(default)]
    pub notify_on_complete: bool,
    /// 延迟执行的秒数
    #[serde(default)]
    pub schedule_seconds: Option<u64>,
    #[serde(default)]
    pub expires_in_seconds: Option<u64>,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl TaskSubmission {
    pub fn new(task_type: impl Into<String>, action: impl Into<String>, payload: Value) -> Self {
        Self {
            task_type: task_type.into(),
            action: action.into(),
            payload,
            ..Default::default()
        }
    }

    /// 解析依赖列表：忽略空白项，去重并保持原有顺序
    pub fn dependency_ids(&self) -> Vec<TaskId> {
        let mut ids: Vec<TaskId> = Vec::new();
        for id in self
            .depends_on
            .as_deref()
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|id| !id.is_empty())
        {
            if !ids.iter().any(|existing| existing == id) {
                ids.push(id.to_string());
            }
        }
        ids
    }

    /// 未指定名称时使用 `{type}_{action}`
    pub fn resolved_name(&self) -> String {
        self.name
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| format!("{}_{}", self.task_type.trim(), self.action.trim()))
    }
}

/// 提交结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmissionReceipt {
    pub success: bool,
    pub task_id: TaskId,
    pub status: TaskStatus,
    pub priority: TaskPriority,
}

/// 任务状态查询结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskView {
    pub task_id: TaskId,
    pub name: String,
    pub status: TaskStatus,
    pub result: Option<Value>,
    pub error: Option<TaskFailure>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub callback_status: CallbackStatus,
    pub callback_attempts: u32,
    pub callback_error: Option<String>,
}

impl From<&Task> for TaskView {
    fn from(task: &Task) -> Self {
        Self {
            task_id: task.id.clone(),
            name: task.name.clone(),
            status: task.status,
            result: task.result.clone(),
            error: task.error.clone(),
            retry_count: task.retry_count,
            max_retries: task.max_retries,
            callback_status: task.callback_status,
            callback_attempts: task.callback_attempts,
            callback_error: task.callback_error.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStatusResponse {
    pub success: bool,
    pub task: TaskView,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_submission_from_control_plane_json() {
        let submission: TaskSubmission = serde_json::from_value(json!({
            "type": "ai_call",
            "action": "chat",
            "payload": {"prompt": "hi"},
            "priority": "urgent",
            "depends_on": " a, b,,a ",
            "notify_on_complete": true
        }))
        .unwrap();

        assert_eq!(submission.priority, Some(TaskPriority::Urgent));
        assert_eq!(submission.dependency_ids(), vec!["a", "b"]);
        assert_eq!(submission.resolved_name(), "ai_call_chat");
        assert!(submission.tags.is_empty());
    }
}
