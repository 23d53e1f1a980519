use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    models::{Task, TaskId, TaskPriority, TaskStatus},
    SchedulerResult,
};

/// 任务进入终态后投递给回调地址的请求体
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallbackPayload {
    pub task_id: TaskId,
    pub status: TaskStatus,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub name: String,
    pub priority: TaskPriority,
    pub updated_at: DateTime<Utc>,
}

impl CallbackPayload {
    pub fn from_task(task: &Task) -> Self {
        Self {
            task_id: task.id.clone(),
            status: task.status,
            result: task.result.clone(),
            error: task.error.as_ref().map(ToString::to_string),
            name: task.name.clone(),
            priority: task.priority,
            updated_at: task.updated_at,
        }
    }
}

/// 回调投递通道
#[async_trait]
pub trait CallbackNotifier: Send + Sync {
    /// 单次投递尝试，重试策略由调用方负责
    async fn notify(&self, url: &str, payload: &CallbackPayload) -> SchedulerResult<()>;
}
