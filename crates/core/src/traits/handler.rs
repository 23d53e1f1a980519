//! 任务处理器接口定义
//!
//! 处理器是实际执行任务的组件，按 `(task_type, action)` 注册到
//! [`HandlerRegistry`](crate::HandlerRegistry)。系统内置的处理器类型：
//! - `market_analysis` 行情分析
//! - `ai_call` AI 模型调用
//! - `report_generation` 报告生成
//! - `storage_save` 存储写入
//! - `trade_execution` 交易执行（必须先通过风险闸门）
//!
//! ## 结果约定
//!
//! - `Ok(HandlerOutcome::Completed(value))` 任务成功，`value` 写入任务结果
//! - `Ok(HandlerOutcome::Refused(refusal))` 安全层拒绝，任务失败且不会重试
//! - `Err(error)` 本次尝试失败，是否重试由 [`SchedulerError::is_retryable`] 决定
//!
//! 超时由执行器强制执行，处理器无需自行检查截止时间。
//!
//! ## 实现示例
//!
//! ```rust,ignore
//! use async_trait::async_trait;
//! use taskpilot_core::traits::{HandlerContext, HandlerOutcome, TaskHandler};
//! use taskpilot_core::SchedulerResult;
//!
//! pub struct EchoHandler;
//!
//! #[async_trait]
//! impl TaskHandler for EchoHandler {
//!     async fn execute(&self, context: &HandlerContext) -> SchedulerResult<HandlerOutcome> {
//!         Ok(HandlerOutcome::Completed(context.task.payload.clone()))
//!     }
//!
//!     fn name(&self) -> &str {
//!         "echo"
//!     }
//! }
//! ```
//!
//! [`SchedulerError::is_retryable`]: crate::SchedulerError::is_retryable

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::{
    models::{SafetyRefusal, Task},
    SchedulerError, SchedulerResult,
};

/// 处理器执行结果
#[derive(Debug, Clone, PartialEq)]
pub enum HandlerOutcome {
    Completed(Value),
    Refused(SafetyRefusal),
}

/// 处理器执行上下文
#[derive(Debug, Clone)]
pub struct HandlerContext {
    pub task: Task,
    /// 当前尝试序号，从1开始
    pub attempt: u32,
    pub deadline: DateTime<Utc>,
}

impl HandlerContext {
    pub fn new(task: Task, now: DateTime<Utc>) -> Self {
        let deadline = now
            + chrono::Duration::from_std(task.timeout()).unwrap_or_else(|_| chrono::Duration::zero());
        Self {
            attempt: task.retry_count + 1,
            task,
            deadline,
        }
    }

    pub fn payload(&self) -> &Value {
        &self.task.payload
    }

    /// 将整个 payload 反序列化为处理器参数
    pub fn params<T: DeserializeOwned>(&self) -> SchedulerResult<T> {
        serde_json::from_value(self.task.payload.clone()).map_err(|e| {
            SchedulerError::Validation(format!(
                "任务 {} 的参数无效 ({}/{}): {e}",
                self.task.id, self.task.task_type, self.task.action
            ))
        })
    }

    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.task.payload.get(key).and_then(Value::as_str)
    }

    pub fn require_str(&self, key: &str) -> SchedulerResult<&str> {
        self.param_str(key)
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| SchedulerError::Validation(format!("缺少必需参数: {key}")))
    }
}

#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn execute(&self, context: &HandlerContext) -> SchedulerResult<HandlerOutcome>;

    fn name(&self) -> &str;

    fn description(&self) -> &str {
        ""
    }
}
