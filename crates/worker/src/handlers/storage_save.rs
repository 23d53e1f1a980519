use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use taskpilot_core::{
    traits::{HandlerContext, HandlerOutcome, TaskHandler},
    SchedulerError, SchedulerResult,
};
use tracing::info;

use crate::storage::{ContentFormat, SaveRequest, StorageRegistry, FILE_TARGET};

#[derive(Debug, Deserialize)]
struct StorageParams {
    #[serde(default = "default_target")]
    target: String,
    title: String,
    content: Value,
    #[serde(default)]
    format: Option<ContentFormat>,
    #[serde(default)]
    subdir: Option<String>,
}

fn default_target() -> String {
    FILE_TARGET.to_string()
}

/// 将内容写入指定的存储目标；非字符串内容按 JSON 保存
pub struct StorageSaveHandler {
    storage: Arc<StorageRegistry>,
}

impl StorageSaveHandler {
    pub fn new(storage: Arc<StorageRegistry>) -> Self {
        Self { storage }
    }
}

#[async_trait]
impl TaskHandler for StorageSaveHandler {
    async fn execute(&self, context: &HandlerContext) -> SchedulerResult<HandlerOutcome> {
        let params: StorageParams = context.params()?;
        let (content, format) = match params.content {
            Value::String(text) => (text, params.format.unwrap_or_default()),
            Value::Null => {
                return Err(SchedulerError::Validation("缺少必需参数: content".to_string()))
            }
            other => (
                serde_json::to_string_pretty(&other)?,
                params.format.unwrap_or(ContentFormat::Json),
            ),
        };

        let backend = self.storage.get(&params.target).await?;
        let stored = backend
            .save(&SaveRequest {
                title: params.title,
                content,
                format,
                subdir: params.subdir,
            })
            .await?;

        info!(
            "存储完成: task={}, target={}, location={}",
            context.task.id, stored.target, stored.location
        );
        Ok(HandlerOutcome::Completed(serde_json::to_value(stored)?))
    }

    fn name(&self) -> &str {
        "storage_save"
    }
}
