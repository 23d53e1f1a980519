use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use taskpilot_core::{
    traits::{HandlerContext, HandlerOutcome, TaskHandler},
    SchedulerError, SchedulerResult,
};
use tracing::info;

use crate::storage::{ContentFormat, SaveRequest, StorageRegistry};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportSection {
    pub heading: String,
    #[serde(default)]
    pub body: String,
}

#[derive(Debug, Deserialize)]
struct ReportParams {
    title: String,
    #[serde(default)]
    sections: Vec<ReportSection>,
    #[serde(default)]
    format: ContentFormat,
    #[serde(default)]
    storage_target: Option<String>,
    #[serde(default)]
    subdir: Option<String>,
}

pub fn render_markdown(title: &str, sections: &[ReportSection]) -> String {
    let mut out = format!("# {title}\n");
    for section in sections {
        out.push_str(&format!("\n## {}\n\n{}\n", section.heading, section.body.trim()));
    }
    out
}

pub struct ReportGenerationHandler {
    storage: Arc<StorageRegistry>,
}

impl ReportGenerationHandler {
    pub fn new(storage: Arc<StorageRegistry>) -> Self {
        Self { storage }
    }
}

#[async_trait]
impl TaskHandler for ReportGenerationHandler {
    async fn execute(&self, context: &HandlerContext) -> SchedulerResult<HandlerOutcome> {
        let params: ReportParams = context.params()?;
        if params.title.trim().is_empty() {
            return Err(SchedulerError::Validation("报告标题不能为空".to_string()));
        }

        let content = match params.format {
            ContentFormat::Json => serde_json::to_string_pretty(&json!({
                "title": params.title,
                "sections": params.sections,
            }))?,
            ContentFormat::Markdown | ContentFormat::Text => {
                render_markdown(&params.title, &params.sections)
            }
        };

        let stored = match params.storage_target.as_deref() {
            Some(target) => {
                let backend = self.storage.get(target).await?;
                Some(
                    backend
                        .save(&SaveRequest {
                            title: params.title.clone(),
                            content: content.clone(),
                            format: params.format,
                            subdir: params.subdir.clone(),
                        })
                        .await?,
                )
            }
            None => None,
        };

        info!(
            "报告已生成: task={}, title={}, sections={}",
            context.task.id,
            params.title,
            params.sections.len()
        );
        Ok(HandlerOutcome::Completed(json!({
            "title": params.title,
            "format": params.format,
            "content": content,
            "stored": stored,
        })))
    }

    fn name(&self) -> &str {
        "report_generation"
    }
}
