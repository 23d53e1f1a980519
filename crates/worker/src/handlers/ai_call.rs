use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use taskpilot_core::{
    models::Endpoint,
    traits::{HandlerContext, HandlerOutcome, TaskHandler},
    SchedulerError, SchedulerResult,
};
use taskpilot_gateway::EndpointGateway;
use tracing::info;

use crate::model_client::{ChatMessage, ChatRequest, ModelClient};

#[derive(Debug, Deserialize)]
struct AiCallParams {
    prompt: String,
    #[serde(default)]
    system: Option<String>,
    #[serde(default)]
    max_tokens: Option<u32>,
    #[serde(default)]
    temperature: Option<f64>,
    /// 指定端点名称时不做端点选择与重试
    #[serde(default)]
    endpoint: Option<String>,
}

impl AiCallParams {
    fn to_request(&self) -> SchedulerResult<ChatRequest> {
        if self.prompt.trim().is_empty() {
            return Err(SchedulerError::Validation("缺少必需参数: prompt".to_string()));
        }
        if self
            .temperature
            .is_some_and(|t| !t.is_finite() || !(0.0..=2.0).contains(&t))
        {
            return Err(SchedulerError::Validation(
                "temperature 必须在 0.0 到 2.0 之间".to_string(),
            ));
        }

        let mut messages = Vec::with_capacity(2);
        if let Some(system) = self.system.as_deref().filter(|s| !s.trim().is_empty()) {
            messages.push(ChatMessage::system(system));
        }
        messages.push(ChatMessage::user(self.prompt.clone()));
        Ok(ChatRequest {
            messages,
            max_tokens: self.max_tokens,
            temperature: self.temperature,
        })
    }
}

/// 通过端点网关调用 AI 模型
pub struct AiCallHandler {
    gateway: Arc<EndpointGateway>,
    client: Arc<dyn ModelClient>,
}

impl AiCallHandler {
    pub fn new(gateway: Arc<EndpointGateway>, client: Arc<dyn ModelClient>) -> Self {
        Self { gateway, client }
    }
}

#[async_trait]
impl TaskHandler for AiCallHandler {
    async fn execute(&self, context: &HandlerContext) -> SchedulerResult<HandlerOutcome> {
        let params: AiCallParams = context.params()?;
        let request = params.to_request()?;
        let call = |endpoint: Endpoint| {
            let client = self.client.clone();
            let request = request.clone();
            async move { client.complete(&endpoint, &request).await }
        };

        let (response, endpoint) = match params.endpoint.as_deref() {
            Some(name) => (
                self.gateway.call_endpoint(name, call).await?,
                name.to_string(),
            ),
            None => {
                let (response, endpoint) = self.gateway.call(call).await?;
                (response, endpoint.name)
            }
        };

        info!(
            "AI调用完成: task={}, endpoint={}, tokens={:?}",
            context.task.id, endpoint, response.total_tokens
        );
        Ok(HandlerOutcome::Completed(json!({
            "content": response.content,
            "model": response.model,
            "endpoint": endpoint,
            "total_tokens": response.total_tokens,
        })))
    }

    fn name(&self) -> &str {
        "ai_call"
    }

    fn description(&self) -> &str {
        "OpenAI 兼容的对话补全调用"
    }
}
